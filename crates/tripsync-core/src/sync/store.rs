//! In-memory cache of the last known state of one trip.
//!
//! Every slice carries a generation counter that is bumped whenever an
//! optimistic change is applied. Fetches remember the generation they started
//! under, and their result is dropped if it moved in the meantime, so a
//! response that was already in flight cannot overwrite a newer local edit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CachedData;
use crate::models::{Itinerary, Member, Tag, Trip};

use super::{Slice, SliceData, SyncError};

const EVENT_CAPACITY: usize = 64;

/// Why a slice changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Replaced by a server response.
    Fetched,
    /// A local edit not yet confirmed by the server.
    Optimistic,
    /// A failed edit was undone.
    RolledBack,
    /// Seeded from the disk cache.
    Restored,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    pub trip_id: Uuid,
    pub slice: Slice,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Default)]
struct SliceState {
    entry: Option<CachedData<SliceData>>,
    generation: u64,
    /// Optimistic changes whose write has not settled yet.
    pending: usize,
}

/// Handle to an optimistic change, returned by [`TripStore::begin_mutation`]
/// and consumed by [`TripStore::settle`].
#[derive(Debug)]
#[must_use = "an optimistic change must be settled"]
pub struct PendingMutation {
    slice: Slice,
    generation: u64,
    snapshot: Option<CachedData<SliceData>>,
}

impl PendingMutation {
    pub fn slice(&self) -> Slice {
        self.slice
    }
}

pub struct TripStore {
    trip_id: Uuid,
    state: RwLock<HashMap<Slice, SliceState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl TripStore {
    pub fn new(trip_id: Uuid) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            trip_id,
            state: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn trip_id(&self) -> Uuid {
        self.trip_id
    }

    /// Receive a [`StoreEvent`] for every change. Slow receivers see
    /// `Lagged` and should re-read whatever they display.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, slice: Slice, origin: ChangeOrigin) {
        // No receivers is fine
        let _ = self.events.send(StoreEvent {
            trip_id: self.trip_id,
            slice,
            origin,
        });
    }

    // ===== Accessors =====

    pub async fn get(&self, slice: Slice) -> Option<CachedData<SliceData>> {
        self.state
            .read()
            .await
            .get(&slice)
            .and_then(|s| s.entry.clone())
    }

    pub async fn trip(&self) -> Option<Trip> {
        match self.get(Slice::Trip).await?.data {
            SliceData::Trip(trip) => Some(trip),
            _ => None,
        }
    }

    pub async fn itinerary(&self) -> Option<Itinerary> {
        match self.get(Slice::Itinerary).await?.data {
            SliceData::Itinerary(itinerary) => Some(itinerary),
            _ => None,
        }
    }

    pub async fn members(&self) -> Option<Vec<Member>> {
        match self.get(Slice::Members).await?.data {
            SliceData::Members(members) => Some(members),
            _ => None,
        }
    }

    pub async fn tags(&self) -> Option<Vec<Tag>> {
        match self.get(Slice::Tags).await?.data {
            SliceData::Tags(tags) => Some(tags),
            _ => None,
        }
    }

    /// Every loaded slice at once, read under a single lock.
    pub async fn snapshot(&self) -> TripSnapshot {
        let state = self.state.read().await;
        let mut snapshot = TripSnapshot {
            trip_id: self.trip_id,
            ..Default::default()
        };
        for entry in state.values().filter_map(|s| s.entry.as_ref()) {
            match &entry.data {
                SliceData::Trip(trip) => snapshot.trip = Some(trip.clone()),
                SliceData::Itinerary(itinerary) => snapshot.itinerary = Some(itinerary.clone()),
                SliceData::Members(members) => snapshot.members = Some(members.clone()),
                SliceData::Tags(tags) => snapshot.tags = Some(tags.clone()),
            }
        }
        snapshot
    }

    pub async fn is_loaded(&self, slice: Slice) -> bool {
        self.state
            .read()
            .await
            .get(&slice)
            .is_some_and(|s| s.entry.is_some())
    }

    /// When the data currently held for `slice` was last confirmed by the
    /// server.
    pub async fn fetched_at(&self, slice: Slice) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .get(&slice)
            .and_then(|s| s.entry.as_ref().map(|e| e.cached_at))
    }

    pub async fn generation(&self, slice: Slice) -> u64 {
        self.state
            .read()
            .await
            .get(&slice)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    pub async fn has_pending(&self, slice: Slice) -> bool {
        self.state
            .read()
            .await
            .get(&slice)
            .is_some_and(|s| s.pending > 0)
    }

    // ===== Writes =====

    /// Seed a slice from disk. Ignored once the slice holds anything, so a
    /// late restore never replaces fresher data.
    pub async fn restore(&self, entry: CachedData<SliceData>) -> bool {
        let slice = entry.data.slice();
        {
            let mut state = self.state.write().await;
            let current = state.entry(slice).or_default();
            if current.entry.is_some() {
                return false;
            }
            current.entry = Some(entry);
        }
        self.notify(slice, ChangeOrigin::Restored);
        true
    }

    /// Store a server response for a fetch that started at
    /// `started_generation`.
    ///
    /// Returns `false` (and keeps the current data) when an optimistic change
    /// began after the fetch started or is still awaiting its write.
    pub async fn apply_fetch(&self, data: SliceData, started_generation: u64) -> bool {
        self.apply_fetched(CachedData::new(data), started_generation).await
    }

    /// [`apply_fetch`](Self::apply_fetch) for a response already stamped
    /// with the time it arrived.
    pub async fn apply_fetched(&self, entry: CachedData<SliceData>, started_generation: u64) -> bool {
        let slice = entry.data.slice();
        {
            let mut state = self.state.write().await;
            let current = state.entry(slice).or_default();
            if current.generation != started_generation || current.pending > 0 {
                debug!(
                    trip_id = %self.trip_id,
                    %slice,
                    started_generation,
                    generation = current.generation,
                    pending = current.pending,
                    "Discarding fetch that raced a local change"
                );
                return false;
            }
            current.entry = Some(entry);
        }
        self.notify(slice, ChangeOrigin::Fetched);
        true
    }

    /// Apply an optimistic change to a copy of `slice` and publish it.
    ///
    /// `change` may refuse by returning an error, in which case nothing is
    /// modified. The returned [`PendingMutation`] holds the prior state for
    /// rollback.
    pub async fn begin_mutation<T>(
        &self,
        slice: Slice,
        change: impl FnOnce(&mut SliceData) -> Result<T, SyncError>,
    ) -> Result<(PendingMutation, T), SyncError> {
        let pending;
        let output;
        {
            let mut state = self.state.write().await;
            let current = state.entry(slice).or_default();
            let snapshot = current.entry.clone().ok_or(SyncError::NotLoaded(slice))?;

            let mut draft = snapshot.data.clone();
            output = change(&mut draft)?;

            current.generation += 1;
            current.pending += 1;
            current.entry = Some(CachedData::with_timestamp(draft, snapshot.cached_at));
            pending = PendingMutation {
                slice,
                generation: current.generation,
                snapshot: Some(snapshot),
            };
        }
        self.notify(slice, ChangeOrigin::Optimistic);
        Ok((pending, output))
    }

    /// Mark an optimistic change as settled.
    ///
    /// Either way the generation moves on, so no fetch issued before the
    /// write finished can be applied. On failure the slice is also put back
    /// to its state before the change, unless another change started since.
    /// Returns whether it rolled back.
    pub async fn settle(&self, mut pending: PendingMutation, success: bool) -> bool {
        let slice = pending.slice;
        let rolled_back = {
            let mut state = self.state.write().await;
            let current = state.entry(slice).or_default();
            current.pending = current.pending.saturating_sub(1);
            if success {
                // Fetches that started while the write was in flight may
                // have read the server before it committed
                current.generation += 1;
                false
            } else if current.generation == pending.generation {
                current.entry = pending.snapshot.take();
                // Fetches that started while the change was applied must
                // not land on top of the restored state
                current.generation += 1;
                true
            } else {
                warn!(
                    trip_id = %self.trip_id,
                    %slice,
                    "Newer local change in progress, leaving rollback to revalidation"
                );
                false
            }
        };
        if rolled_back {
            self.notify(slice, ChangeOrigin::RolledBack);
        }
        rolled_back
    }

    pub async fn clear(&self) {
        let slices: Vec<Slice> = {
            let mut state = self.state.write().await;
            let slices = state
                .iter()
                .filter(|(_, s)| s.entry.is_some())
                .map(|(slice, _)| *slice)
                .collect();
            for current in state.values_mut() {
                current.entry = None;
                current.generation += 1;
            }
            slices
        };
        for slice in slices {
            self.notify(slice, ChangeOrigin::Cleared);
        }
    }
}

/// Owned copy of every loaded slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TripSnapshot {
    pub trip_id: Uuid,
    pub trip: Option<Trip>,
    pub itinerary: Option<Itinerary>,
    pub members: Option<Vec<Member>>,
    pub tags: Option<Vec<Tag>>,
}

impl TripSnapshot {
    pub fn is_complete(&self) -> bool {
        self.trip.is_some() && self.itinerary.is_some() && self.members.is_some() && self.tags.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
