//! Fetching and revalidating slices.
//!
//! At most one request per slice is in flight at a time. Callers that ask
//! for a slice while a request for it is running join that request and all
//! receive its result. The request itself runs on a spawned task, so a
//! caller that gives up waiting does not cancel it for the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cache::{CacheManager, CachedData};

use super::{Slice, SliceData, SyncError, TripBackend, TripStore};

/// Default window in which a repeated `load` is answered from memory.
pub const DEFAULT_DEDUPE_INTERVAL: Duration = Duration::from_secs(2);

type SharedFetch = Shared<BoxFuture<'static, Result<(), SyncError>>>;

struct InFlight {
    id: u64,
    /// Store generation the request started under.
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct FetchState {
    inflight: HashMap<Slice, InFlight>,
    last_success: HashMap<Slice, Instant>,
}

struct Inner<B> {
    backend: Arc<B>,
    store: Arc<TripStore>,
    cache: Option<Arc<CacheManager>>,
    dedupe_interval: Duration,
    state: Mutex<FetchState>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle that keeps a [`TripStore`] in step with the
/// backend.
pub struct Revalidator<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Revalidator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: TripBackend> Revalidator<B> {
    pub fn new(
        backend: Arc<B>,
        store: Arc<TripStore>,
        cache: Option<Arc<CacheManager>>,
        dedupe_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                cache,
                dedupe_interval,
                state: Mutex::new(FetchState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn store(&self) -> &Arc<TripStore> {
        &self.inner.store
    }

    /// Fetch `slice` now, or join the request already running for it.
    ///
    /// A running request is only joined if no local change was made since it
    /// started; otherwise its result would be discarded and a new one is
    /// issued.
    pub async fn revalidate(&self, slice: Slice) -> Result<(), SyncError> {
        let fetch = {
            let mut state = self.inner.state.lock().await;
            let generation = self.inner.store.generation(slice).await;
            match state.inflight.get(&slice) {
                Some(running) if running.generation == generation => {
                    debug!(trip_id = %self.inner.store.trip_id(), %slice, "Joining in-flight fetch");
                    running.fetch.clone()
                }
                _ => {
                    let started = self.start(slice, generation);
                    let fetch = started.fetch.clone();
                    state.inflight.insert(slice, started);
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Like [`revalidate`](Self::revalidate), but skips the request when the
    /// slice was fetched successfully within the dedupe interval.
    pub async fn load(&self, slice: Slice) -> Result<(), SyncError> {
        if self.is_fresh(slice).await {
            debug!(trip_id = %self.inner.store.trip_id(), %slice, "Recently fetched, skipping");
            return Ok(());
        }
        self.revalidate(slice).await
    }

    pub async fn revalidate_all(&self) -> Result<(), SyncError> {
        let results =
            futures::future::join_all(Slice::ALL.into_iter().map(|slice| self.revalidate(slice)))
                .await;
        results.into_iter().collect()
    }

    pub async fn load_all(&self) -> Result<(), SyncError> {
        let results =
            futures::future::join_all(Slice::ALL.into_iter().map(|slice| self.load(slice))).await;
        results.into_iter().collect()
    }

    /// Revalidate every slice each `period` until `shutdown` flips to true or
    /// its sender goes away.
    pub fn spawn_interval(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.revalidate_all().await {
                            warn!(trip_id = %this.inner.store.trip_id(), error = %e, "Periodic revalidation failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(trip_id = %this.inner.store.trip_id(), "Periodic revalidation stopped");
        })
    }

    async fn is_fresh(&self, slice: Slice) -> bool {
        let recent = {
            let state = self.inner.state.lock().await;
            state
                .last_success
                .get(&slice)
                .is_some_and(|at| at.elapsed() < self.inner.dedupe_interval)
        };
        recent && self.inner.store.is_loaded(slice).await
    }

    /// Spawn the request. Must be called with the state lock held so the
    /// task cannot unregister itself before it is registered.
    fn start(&self, slice: Slice, generation: u64) -> InFlight {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(slice, generation, id).await });
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Task(e.to_string())),
            }
        }
        .boxed()
        .shared();
        InFlight {
            id,
            generation,
            fetch,
        }
    }

    async fn run(&self, slice: Slice, generation: u64, id: u64) -> Result<(), SyncError> {
        let trip_id = self.inner.store.trip_id();
        debug!(%trip_id, %slice, generation, "Fetching");

        let outcome = match self.fetch_slice(slice).await {
            Ok(data) => {
                let fetched = CachedData::new(data);
                let applied = self.inner.store.apply_fetched(fetched.clone(), generation).await;
                if applied {
                    self.persist(&fetched);
                }
                Ok(applied)
            }
            Err(e) => {
                warn!(%trip_id, %slice, error = %e, "Fetch failed");
                Err(SyncError::fetch(slice, &e))
            }
        };

        let mut state = self.inner.state.lock().await;
        if state.inflight.get(&slice).is_some_and(|running| running.id == id) {
            state.inflight.remove(&slice);
        }
        // A discarded response leaves the slice as stale as before
        if matches!(outcome, Ok(true)) {
            state.last_success.insert(slice, Instant::now());
        }
        outcome.map(|_| ())
    }

    async fn fetch_slice(&self, slice: Slice) -> anyhow::Result<SliceData> {
        let backend = &self.inner.backend;
        let trip_id = self.inner.store.trip_id();
        Ok(match slice {
            Slice::Trip => SliceData::Trip(backend.fetch_trip(trip_id).await?),
            Slice::Itinerary => SliceData::Itinerary(backend.fetch_itinerary(trip_id).await?),
            Slice::Members => SliceData::Members(backend.fetch_members(trip_id).await?),
            Slice::Tags => SliceData::Tags(backend.fetch_tags(trip_id).await?),
        })
    }

    fn persist(&self, fetched: &CachedData<SliceData>) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let trip_id = self.inner.store.trip_id();
        let slice = fetched.data.slice();
        if let Err(e) = cache.save_slice(trip_id, fetched) {
            warn!(%trip_id, %slice, error = %e, "Failed to write cache");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
