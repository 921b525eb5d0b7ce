use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::SyncSettings;

use super::realtime::{self, Invalidation, RealtimeConfig, RealtimeListener, DEFAULT_DEBOUNCE};
use super::{
    Revalidator, Slice, StoreEvent, SyncError, TripBackend, TripMutations, TripSnapshot, TripStore,
    DEFAULT_DEDUPE_INTERVAL,
};

const INVALIDATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOptions {
    pub dedupe_interval: Duration,
    /// Window over which realtime changes are coalesced.
    pub debounce: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dedupe_interval: DEFAULT_DEDUPE_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            dedupe_interval: Duration::from_millis(settings.dedupe_interval_ms),
            debounce: Duration::from_millis(settings.debounce_ms),
        }
    }
}

/// Everything needed to show and edit one trip: the cached state, the
/// revalidation handle, the mutation layer and any background tasks.
pub struct TripData<B: TripBackend> {
    store: Arc<TripStore>,
    revalidator: Revalidator<B>,
    mutations: TripMutations<B>,
    options: SyncOptions,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: TripBackend> TripData<B> {
    /// Build the sync layer for `trip_id`. Slices found in `cache` are
    /// restored right away so they can be shown before the first fetch.
    pub async fn open(
        backend: Arc<B>,
        trip_id: Uuid,
        options: SyncOptions,
        cache: Option<Arc<CacheManager>>,
    ) -> Self {
        let store = Arc::new(TripStore::new(trip_id));

        if let Some(cache) = &cache {
            for slice in Slice::ALL {
                match cache.load_slice(trip_id, slice) {
                    Ok(Some(entry)) => {
                        debug!(%trip_id, %slice, age = %entry.age_display(), "Restored from cache");
                        store.restore(entry).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%trip_id, %slice, error = %e, "Ignoring unreadable cache"),
                }
            }
        }

        let revalidator = Revalidator::new(backend, Arc::clone(&store), cache, options.dedupe_interval);
        let mutations = TripMutations::new(revalidator.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            revalidator,
            mutations,
            options,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn trip_id(&self) -> Uuid {
        self.store.trip_id()
    }

    pub fn store(&self) -> &Arc<TripStore> {
        &self.store
    }

    pub fn revalidator(&self) -> &Revalidator<B> {
        &self.revalidator
    }

    pub fn mutations(&self) -> &TripMutations<B> {
        &self.mutations
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub async fn snapshot(&self) -> TripSnapshot {
        self.store.snapshot().await
    }

    /// Fetch every slice not fetched within the dedupe interval.
    pub async fn load(&self) -> Result<(), SyncError> {
        self.revalidator.load_all().await
    }

    /// Fetch every slice now.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.revalidator.revalidate_all().await
    }

    pub async fn revalidate(&self, slice: Slice) -> Result<(), SyncError> {
        self.revalidator.revalidate(slice).await
    }

    /// Listen for row changes and revalidate the affected slices.
    ///
    /// `token` carries the current access token; updates are forwarded to
    /// the open channel.
    pub fn start_realtime(&self, config: RealtimeConfig, token: watch::Receiver<Option<String>>) {
        let trip_id = self.trip_id();
        info!(%trip_id, "Starting realtime listener");

        let (tx, rx) = mpsc::channel(INVALIDATION_BUFFER);
        let listener = RealtimeListener::new(config, trip_id, token, tx);
        let listen = tokio::spawn(listener.run(self.shutdown.subscribe()));
        let apply = tokio::spawn(apply_invalidations(
            self.revalidator.clone(),
            rx,
            self.options.debounce,
            self.shutdown.subscribe(),
        ));
        self.track(listen);
        self.track(apply);
    }

    /// Revalidate every slice each `period`.
    pub fn start_polling(&self, period: Duration) {
        info!(trip_id = %self.trip_id(), period_secs = period.as_secs(), "Starting periodic revalidation");
        let handle = self
            .revalidator
            .spawn_interval(period, self.shutdown.subscribe());
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Stop every background task and wait for them to finish.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(trip_id = %self.trip_id(), error = %e, "Background task ended abnormally");
            }
        }
        debug!(trip_id = %self.trip_id(), "Trip data closed");
    }
}

async fn apply_invalidations<B: TripBackend>(
    revalidator: Revalidator<B>,
    mut rx: mpsc::Receiver<Invalidation>,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let batch = tokio::select! {
            batch = realtime::next_batch(&mut rx, debounce) => match batch {
                Some(batch) => batch,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let slices = batch.slices();
        debug!(trip_id = %revalidator.store().trip_id(), ?slices, resync = batch.is_resync(), "Revalidating after remote change");
        let results =
            futures::future::join_all(slices.iter().map(|slice| revalidator.revalidate(*slice))).await;
        for (slice, result) in slices.iter().zip(results) {
            if let Err(e) = result {
                warn!(trip_id = %revalidator.store().trip_id(), %slice, error = %e, "Revalidation after remote change failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedData;
    use crate::sync::testing::MemoryBackend;
    use crate::sync::{ChangeOrigin, SliceData};

    #[tokio::test]
    async fn test_open_restores_disk_cache_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheManager::new(dir.path().to_path_buf()).unwrap());
        let backend = Arc::new(MemoryBackend::seeded());
        let trip_id = backend.trip_id();

        let mut stale = backend.db().trip;
        stale.name = "Old name".into();
        cache.save_slice(trip_id, &CachedData::new(SliceData::Trip(stale))).unwrap();

        let data = TripData::open(Arc::clone(&backend), trip_id, SyncOptions::default(), Some(cache)).await;
        assert_eq!(data.store().trip().await.unwrap().name, "Old name");
        assert_eq!(backend.fetch_count(Slice::Trip), 0);

        data.load().await.unwrap();
        let snapshot = data.snapshot().await;
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.trip.unwrap().name, "Kyoto");
        data.close().await;
    }

    #[tokio::test]
    async fn test_realtime_invalidations_are_coalesced() {
        let backend = Arc::new(MemoryBackend::seeded());
        let data = TripData::open(Arc::clone(&backend), backend.trip_id(), SyncOptions::default(), None).await;
        data.refresh().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(apply_invalidations(
            data.revalidator().clone(),
            rx,
            Duration::from_millis(20),
            shutdown_rx,
        ));

        for _ in 0..5 {
            tx.send(Invalidation::Slice(Slice::Itinerary)).await.unwrap();
        }
        tx.send(Invalidation::Slice(Slice::Members)).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(backend.fetch_count(Slice::Itinerary), 2);
        assert_eq!(backend.fetch_count(Slice::Members), 2);
        assert_eq!(backend.fetch_count(Slice::Tags), 1);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let backend = Arc::new(MemoryBackend::seeded());
        let data = TripData::open(Arc::clone(&backend), backend.trip_id(), SyncOptions::default(), None).await;
        let mut events = data.subscribe();

        data.revalidate(Slice::Tags).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.slice, Slice::Tags);
        assert_eq!(event.origin, ChangeOrigin::Fetched);
    }

    #[tokio::test]
    async fn test_close_stops_polling() {
        let backend = Arc::new(MemoryBackend::seeded());
        let data = TripData::open(Arc::clone(&backend), backend.trip_id(), SyncOptions::default(), None).await;
        data.start_polling(Duration::from_millis(5));
        backend.wait_for_fetches(Slice::Tags, 1).await;
        data.close().await;

        let after_close = backend.fetch_count(Slice::Tags);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.fetch_count(Slice::Tags), after_close);
    }

    #[test]
    fn test_options_from_settings() {
        let settings = SyncSettings {
            dedupe_interval_ms: 500,
            debounce_ms: 50,
            ..Default::default()
        };
        let options = SyncOptions::from(&settings);
        assert_eq!(options.dedupe_interval, Duration::from_millis(500));
        assert_eq!(options.debounce, Duration::from_millis(50));
    }
}
