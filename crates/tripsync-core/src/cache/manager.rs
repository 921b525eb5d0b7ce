use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Itinerary, Member, Tag, Trip};
use crate::sync::{Slice, SliceData};

/// Consider cached data stale after 1 hour unless configured otherwise.
pub const DEFAULT_STALE_MINUTES: i64 = 60;

const TRIPS_DIR: &str = "trips";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn with_timestamp(data: T, cached_at: DateTime<Utc>) -> Self {
        Self { data, cached_at }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CachedData<U> {
        CachedData {
            data: f(self.data),
            cached_at: self.cached_at,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Negative ages come from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_older_than(DEFAULT_STALE_MINUTES)
    }

    pub fn is_older_than(&self, minutes: i64) -> bool {
        self.age_minutes() > minutes
    }
}

/// On-disk cache of server-confirmed trip data.
///
/// Layout: `<cache_dir>/trips/<trip_id>/<slice>.json`.
pub struct CacheManager {
    cache_dir: PathBuf,
    stale_minutes: i64,
}

impl CacheManager {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache dir {}", cache_dir.display()))?;
        Ok(Self {
            cache_dir,
            stale_minutes: DEFAULT_STALE_MINUTES,
        })
    }

    pub fn with_stale_minutes(mut self, minutes: i64) -> Self {
        self.stale_minutes = minutes.max(0);
        self
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    fn trip_dir(&self, trip_id: Uuid) -> PathBuf {
        self.cache_dir.join(TRIPS_DIR).join(trip_id.to_string())
    }

    fn cache_path(&self, trip_id: Uuid, slice: Slice) -> PathBuf {
        self.trip_dir(trip_id).join(format!("{}.json", slice.name()))
    }

    fn load<T: DeserializeOwned>(&self, trip_id: Uuid, slice: Slice) -> Result<Option<CachedData<T>>> {
        let path = self.cache_path(trip_id, slice);
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file: {}", path.display()))?;

        let cached: CachedData<T> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file: {}", path.display()))?;

        Ok(Some(cached))
    }

    fn save<T: Serialize>(&self, trip_id: Uuid, slice: Slice, cached: &CachedData<T>) -> Result<()> {
        let path = self.cache_path(trip_id, slice);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(cached)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;
        debug!(%trip_id, %slice, "Cache written");
        Ok(())
    }

    // ===== Slices =====

    /// Persist one slice, keeping the timestamp of the fetch that produced it.
    pub fn save_slice(&self, trip_id: Uuid, cached: &CachedData<SliceData>) -> Result<()> {
        let at = cached.cached_at;
        match &cached.data {
            SliceData::Trip(trip) => self.save(trip_id, Slice::Trip, &CachedData::with_timestamp(trip, at)),
            SliceData::Itinerary(itinerary) => {
                self.save(trip_id, Slice::Itinerary, &CachedData::with_timestamp(itinerary, at))
            }
            SliceData::Members(members) => {
                self.save(trip_id, Slice::Members, &CachedData::with_timestamp(members, at))
            }
            SliceData::Tags(tags) => self.save(trip_id, Slice::Tags, &CachedData::with_timestamp(tags, at)),
        }
    }

    pub fn load_slice(&self, trip_id: Uuid, slice: Slice) -> Result<Option<CachedData<SliceData>>> {
        Ok(match slice {
            Slice::Trip => self.load_trip(trip_id)?.map(|c| c.map(SliceData::Trip)),
            Slice::Itinerary => self
                .load_itinerary(trip_id)?
                .map(|c| c.map(SliceData::Itinerary)),
            Slice::Members => self.load_members(trip_id)?.map(|c| c.map(SliceData::Members)),
            Slice::Tags => self.load_tags(trip_id)?.map(|c| c.map(SliceData::Tags)),
        })
    }

    pub fn load_trip(&self, trip_id: Uuid) -> Result<Option<CachedData<Trip>>> {
        self.load(trip_id, Slice::Trip)
    }

    pub fn load_itinerary(&self, trip_id: Uuid) -> Result<Option<CachedData<Itinerary>>> {
        self.load(trip_id, Slice::Itinerary)
    }

    pub fn load_members(&self, trip_id: Uuid) -> Result<Option<CachedData<Vec<Member>>>> {
        self.load(trip_id, Slice::Members)
    }

    pub fn load_tags(&self, trip_id: Uuid) -> Result<Option<CachedData<Vec<Tag>>>> {
        self.load(trip_id, Slice::Tags)
    }

    // ===== Housekeeping =====

    pub fn clear_trip(&self, trip_id: Uuid) -> Result<()> {
        let dir = self.trip_dir(trip_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove cache dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Trips that have at least one cached slice.
    pub fn cached_trips(&self) -> Result<Vec<Uuid>> {
        let dir = self.cache_dir.join(TRIPS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut trips = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                trips.push(id);
            }
        }
        trips.sort();
        Ok(trips)
    }

    // ===== Cache Age Information =====

    /// Load a slice for age checks, logging rather than failing on bad files.
    fn peek(&self, trip_id: Uuid, slice: Slice) -> Option<CachedData<SliceData>> {
        match self.load_slice(trip_id, slice) {
            Ok(cached) => cached,
            Err(e) => {
                debug!(%trip_id, %slice, error = %e, "Failed to load cache for age check");
                None
            }
        }
    }

    pub fn cache_ages(&self, trip_id: Uuid) -> CacheAges {
        let mut ages = CacheAges::default();
        for slice in Slice::ALL {
            let Some(cached) = self.peek(trip_id, slice) else {
                ages.any_stale = true;
                continue;
            };
            if cached.is_older_than(self.stale_minutes) {
                ages.any_stale = true;
            }
            let age = Some(cached.age_display());
            match slice {
                Slice::Trip => ages.trip = age,
                Slice::Itinerary => ages.itinerary = age,
                Slice::Members => ages.members = age,
                Slice::Tags => ages.tags = age,
            }
            if ages.newest.map_or(true, |newest| cached.cached_at > newest) {
                ages.newest = Some(cached.cached_at);
            }
        }
        ages
    }
}

#[derive(Debug, Default)]
pub struct CacheAges {
    pub trip: Option<String>,
    pub itinerary: Option<String>,
    pub members: Option<String>,
    pub tags: Option<String>,
    /// Missing or older than the stale threshold.
    pub any_stale: bool,
    newest: Option<DateTime<Utc>>,
}

impl CacheAges {
    /// Age of the most recently cached slice.
    pub fn last_updated(&self) -> String {
        match self.newest {
            Some(at) => CachedData::with_timestamp((), at).age_display(),
            None => "never".to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
