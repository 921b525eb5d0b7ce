//! Local caching module for offline data access.
//!
//! `CacheManager` persists the last server-confirmed copy of every slice of
//! a trip as JSON, so a trip can be shown immediately on startup (and with
//! `--offline`) before any request completes.

pub mod manager;

pub use manager::{CacheAges, CacheManager, CachedData, DEFAULT_STALE_MINUTES};
