//! Core library for tripsync.
//!
//! Keeps a local copy of a shared trip (the trip record, its itinerary,
//! members and tags) in step with the backend: cached reads, deduplicated
//! revalidation, optimistic edits with rollback, and realtime invalidation.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod sync;
pub mod utils;

pub use api::{ApiClient, ApiError};
pub use auth::{CredentialStore, Session, SessionData};
pub use cache::{CacheManager, CachedData};
pub use config::Config;
pub use sync::{
    ItemDraft, RealtimeConfig, Slice, SyncError, SyncOptions, TripBackend, TripData, TripMutations,
    TripStore,
};
