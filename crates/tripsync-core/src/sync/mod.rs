//! Client-side synchronization of one trip with the backend.
//!
//! - [`TripStore`]: last known state per [`Slice`], with change events.
//! - [`Revalidator`]: fetches slices, collapsing concurrent requests.
//! - [`TripMutations`]: optimistic writes with rollback on failure.
//! - [`realtime`]: row-change listener that triggers revalidation.
//! - [`TripData`]: wires the above together for one open trip.

pub mod backend;
pub mod error;
pub mod fetch;
pub mod mutation;
pub mod provider;
pub mod realtime;
pub mod slice;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::TripBackend;
pub use error::SyncError;
pub use fetch::{Revalidator, DEFAULT_DEDUPE_INTERVAL};
pub use mutation::{ItemDraft, TripMutations};
pub use provider::{SyncOptions, TripData};
pub use realtime::{Invalidation, RealtimeConfig, RealtimeError, RealtimeListener};
pub use slice::{Slice, SliceData};
pub use store::{ChangeOrigin, PendingMutation, StoreEvent, TripSnapshot, TripStore};
