//! REST client for the trip backend.
//!
//! `ApiClient` signs in against the backend's auth endpoint, reads the trip
//! tables and performs the writes the sync layer issues. It is the
//! production implementation of [`crate::sync::TripBackend`].

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
