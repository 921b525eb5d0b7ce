//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `Session`: Token-based session management with expiry and refresh
//! - `CredentialStore`: Secure OS-level credential storage via keyring
//!
//! Sessions are persisted to disk alongside the trip cache.

pub mod credentials;
pub mod session;

pub use credentials::CredentialStore;
pub use session::{Session, SessionData};
