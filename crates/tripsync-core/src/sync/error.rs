use thiserror::Error;
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::ItineraryError;

use super::Slice;

/// Errors surfaced by the sync layer.
///
/// Clone so that every caller joined onto one deduplicated fetch receives
/// the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Unauthorized - sign in again")]
    Unauthorized,

    #[error("Failed to fetch {slice}: {message}")]
    Fetch { slice: Slice, message: String },

    #[error("{operation} failed: {message}")]
    Mutation {
        operation: &'static str,
        message: String,
    },

    #[error("{0} has not been loaded yet")]
    NotLoaded(Slice),

    #[error("Unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error(transparent)]
    Itinerary(#[from] ItineraryError),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub(crate) fn fetch(slice: Slice, err: &anyhow::Error) -> Self {
        if is_unauthorized(err) {
            SyncError::Unauthorized
        } else {
            SyncError::Fetch {
                slice,
                message: format!("{:#}", err),
            }
        }
    }

    pub(crate) fn mutation(operation: &'static str, err: &anyhow::Error) -> Self {
        if is_unauthorized(err) {
            SyncError::Unauthorized
        } else {
            SyncError::Mutation {
                operation,
                message: format!("{:#}", err),
            }
        }
    }

    /// Errors raised before any request was sent (bad input, unknown ids).
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SyncError::NotLoaded(_)
                | SyncError::NotFound { .. }
                | SyncError::Itinerary(_)
                | SyncError::Invalid(_)
        )
    }
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_unauthorized_is_detected_through_context() {
        let err = Err::<(), _>(anyhow::Error::from(ApiError::Unauthorized))
            .context("Failed to fetch trip")
            .unwrap_err();
        assert_eq!(SyncError::fetch(Slice::Trip, &err), SyncError::Unauthorized);
        assert_eq!(SyncError::mutation("add tag", &err), SyncError::Unauthorized);
    }

    #[test]
    fn test_fetch_error_keeps_context_chain() {
        let err = Err::<(), _>(anyhow::Error::from(ApiError::ServerError("boom".into())))
            .context("Failed to fetch trip tags")
            .unwrap_err();
        match SyncError::fetch(Slice::Tags, &err) {
            SyncError::Fetch { slice, message } => {
                assert_eq!(slice, Slice::Tags);
                assert!(message.contains("Failed to fetch trip tags"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_is_local() {
        assert!(SyncError::NotLoaded(Slice::Trip).is_local());
        assert!(SyncError::Invalid("x".into()).is_local());
        assert!(!SyncError::Unauthorized.is_local());
    }
}
