//! The HTTP-facing error taxonomy and its status/body mapping.
//!
//! Everything below the dispatcher speaks in `anyhow::Result` or a narrow
//! outcome type (`Hit`/`Miss`); only the dispatcher itself needs to know
//! which HTTP status and body a given failure maps to, so that mapping
//! lives in exactly one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors the dispatcher can turn into an HTTP response.
#[derive(Debug, Error)]
pub enum AppError {
    /// Neither the local store nor (if configured) any upstream has the
    /// requested object.
    #[error("no such path")]
    NotFound,

    /// The requested `narHash` in a `/nar/{hashpart}-{narhash}.nar` URL
    /// does not match the current `NarHash` of the path.
    #[error("incorrect NAR hash")]
    HashMismatch,

    /// The store gateway itself is unavailable (subprocess failed to
    /// spawn, store directory unreadable, etc). Not recoverable by trying
    /// upstreams again.
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(#[source] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body): (StatusCode, &'static str) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "No such path.\n"),
            AppError::HashMismatch => (
                StatusCode::NOT_FOUND,
                "Incorrect NAR hash. Maybe the path has been recreated.\n",
            ),
            AppError::StoreUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.\n")
            }
        };
        if matches!(self, AppError::StoreUnavailable(_)) {
            tracing::error!("{:#}", self);
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_not_found_body() {
        let response = AppError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"No such path.\n");
    }

    #[tokio::test]
    async fn test_hash_mismatch_body() {
        let response = AppError::HashMismatch.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Incorrect NAR hash. Maybe the path has been recreated.\n");
    }

    #[tokio::test]
    async fn test_store_unavailable_is_5xx() {
        let response = AppError::StoreUnavailable(anyhow::anyhow!("boom")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
