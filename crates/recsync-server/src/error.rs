//! Server-specific error types
//!
//! One enum per pipeline stage. None of these ever escape the background
//! tasks: they are logged where they happen and the affected page or batch is
//! dropped. `AppError` is the only one rendered to HTTP clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure to read one page from the source API.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Source returned HTTP {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("Source body could not be decoded: {0}")]
    Decode(String),

    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Transport(err)
        }
    }
}

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Failure talking to the broker or encoding a message for it.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to serialize batch: {0}")]
    Serialize(#[from] recsync_common::RecsyncError),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Broker backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("Delivery {0} is not held by this consumer")]
    UnknownDelivery(i64),
}

impl QueueError {
    /// Whether retrying later could succeed without any intervention.
    pub fn is_connection(&self) -> bool {
        match self {
            QueueError::NotConnected => true,
            QueueError::Backend(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

/// Application error types for the status endpoint
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Queue(ref e) => {
                tracing::error!("Queue error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Broker is unavailable".to_string())
            },
            AppError::Unavailable(ref message) => (StatusCode::SERVICE_UNAVAILABLE, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
