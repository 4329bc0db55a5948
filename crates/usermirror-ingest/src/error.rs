//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by caller-supplied event handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during ingestion and reconciliation.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// JSON encoding/decoding of a stored record failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the shared core types.
    #[error(transparent)]
    Core(#[from] usermirror_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure talking to the remote feed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote feed answered with a non-success status.
    #[error("feed returned HTTP {status}: {body}")]
    Feed {
        /// HTTP status code.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },

    /// The caller-supplied post-event handler failed.
    #[error("event handler failed for {event_id}: {source}")]
    Handler {
        /// Upstream id of the event being handled.
        event_id: String,
        /// The handler's error.
        #[source]
        source: BoxError,
    },

    /// Store layout or contents are not what the pipeline expects.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
