//! Error types for the usermirror core types.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or transforming event payloads.
#[derive(Error, Debug)]
pub enum Error {
    /// Event payload could not be interpreted as a user record.
    #[error("invalid event data for {event_type}: {reason}")]
    InvalidEventData {
        /// The upstream event type the payload belonged to.
        event_type: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// A record has an invalid field value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
