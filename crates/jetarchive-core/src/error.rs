//! Error types for the Jetstream archiver core.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or laying out events.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing from the event envelope.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// The event time cannot be represented as a calendar date.
    #[error("event time {0} is out of range")]
    TimeOutOfRange(i64),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
