//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Core decoding/layout error.
    #[error(transparent)]
    Core(#[from] jetarchive_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error from the handle service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration. Always fatal, and raised before any I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A shard could not be written after all retries.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A background task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_display() {
        let err = Error::Config("--archive-all and --non-posts are mutually exclusive".into());
        let msg = err.to_string();
        assert!(msg.starts_with("Configuration error"));
        assert!(msg.contains("mutually exclusive"));
    }

    #[test]
    fn test_core_is_transparent() {
        let err: Error = jetarchive_core::Error::MissingField("did").into();
        assert_eq!(err.to_string(), "missing field 'did'");
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = std::io::Error::other("disk full").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
