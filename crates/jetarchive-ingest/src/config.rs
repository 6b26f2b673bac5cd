//! Run configuration.
//!
//! [`PipelineConfig`] is built once (by the CLI or a test), validated with
//! [`PipelineConfig::validate`] before any network or file activity, and
//! then treated as read-only for the lifetime of the run.

use crate::buffer::BatchConfig;
use crate::connection::{ConnectionConfig, subscribe_url};
use crate::publisher::PublisherConfig;
use crate::resolver::ResolverConfig;
use crate::router::RouterConfig;
use crate::{Error, Result};
use jetarchive_core::ArchiveMode;
use std::fmt;

/// Optional behaviors, fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Print the text of kept records to stdout.
    pub stream_stdout: bool,

    /// Periodically log throughput.
    pub measure_rate: bool,

    /// Fill in the `handle` field of posts.
    pub resolve_handles: bool,
}

/// Account credentials. Accepted but not used yet.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a run needs.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub mode: ArchiveMode,

    /// Resume position (µs). `None` starts from live.
    pub cursor: Option<i64>,

    pub connection: ConnectionConfig,
    pub batch: BatchConfig,
    pub router: RouterConfig,
    pub publisher: PublisherConfig,
    pub resolver: ResolverConfig,
    pub features: Features,
    pub credentials: Option<Credentials>,

    /// Stop the run when a batch cannot be written after all retries,
    /// instead of logging it as lost and continuing.
    pub storage_failure_fatal: bool,
}

/// Turn the two mode flags into an [`ArchiveMode`].
pub fn mode_from_flags(archive_all: bool, non_posts: bool) -> Result<ArchiveMode> {
    match (archive_all, non_posts) {
        (true, true) => Err(Error::Config(
            "--archive-all and --non-posts are mutually exclusive".to_string(),
        )),
        (true, false) => Ok(ArchiveMode::AllRecords),
        (false, true) => Ok(ArchiveMode::NonPosts),
        (false, false) => Ok(ArchiveMode::PostsOnly),
    }
}

/// Parse a cursor value: a non-negative integer number of microseconds.
pub fn parse_cursor(raw: &str) -> Result<i64> {
    let cursor: i64 = raw
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid cursor '{raw}': {e}")))?;
    if cursor < 0 {
        return Err(Error::Config(format!("invalid cursor '{raw}': must not be negative")));
    }
    Ok(cursor)
}

impl PipelineConfig {
    /// Check the snapshot for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if let Some(cursor) = self.cursor
            && cursor < 0
        {
            return Err(Error::Config(format!("cursor must not be negative (got {cursor})")));
        }

        subscribe_url(&self.connection.endpoint, self.cursor)?;

        if self.batch.max_events == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if self.batch.flush_interval.is_zero() {
            return Err(Error::Config("flush interval must be greater than zero".to_string()));
        }
        if self.connection.queue_capacity == 0 {
            return Err(Error::Config("event queue capacity must be at least 1".to_string()));
        }
        if self.connection.read_timeout.is_zero() {
            return Err(Error::Config("read timeout must be greater than zero".to_string()));
        }

        let reconnect = &self.connection.reconnect;
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff multiplier must be >= 1 (got {})",
                reconnect.multiplier
            )));
        }
        if reconnect.min_delay > reconnect.max_delay {
            return Err(Error::Config(format!(
                "minimum backoff {:?} exceeds maximum {:?}",
                reconnect.min_delay, reconnect.max_delay
            )));
        }

        if self.router.max_open_shards == 0 {
            return Err(Error::Config("max open shards must be at least 1".to_string()));
        }
        if self.router.max_write_attempts == 0 {
            return Err(Error::Config("write attempts must be at least 1".to_string()));
        }
        if self.publisher.capacity == 0 {
            return Err(Error::Config("subscriber capacity must be at least 1".to_string()));
        }

        if self.features.resolve_handles {
            if self.mode != ArchiveMode::PostsOnly {
                tracing::warn!(mode = %self.mode, "Handle resolution only applies to posts-only mode");
            }
            if self.resolver.timeout.is_zero() {
                return Err(Error::Config("handle lookup timeout must be greater than zero".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.mode, ArchiveMode::PostsOnly);
        assert!(config.cursor.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(mode_from_flags(false, false).unwrap(), ArchiveMode::PostsOnly);
        assert_eq!(mode_from_flags(true, false).unwrap(), ArchiveMode::AllRecords);
        assert_eq!(mode_from_flags(false, true).unwrap(), ArchiveMode::NonPosts);
        let err = mode_from_flags(true, true).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor("1725911162329308").unwrap(), 1_725_911_162_329_308);
        assert_eq!(parse_cursor(" 0 ").unwrap(), 0);
        assert!(matches!(parse_cursor("-5"), Err(Error::Config(_))));
        assert!(matches!(parse_cursor("yesterday"), Err(Error::Config(_))));
        assert!(matches!(parse_cursor("1.5"), Err(Error::Config(_))));
        assert!(matches!(parse_cursor(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_negative_cursor() {
        let config = PipelineConfig {
            cursor: Some(-1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let mut config = PipelineConfig::default();
        config.batch.max_events = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.batch.flush_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.publisher.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let mut config = PipelineConfig::default();
        config.connection.endpoint = "https://jetstream.example/subscribe".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = PipelineConfig::default();
        config.connection.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.connection.reconnect.min_delay = Duration::from_secs(120);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }
}
