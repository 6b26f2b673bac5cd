//! Hourly shard layout.
//!
//! Every archived record lands in exactly one shard file determined solely
//! by its event time (UTC):
//!
//! ```text
//! <root>/<mode dir>/YYYY-MM/DD/<prefix>_YYYYMMDD_HH.jsonl
//! ```

use crate::classify::ArchiveMode;
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

/// File extension for shard files.
pub const SHARD_EXTENSION: &str = "jsonl";

/// The UTC hour an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl ShardKey {
    /// Compute the shard for an event time in microseconds since the epoch.
    pub fn from_time_us(time_us: i64) -> Result<Self> {
        let at: DateTime<Utc> =
            DateTime::from_timestamp_micros(time_us).ok_or(Error::TimeOutOfRange(time_us))?;
        let year = at.year();
        if !(0..=9999).contains(&year) {
            return Err(Error::TimeOutOfRange(time_us));
        }
        Ok(Self {
            year,
            month: at.month(),
            day: at.day(),
            hour: at.hour(),
        })
    }

    /// `YYYY-MM/DD` directory relative to the mode directory.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("{:04}-{:02}", self.year, self.month)).join(format!("{:02}", self.day))
    }

    /// `<prefix>_YYYYMMDD_HH.jsonl`.
    pub fn file_name(&self, prefix: &str) -> String {
        format!(
            "{}_{:04}{:02}{:02}_{:02}.{}",
            prefix, self.year, self.month, self.day, self.hour, SHARD_EXTENSION
        )
    }

    /// Full path of this shard for `mode` under `root`.
    pub fn path(&self, root: &Path, mode: ArchiveMode) -> PathBuf {
        root.join(mode.directory())
            .join(self.relative_dir())
            .join(self.file_name(mode.file_prefix()))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

/// Shard path for an event time. Pure: the same inputs always give the same path.
pub fn shard_path(root: &Path, mode: ArchiveMode, time_us: i64) -> Result<PathBuf> {
    Ok(ShardKey::from_time_us(time_us)?.path(root, mode))
}
