//! File router for the hourly JSONL archive.
//!
//! This module provides the [`FileRouter`] which appends batches of kept
//! records to their shard files.
//!
//! # Layout
//!
//! ```text
//! <output_root>/<mode dir>/YYYY-MM/DD/<prefix>_YYYYMMDD_HH.jsonl
//! ```
//!
//! One JSON object per line. Files are opened in append mode, so restarting
//! over an existing archive extends it. A failed append is cut back to the
//! length the shard had before it, which keeps retries from duplicating lines
//! or leaving half of one behind.
//!
//! # Concurrency
//!
//! Every open shard sits behind its own mutex: writers to one shard are
//! serialized (no interleaved partial lines) while writers to different
//! shards proceed independently. The map of open handles is only locked
//! long enough to look a handle up or insert one.
//!
//! All methods do blocking file I/O; async callers go through
//! `tokio::task::spawn_blocking`.

use crate::buffer::Batch;
use crate::error::{Error, Result};
use jetarchive_core::metrics::{increment, set_gauge};
use jetarchive_core::{ArchiveMode, ArchiveRecord, ShardKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the file router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Root directory; mode directories are created below it.
    /// Default: "."
    pub output_root: PathBuf,

    /// `fsync` each shard after writing a batch to it.
    /// Default: true
    pub fsync: bool,

    /// Shard handles kept open at once (least recently used are closed).
    /// Default: 8
    pub max_open_shards: usize,

    /// Attempts per shard before its records are given up.
    /// Default: 3
    pub max_write_attempts: u32,

    /// Pause between attempts.
    /// Default: 200ms
    pub retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            fsync: true,
            max_open_shards: 8,
            max_write_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Outcome of writing one batch.
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Records durably appended.
    pub records_written: usize,

    /// Records whose shard failed on every attempt.
    pub records_lost: usize,

    /// Shards touched by the batch.
    pub shards: usize,

    /// One message per failed shard.
    pub failures: Vec<String>,
}

impl WriteReport {
    /// True if nothing was lost.
    pub fn is_complete(&self) -> bool {
        self.records_lost == 0
    }

    /// Turn a lossy report into a storage error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(Error::Storage(format!(
                "{} records lost: {}",
                self.records_lost,
                self.failures.join("; ")
            )))
        }
    }
}

/// File operations a shard append needs.
trait ShardFile: Write {
    fn size(&mut self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl ShardFile for File {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Why one append attempt failed.
#[derive(Debug)]
enum AppendError {
    /// Nothing from the attempt is left in the file; safe to retry.
    RolledBack(Error),
    /// The rollback failed too, so the shard may end mid-line.
    Torn(Error),
}

/// Append `lines` as a unit: on any failure the file is truncated back to
/// its length before the attempt.
fn append_once<F: ShardFile>(
    file: &mut F,
    lines: &[u8],
    fsync: bool,
) -> std::result::Result<(), AppendError> {
    let start = file.size().map_err(|e| AppendError::RolledBack(e.into()))?;
    let Err(e) = write_and_sync(file, lines, fsync) else {
        return Ok(());
    };
    match file.truncate(start) {
        Ok(()) => Err(AppendError::RolledBack(e.into())),
        Err(rollback) => Err(AppendError::Torn(Error::Storage(format!(
            "{e}; truncating back to {start} bytes failed: {rollback}"
        )))),
    }
}

fn write_and_sync<F: ShardFile>(file: &mut F, lines: &[u8], fsync: bool) -> io::Result<()> {
    file.write_all(lines)?;
    file.flush()?;
    if fsync {
        file.sync()?;
    }
    Ok(())
}

struct ShardSlot {
    file: Mutex<File>,
    last_used: AtomicU64,
}

/// Appends records to hourly shard files.
///
/// Thread-safe: uses internal locking per shard.
pub struct FileRouter {
    config: RouterConfig,
    mode: ArchiveMode,
    open: Mutex<HashMap<PathBuf, Arc<ShardSlot>>>,
    clock: AtomicU64,
}

impl FileRouter {
    pub fn new(config: RouterConfig, mode: ArchiveMode) -> Self {
        info!(
            "FileRouter initialized: root={}, mode={}, fsync={}",
            config.output_root.join(mode.directory()).display(),
            mode,
            config.fsync
        );

        Self {
            config,
            mode,
            open: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Path of the shard a record belongs to.
    pub fn shard_path(&self, shard: ShardKey) -> PathBuf {
        shard.path(&self.config.output_root, self.mode)
    }

    /// Group records by shard, keeping arrival order inside each group.
    ///
    /// Groups come out in order of their first record.
    pub fn partition(records: &[ArchiveRecord]) -> Vec<(ShardKey, Vec<&ArchiveRecord>)> {
        let mut groups: Vec<(ShardKey, Vec<&ArchiveRecord>)> = Vec::new();
        for record in records {
            match groups.iter_mut().find(|(key, _)| *key == record.shard) {
                Some((_, group)) => group.push(record),
                None => groups.push((record.shard, vec![record])),
            }
        }
        groups
    }

    /// Write a batch. Each shard is retried independently; records of a
    /// shard that fails every attempt are counted as lost in the report.
    pub fn write(&self, batch: &Batch) -> Result<WriteReport> {
        let mut report = WriteReport::default();

        for (shard, records) in Self::partition(&batch.records) {
            let mut lines = Vec::with_capacity(records.len() * 256);
            for record in &records {
                record.write_line(&mut lines)?;
            }

            report.shards += 1;
            let path = self.shard_path(shard);
            match self.write_with_retry(&path, &lines) {
                Ok(()) => {
                    report.records_written += records.len();
                    debug!(shard = %shard, records = records.len(), "Appended to {}", path.display());
                }
                Err(e) => {
                    error!(shard = %shard, records = records.len(), "Giving up on {}: {}", path.display(), e);
                    report.records_lost += records.len();
                    report.failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        increment("archive_records_written_total", report.records_written as u64);

        Ok(report)
    }

    fn write_with_retry(&self, path: &Path, lines: &[u8]) -> Result<()> {
        let attempts = self.config.max_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.append(path, lines) {
                Ok(()) => return Ok(()),
                Err(AppendError::RolledBack(e)) if attempt < attempts => {
                    warn!(attempt, "Write to {} failed, retrying: {}", path.display(), e);
                    increment("archive_storage_retries_total", 1);
                    // Reopen on the next attempt.
                    self.close(path);
                    std::thread::sleep(self.config.retry_delay);
                    attempt += 1;
                }
                Err(AppendError::RolledBack(e)) => {
                    self.close(path);
                    return Err(Error::Storage(format!("after {attempt} attempts: {e}")));
                }
                Err(AppendError::Torn(e)) => {
                    self.close(path);
                    return Err(e);
                }
            }
        }
    }

    fn append(&self, path: &Path, lines: &[u8]) -> std::result::Result<(), AppendError> {
        let slot = self.slot(path).map_err(AppendError::RolledBack)?;
        let mut file = slot.file.lock();
        append_once(&mut *file, lines, self.config.fsync)
    }

    /// Get the open handle for `path`, opening it (and evicting the least
    /// recently used handle) if needed.
    fn slot(&self, path: &Path) -> Result<Arc<ShardSlot>> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut open = self.open.lock();

        if let Some(slot) = open.get(path) {
            slot.last_used.store(tick, Ordering::Relaxed);
            return Ok(Arc::clone(slot));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Opened shard {}", path.display());

        let slot = Arc::new(ShardSlot {
            file: Mutex::new(file),
            last_used: AtomicU64::new(tick),
        });
        open.insert(path.to_path_buf(), Arc::clone(&slot));

        // Appends are never buffered, so an evicted handle can just be dropped.
        while open.len() > self.config.max_open_shards.max(1) {
            let Some(oldest) = open
                .iter()
                .min_by_key(|(_, s)| s.last_used.load(Ordering::Relaxed))
                .map(|(p, _)| p.clone())
            else {
                break;
            };
            open.remove(&oldest);
            debug!("Closed shard {}", oldest.display());
        }
        set_gauge("archive_open_shards", open.len() as f64);

        Ok(slot)
    }

    fn close(&self, path: &Path) {
        let mut open = self.open.lock();
        open.remove(path);
        set_gauge("archive_open_shards", open.len() as f64);
    }

    /// Sync and close every open shard.
    pub fn close_all(&self) -> Result<()> {
        let slots: Vec<(PathBuf, Arc<ShardSlot>)> = self.open.lock().drain().collect();
        set_gauge("archive_open_shards", 0.0);

        let mut first_error = None;
        for (path, slot) in slots {
            if let Err(e) = slot.file.lock().sync_all() {
                warn!("Failed to close shard {}: {}", path.display(), e);
                first_error.get_or_insert(Error::Io(e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn open_shards(&self) -> usize {
        self.open.lock().len()
    }
}

impl Drop for FileRouter {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!("Error closing shards on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetarchive_core::{Classification, Event, classify};
    use tempfile::TempDir;

    const HOUR_US: i64 = 3_600_000_000;

    fn post(time_us: i64) -> ArchiveRecord {
        let frame = format!(
            r#"{{"did":"did:plc:u1","time_us":{time_us},"kind":"commit","commit":{{"rev":"r","operation":"create","collection":"app.bsky.feed.post","rkey":"k{time_us}","record":{{"text":"hello"}}}}}}"#
        );
        match classify(&Event::from_json(&frame).unwrap(), ArchiveMode::PostsOnly) {
            Classification::Keep(record) => record,
            Classification::Drop(reason) => panic!("unexpected drop: {reason:?}"),
        }
    }

    fn batch(times: &[i64]) -> Batch {
        Batch {
            records: times.iter().map(|t| post(*t)).collect(),
        }
    }

    fn router(root: &Path) -> FileRouter {
        FileRouter::new(
            RouterConfig {
                output_root: root.to_path_buf(),
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
            ArchiveMode::PostsOnly,
        )
    }

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_write_creates_shard() {
        let tmp = TempDir::new().unwrap();
        let router = router(tmp.path());

        let report = router.write(&batch(&[100_000_000, 100_000_100])).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.records_written, 2);
        assert_eq!(report.shards, 1);

        let path = tmp.path().join("data/1970-01/01/posts_19700101_00.jsonl");
        let written = lines(&path);
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["time_us"], 100_000_000);
        assert_eq!(written[1]["time_us"], 100_000_100);
    }

    #[test]
    fn test_batch_straddling_hour_boundary() {
        let tmp = TempDir::new().unwrap();
        let router = router(tmp.path());

        let t0 = HOUR_US - 1;
        let report = router.write(&batch(&[t0, HOUR_US, t0 - 5])).unwrap();
        assert_eq!(report.shards, 2);

        let first = lines(&tmp.path().join("data/1970-01/01/posts_19700101_00.jsonl"));
        let second = lines(&tmp.path().join("data/1970-01/01/posts_19700101_01.jsonl"));
        let first_times: Vec<i64> = first.iter().map(|v| v["time_us"].as_i64().unwrap()).collect();
        assert_eq!(first_times, vec![t0, t0 - 5]);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_partition_preserves_order() {
        let records: Vec<ArchiveRecord> = [1, HOUR_US, 2, HOUR_US + 1, 3]
            .iter()
            .map(|t| post(*t))
            .collect();
        let groups = FileRouter::partition(&records);
        assert_eq!(groups.len(), 2);
        let first: Vec<i64> = groups[0].1.iter().map(|r| r.time_us).collect();
        let second: Vec<i64> = groups[1].1.iter().map(|r| r.time_us).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![HOUR_US, HOUR_US + 1]);
    }

    #[test]
    fn test_appends_across_routers() {
        let tmp = TempDir::new().unwrap();
        router(tmp.path()).write(&batch(&[10])).unwrap();
        router(tmp.path()).write(&batch(&[20])).unwrap();

        let written = lines(&tmp.path().join("data/1970-01/01/posts_19700101_00.jsonl"));
        assert_eq!(written.len(), 2);
    }

    #[test]
    fn test_lru_eviction_keeps_data() {
        let tmp = TempDir::new().unwrap();
        let router = FileRouter::new(
            RouterConfig {
                output_root: tmp.path().to_path_buf(),
                max_open_shards: 1,
                fsync: false,
                ..Default::default()
            },
            ArchiveMode::PostsOnly,
        );

        for hour in 0..3 {
            router.write(&batch(&[hour * HOUR_US])).unwrap();
            assert!(router.open_shards() <= 1);
        }
        router.write(&batch(&[5])).unwrap();
        router.close_all().unwrap();
        assert_eq!(router.open_shards(), 0);

        assert_eq!(lines(&tmp.path().join("data/1970-01/01/posts_19700101_00.jsonl")).len(), 2);
        assert_eq!(lines(&tmp.path().join("data/1970-01/01/posts_19700101_02.jsonl")).len(), 1);
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let tmp = TempDir::new().unwrap();
        let router = Arc::new(router(tmp.path()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        router.write(&batch(&[t * 1_000 + i])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let written = lines(&tmp.path().join("data/1970-01/01/posts_19700101_00.jsonl"));
        assert_eq!(written.len(), 100);
    }

    #[test]
    fn test_unwritable_root_reports_loss() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let router = router(&blocker);
        let report = router.write(&batch(&[1, 2])).unwrap();
        assert_eq!(report.records_written, 0);
        assert_eq!(report.records_lost, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.into_result(), Err(Error::Storage(_))));
    }

    #[test]
    fn test_non_posts_layout() {
        let tmp = TempDir::new().unwrap();
        let router = FileRouter::new(
            RouterConfig {
                output_root: tmp.path().to_path_buf(),
                ..Default::default()
            },
            ArchiveMode::NonPosts,
        );
        let key = ShardKey::from_time_us(1_725_911_162_329_308).unwrap();
        assert_eq!(
            router.shard_path(key),
            tmp.path().join("data_non_posts/2024-09/09/records_20240909_19.jsonl")
        );
    }

    /// In-memory shard that can fail a write partway or fail a sync.
    #[derive(Default)]
    struct FlakyFile {
        data: Vec<u8>,
        write_budget: Option<usize>,
        sync_failures: u32,
        truncate_fails: bool,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_budget {
                Some(0) => return Err(io::Error::other("no space left on device")),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            if let Some(budget) = &mut self.write_budget {
                *budget -= n;
            }
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ShardFile for FlakyFile {
        fn size(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::other("read-only file system"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.sync_failures > 0 {
                self.sync_failures -= 1;
                return Err(io::Error::other("input/output error"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_sync_is_rolled_back_before_retry() {
        let mut file = FlakyFile {
            data: b"{\"n\":0}\n".to_vec(),
            sync_failures: 1,
            ..Default::default()
        };
        let lines = b"{\"n\":1}\n{\"n\":2}\n";

        let err = append_once(&mut file, lines, true).unwrap_err();
        assert!(matches!(err, AppendError::RolledBack(_)));
        assert_eq!(file.data, b"{\"n\":0}\n");

        append_once(&mut file, lines, true).unwrap();
        assert_eq!(file.data, b"{\"n\":0}\n{\"n\":1}\n{\"n\":2}\n");
    }

    #[test]
    fn test_partial_write_leaves_no_torn_line() {
        let mut file = FlakyFile {
            write_budget: Some(5),
            ..Default::default()
        };
        let lines = b"{\"n\":1}\n";

        assert!(matches!(
            append_once(&mut file, lines, false),
            Err(AppendError::RolledBack(_))
        ));
        assert!(file.data.is_empty());

        file.write_budget = None;
        append_once(&mut file, lines, false).unwrap();
        assert_eq!(file.data, lines);
    }

    #[test]
    fn test_failed_rollback_is_not_retried() {
        let mut file = FlakyFile {
            sync_failures: 1,
            truncate_fails: true,
            ..Default::default()
        };
        let err = append_once(&mut file, b"{}\n", true).unwrap_err();
        assert!(matches!(err, AppendError::Torn(Error::Storage(_))));
    }
}
