//! Batch buffer.
//!
//! Kept records accumulate in arrival order until either trigger fires:
//!
//! - **count**: `max_events` classified events have been seen since the last
//!   flush. Dropped events count too, so a quiet mode (few keeps) still
//!   flushes at the cadence of the stream.
//! - **time**: `flush_interval` has passed since the last flush and there is
//!   something to write.
//!
//! A flush swaps the pending records out for an empty vector, so a record is
//! never part of two batches.

use jetarchive_core::ArchiveRecord;
use std::mem;
use std::time::{Duration, Instant};

/// Flush thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Classified events per batch.
    /// Default: 100
    pub max_events: usize,

    /// Longest time a kept record may wait in memory.
    /// Default: 1s
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Records handed to the file router in one go.
#[derive(Debug, Default)]
pub struct Batch {
    /// Kept records, in arrival order.
    pub records: Vec<ArchiveRecord>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Event time of the newest record, used for logging the flushed position.
    pub fn last_time_us(&self) -> Option<i64> {
        self.records.last().map(|r| r.time_us)
    }
}

/// In-memory accumulator between the classifier and the file router.
#[derive(Debug)]
pub struct BatchBuffer {
    config: BatchConfig,
    records: Vec<ArchiveRecord>,
    events_seen: usize,
    last_flush: Instant,
}

impl BatchBuffer {
    pub fn new(config: BatchConfig) -> Self {
        let records = Vec::with_capacity(config.max_events);
        Self {
            config,
            records,
            events_seen: 0,
            last_flush: Instant::now(),
        }
    }

    /// Add a kept record. Returns the batch if the count threshold was reached.
    pub fn append(&mut self, record: ArchiveRecord) -> Option<Batch> {
        self.records.push(record);
        self.note_event()
    }

    /// Count a dropped event toward the threshold.
    pub fn note_dropped(&mut self) -> Option<Batch> {
        self.note_event()
    }

    fn note_event(&mut self) -> Option<Batch> {
        self.events_seen += 1;
        (self.events_seen >= self.config.max_events).then(|| self.flush_now())
    }

    /// Time-based trigger. Returns a batch if the interval has passed and
    /// records are pending.
    pub fn maybe_flush(&mut self, now: Instant) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        if now.saturating_duration_since(self.last_flush) < self.config.flush_interval {
            return None;
        }
        Some(self.flush_now())
    }

    /// Take everything pending, even if empty.
    pub fn flush_now(&mut self) -> Batch {
        self.last_flush = Instant::now();
        let records = mem::replace(
            &mut self.records,
            Vec::with_capacity(self.config.max_events),
        );
        self.events_seen = 0;
        Batch { records }
    }

    /// Kept records waiting for a flush.
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// When the time trigger fires for what is pending now. Every flush,
    /// whichever trigger caused it, pushes the deadline out by a full interval.
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.config.flush_interval
    }
}
