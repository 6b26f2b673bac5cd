//! The archive pipeline.
//!
//! Two tasks joined by one bounded channel:
//!
//! - the connection task ([`ConnectionManager`]) reads frames and sends
//!   decoded events, in arrival order;
//! - the processing task ([`Processor`]) classifies each event, advances the
//!   cursor, feeds the rate monitor and live publisher, and buffers kept
//!   records for the file router.
//!
//! With handle resolution on, kept posts wait for their lookups in an ordered
//! queue of up to `max_concurrent` entries. Lookups overlap, but outcomes
//! leave the queue in arrival order, so publishing and shard lines keep
//! stream order.
//!
//! The channel is the back-pressure point: a slow disk fills it and the
//! connection stops reading. Stopping is cooperative. [`StopHandle::stop`]
//! makes the connection task close the socket after the current frame; its
//! sender is dropped, the processor drains what is left, performs a final
//! flush and every shard is closed before [`ArchivePipeline::run`] returns.

use crate::buffer::{Batch, BatchBuffer};
use crate::config::PipelineConfig;
use crate::connection::ConnectionManager;
use crate::cursor::Cursor;
use crate::publisher::{LivePublisher, Subscription, print_texts};
use crate::rate::RateMonitor;
use crate::resolver::{HandleResolver, XrpcHandleResolver};
use crate::router::FileRouter;
use crate::Result;
use jetarchive_core::metrics::{increment, increment_reason, set_gauge};
use futures_util::StreamExt;
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::FuturesOrdered;
use jetarchive_core::{ArchiveMode, ArchiveRecord, Classification, DropReason, Event, classify};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Requests a graceful stop of a running pipeline. Cheap to clone; safe to
/// call from a signal handler thread.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("Stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Totals reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events decoded from the stream.
    pub events: u64,
    pub kept: u64,
    pub dropped: u64,
    /// Frames that could not be decoded at all.
    pub malformed_frames: u64,
    pub records_written: u64,
    pub records_lost: u64,
    pub batches_lost: u64,
    pub reconnects: u64,
    /// Cursor at the end of the run; pass it back with `--cursor` to resume.
    pub cursor: Option<i64>,
}

/// A configured, not yet running archiver.
pub struct ArchivePipeline {
    config: PipelineConfig,
    cursor: Cursor,
    stop_tx: Arc<watch::Sender<bool>>,
    publisher: LivePublisher,
    resolver: Option<Arc<dyn HandleResolver>>,
}

impl ArchivePipeline {
    /// Validate `config` and prepare a run. No network or file activity.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let resolver: Option<Arc<dyn HandleResolver>> = if config.features.resolve_handles {
            Some(Arc::new(XrpcHandleResolver::new(&config.resolver)?))
        } else {
            None
        };

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            cursor: Cursor::new(config.cursor),
            publisher: LivePublisher::new(config.publisher.clone()),
            stop_tx: Arc::new(stop_tx),
            resolver,
            config,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Shared view of the resume cursor.
    pub fn cursor(&self) -> Cursor {
        self.cursor.clone()
    }

    /// Live feed of kept records, starting now.
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Run until stopped. Only a fatal storage error (with
    /// `storage_failure_fatal` set) or a task failure returns `Err`.
    pub async fn run(self) -> Result<RunSummary> {
        let Self {
            config,
            cursor,
            stop_tx,
            publisher,
            resolver,
        } = self;

        set_gauge("archive_running", 1.0);
        info!(
            mode = %config.mode,
            cursor = ?cursor.get(),
            output = %config.router.output_root.join(config.mode.directory()).display(),
            "Archive pipeline starting"
        );
        if let Some(credentials) = &config.credentials {
            info!(
                username = %credentials.username,
                "Credentials supplied; the firehose needs none, ignoring"
            );
        }

        let printer = config
            .features
            .stream_stdout
            .then(|| tokio::spawn(print_texts(publisher.subscribe())));

        let router = Arc::new(FileRouter::new(config.router.clone(), config.mode));
        let (events_tx, events_rx) = mpsc::channel(config.connection.queue_capacity);

        let manager = ConnectionManager::new(config.connection.clone());
        let connection_stats = manager.stats();
        let connection = tokio::spawn(manager.run(cursor.clone(), events_tx, stop_tx.subscribe()));

        let mut processor = Processor::new(
            &config,
            cursor.clone(),
            Arc::clone(&router),
            publisher,
            resolver,
        );
        let outcome = processor.run(events_rx).await;

        // Covers the fatal path; a no-op after a requested stop.
        stop_tx.send_replace(true);
        connection.await?;

        let closing = Arc::clone(&router);
        if let Err(e) = tokio::task::spawn_blocking(move || closing.close_all()).await? {
            warn!("Failed to close shards cleanly: {}", e);
        }

        let Processor {
            stats,
            rate,
            publisher,
            ..
        } = processor;
        drop(publisher);
        if let Some(printer) = printer
            && let Err(e) = printer.await
        {
            warn!("Stdout printer failed: {}", e);
        }

        if config.features.measure_rate {
            rate.final_report(stats.records_written, Instant::now());
        }
        set_gauge("archive_running", 0.0);

        let summary = RunSummary {
            events: stats.events,
            kept: stats.kept,
            dropped: stats.dropped,
            malformed_frames: connection_stats.malformed_frames.load(Ordering::Relaxed),
            records_written: stats.records_written,
            records_lost: stats.records_lost,
            batches_lost: stats.batches_lost,
            reconnects: connection_stats.reconnects.load(Ordering::Relaxed),
            cursor: cursor.get(),
        };
        info!(?summary, "Archive pipeline stopped");

        outcome.map(|()| summary)
    }
}

#[derive(Debug, Default)]
struct ProcessorStats {
    events: u64,
    kept: u64,
    dropped: u64,
    records_written: u64,
    records_lost: u64,
    batches_lost: u64,
}

/// Per-event work between the connection and the disk.
struct Processor {
    mode: ArchiveMode,
    measure_rate: bool,
    storage_failure_fatal: bool,
    resolve_timeout: Duration,
    max_in_flight: usize,
    in_flight: FuturesOrdered<BoxFuture<'static, Classification>>,
    cursor: Cursor,
    buffer: BatchBuffer,
    router: Arc<FileRouter>,
    publisher: LivePublisher,
    resolver: Option<Arc<dyn HandleResolver>>,
    rate: RateMonitor,
    stats: ProcessorStats,
}

impl Processor {
    fn new(
        config: &PipelineConfig,
        cursor: Cursor,
        router: Arc<FileRouter>,
        publisher: LivePublisher,
        resolver: Option<Arc<dyn HandleResolver>>,
    ) -> Self {
        Self {
            mode: config.mode,
            measure_rate: config.features.measure_rate,
            storage_failure_fatal: config.storage_failure_fatal,
            resolve_timeout: config.resolver.timeout,
            max_in_flight: config.resolver.max_concurrent.max(1),
            in_flight: FuturesOrdered::new(),
            cursor,
            buffer: BatchBuffer::new(config.batch.clone()),
            router,
            publisher,
            resolver,
            rate: RateMonitor::new(config.mode.unit(), Instant::now()),
            stats: ProcessorStats::default(),
        }
    }

    /// Consume events until the connection side hangs up, then flush.
    async fn run(&mut self, mut events: mpsc::Receiver<Event>) -> Result<()> {
        let mut report = tokio::time::interval(self.rate.report_interval());
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_due = self.buffer.pending() > 0;
            let deadline = tokio::time::Instant::from_std(self.buffer.deadline());

            tokio::select! {
                next = events.recv(), if self.in_flight.len() < self.max_in_flight => match next {
                    Some(event) => self.process(event).await?,
                    None => break,
                },
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.admit(outcome).await?;
                }
                _ = tokio::time::sleep_until(deadline), if flush_due => {
                    if let Some(batch) = self.buffer.maybe_flush(Instant::now()) {
                        self.flush(batch).await?;
                    }
                }
                _ = report.tick(), if self.measure_rate => {
                    self.rate.maybe_report(Instant::now());
                }
            }
        }

        self.drain().await?;
        let pending = self.buffer.pending();
        if pending > 0 {
            info!(records = pending, "Final flush");
        }
        let batch = self.buffer.flush_now();
        self.flush(batch).await
    }

    /// Classify one event and move the cursor past it. The outcome is
    /// admitted right away unless earlier outcomes are still resolving.
    async fn process(&mut self, event: Event) -> Result<()> {
        self.stats.events += 1;
        increment("archive_events_total", 1);

        let classification = classify(&event, self.mode);
        let position = self.cursor.advance(event.time_us);
        set_gauge("archive_cursor_time_us", position as f64);

        match &classification {
            Classification::Keep(_) => {
                self.stats.kept += 1;
                increment("archive_events_kept_total", 1);
            }
            Classification::Drop(reason) => {
                self.stats.dropped += 1;
                increment_reason("archive_events_dropped_total", reason.label());
                if let DropReason::Malformed(field) = reason {
                    debug!(did = %event.did, time_us = event.time_us, field, "Dropping event without required field");
                }
            }
        }

        let resolver = self
            .resolver
            .clone()
            .filter(|_| self.mode == ArchiveMode::PostsOnly);
        let outcome = match (classification, resolver) {
            (Classification::Keep(record), Some(resolver)) => {
                resolve_handle(resolver, record, self.resolve_timeout).boxed()
            }
            (classification, _) if !self.in_flight.is_empty() => {
                future::ready(classification).boxed()
            }
            (classification, _) => return self.admit(classification).await,
        };
        self.in_flight.push_back(outcome);
        Ok(())
    }

    /// Wait for every queued outcome and admit it.
    async fn drain(&mut self) -> Result<()> {
        while let Some(outcome) = self.in_flight.next().await {
            self.admit(outcome).await?;
        }
        Ok(())
    }

    /// Publish and buffer a kept record, or count a dropped one.
    async fn admit(&mut self, outcome: Classification) -> Result<()> {
        let batch = match outcome {
            Classification::Keep(record) => {
                self.rate.record(1, Instant::now());
                self.publisher.publish(&record).await;
                self.buffer.append(record)
            }
            Classification::Drop(_) => self.buffer.note_dropped(),
        };

        match batch {
            Some(batch) => self.flush(batch).await,
            None => Ok(()),
        }
    }

    async fn flush(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let records = batch.len();
        let last_time_us = batch.last_time_us();
        let router = Arc::clone(&self.router);
        let report = tokio::task::spawn_blocking(move || router.write(&batch)).await??;

        self.stats.records_written += report.records_written as u64;
        increment("archive_batches_flushed_total", 1);

        if report.is_complete() {
            debug!(records, shards = report.shards, ?last_time_us, "Flushed batch");
            return Ok(());
        }

        self.stats.records_lost += report.records_lost as u64;
        self.stats.batches_lost += 1;
        increment("archive_batches_lost_total", 1);

        if self.storage_failure_fatal {
            return report.into_result().map(|_| ());
        }
        error!(
            lost = report.records_lost,
            written = report.records_written,
            "Batch lost after retries: {}",
            report.failures.join("; ")
        );
        Ok(())
    }
}

/// Fill in the handle for a kept post, falling back to its DID.
async fn resolve_handle(
    resolver: Arc<dyn HandleResolver>,
    mut record: ArchiveRecord,
    timeout: Duration,
) -> Classification {
    let handle = tokio::time::timeout(timeout, resolver.resolve(&record.did))
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| record.did.clone());
    record.set_handle(handle);
    Classification::Keep(record)
}
