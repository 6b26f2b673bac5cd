//! Live record feed for in-process consumers.
//!
//! Every kept record is offered to all current subscribers in arrival order,
//! alongside (not instead of) archival. Each subscriber reads from its own
//! bounded queue; what happens when that queue is full is the
//! [`OverflowPolicy`]:
//!
//! - `DropOldest` (default): the subscriber skips ahead and a rate-limited
//!   warning is logged. Archival never waits.
//! - `Block`: publishing waits for the slowest subscriber. Use only when
//!   every consumer must see every record.
//!
//! Subscriptions end when the pipeline stops and the publisher is dropped.

use futures_util::Stream;
use jetarchive_core::ArchiveRecord;
use jetarchive_core::metrics::increment;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-oldest" => Ok(Self::DropOldest),
            "block" => Ok(Self::Block),
            other => Err(format!(
                "unknown overflow policy '{other}': expected drop-oldest or block"
            )),
        }
    }
}

/// Configuration for the live publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Queue length per subscriber.
    /// Default: 1024
    pub capacity: usize,

    pub overflow: OverflowPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Fan-out of kept records to subscribers.
pub struct LivePublisher {
    config: PublisherConfig,
    broadcast: broadcast::Sender<Arc<ArchiveRecord>>,
    queues: Mutex<Vec<mpsc::Sender<Arc<ArchiveRecord>>>>,
}

impl LivePublisher {
    pub fn new(config: PublisherConfig) -> Self {
        let (broadcast, _) = broadcast::channel(config.capacity.max(1));
        Self {
            config,
            broadcast,
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Start a new subscription. It sees records published from now on.
    pub fn subscribe(&self) -> Subscription {
        let inner = match self.config.overflow {
            OverflowPolicy::DropOldest => Inner::Broadcast(self.broadcast.subscribe()),
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(self.config.capacity.max(1));
                self.queues.lock().push(tx);
                Inner::Queue(rx)
            }
        };
        debug!(policy = ?self.config.overflow, "Live subscriber added");
        Subscription {
            inner,
            lag: LagTracker::new(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast.receiver_count()
            + self.queues.lock().iter().filter(|q| !q.is_closed()).count()
    }

    /// Offer a record to every subscriber.
    pub async fn publish(&self, record: &ArchiveRecord) {
        if self.subscriber_count() == 0 {
            return;
        }
        let record = Arc::new(record.clone());

        if self.broadcast.receiver_count() > 0 {
            // Only fails when every receiver is gone.
            let _ = self.broadcast.send(Arc::clone(&record));
        }

        let queues: Vec<_> = self.queues.lock().clone();
        if queues.is_empty() {
            return;
        }
        let mut closed = false;
        for queue in &queues {
            if queue.send(Arc::clone(&record)).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.queues.lock().retain(|q| !q.is_closed());
            debug!("Dropped closed live subscribers");
        }
    }
}

enum Inner {
    Broadcast(broadcast::Receiver<Arc<ArchiveRecord>>),
    Queue(mpsc::Receiver<Arc<ArchiveRecord>>),
}

/// Rate-limits lag warnings so a slow consumer doesn't flood the log.
struct LagTracker {
    interval: Duration,
    last_warning: Instant,
    lags_since_warning: u64,
    skipped_since_warning: u64,
}

impl LagTracker {
    fn new() -> Self {
        Self {
            interval: Duration::from_secs(10),
            last_warning: Instant::now(),
            lags_since_warning: 0,
            skipped_since_warning: 0,
        }
    }

    fn note(&mut self, skipped: u64) {
        increment("archive_subscriber_lagged_total", skipped);
        self.lags_since_warning += 1;
        self.skipped_since_warning += skipped;

        if self.lags_since_warning == 1 || self.last_warning.elapsed() >= self.interval {
            warn!(
                "Live subscriber lagged {} times, skipped {} records in last {:?}",
                self.lags_since_warning,
                self.skipped_since_warning,
                self.last_warning.elapsed()
            );
            self.last_warning = Instant::now();
            self.lags_since_warning = 0;
            self.skipped_since_warning = 0;
        }
    }
}

/// One consumer's view of the live feed.
pub struct Subscription {
    inner: Inner,
    lag: LagTracker,
}

impl Subscription {
    /// Next record, or `None` once the pipeline has stopped.
    pub async fn next(&mut self) -> Option<Arc<ArchiveRecord>> {
        match &mut self.inner {
            Inner::Queue(rx) => rx.recv().await,
            Inner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(record) => return Some(record),
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => self.lag.note(skipped),
                }
            },
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Arc<ArchiveRecord>> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|record| (record, sub))
        })
    }
}

/// Print the text of every record that has one to stdout, until the feed
/// ends or stdout goes away.
pub async fn print_texts(subscription: Subscription) {
    write_texts(subscription, io::stdout()).await;
}

async fn write_texts<W: Write>(mut subscription: Subscription, mut out: W) {
    while let Some(record) = subscription.next().await {
        let Some(text) = record.text() else {
            continue;
        };
        if let Err(e) = writeln!(out, "🖊️: {text}").and_then(|()| out.flush()) {
            debug!("Stopped printing records: {}", e);
            return;
        }
    }
}
