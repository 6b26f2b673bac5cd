//! Firehose connection management.
//!
//! [`ConnectionManager`] owns the WebSocket lifecycle:
//!
//! ```text
//! Idle → Connecting → Streaming → Reconnecting → Connecting … → Stopped
//! ```
//!
//! It is the only component that touches the socket. Decoded events leave
//! through a single bounded channel in arrival order; when the channel is
//! full the read loop stops pulling frames, so a slow consumer throttles the
//! socket instead of growing memory.
//!
//! Any transport failure (connect error, read error, close frame, read
//! timeout) leads to `Reconnecting`. Reconnects are unbounded; only the stop
//! signal reaches `Stopped`. Each connect attempt re-reads the shared
//! [`Cursor`] so playback resumes at the last classified event.

use crate::cursor::Cursor;
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use jetarchive_core::metrics::{increment, increment_reason};
use jetarchive_core::{DEFAULT_JETSTREAM_URL, Event};
use rand::Rng;
use reqwest::Url;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First (and post-reset) backoff ceiling.
    pub min_delay: Duration,

    /// Upper bound for the backoff ceiling.
    pub max_delay: Duration,

    /// Growth factor applied after each failure. Must be >= 1.
    pub multiplier: f64,

    /// Sleep a uniformly random time in `[0, ceiling]` instead of the ceiling.
    pub jitter: bool,

    /// A connection that streamed at least this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            stable_after: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with a cap and optional full jitter.
///
/// The ceiling sequence is non-decreasing up to `max_delay` until
/// [`Backoff::reset`] brings it back to `min_delay`.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    ceiling: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let ceiling = config.min_delay;
        Self {
            config,
            ceiling,
            attempt: 0,
        }
    }

    /// Number of failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return the current ceiling and grow it for the next failure.
    pub fn next_ceiling(&mut self) -> Duration {
        let current = self.ceiling;
        self.attempt = self.attempt.saturating_add(1);
        self.ceiling = current
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay)
            .max(current);
        current
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.next_ceiling();
        if self.config.jitter {
            full_jitter(ceiling)
        } else {
            ceiling
        }
    }

    /// Back to `min_delay` after a stable streaming period.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "connection stable, reset backoff");
        }
        self.attempt = 0;
        self.ceiling = self.config.min_delay;
    }
}

fn full_jitter(ceiling: Duration) -> Duration {
    let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket subscribe endpoint.
    pub endpoint: String,

    /// No frame within this window counts as a dead connection.
    pub read_timeout: Duration,

    /// Capacity of the decoded-event channel.
    pub queue_capacity: usize,

    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_JETSTREAM_URL.to_string(),
            read_timeout: Duration::from_secs(60),
            queue_capacity: 64,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Build the subscribe URL, attaching `cursor` when one is set.
pub fn subscribe_url(endpoint: &str, cursor: Option<i64>) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::Config(format!(
            "endpoint '{endpoint}' must use ws:// or wss://"
        )));
    }
    if let Some(cursor) = cursor {
        url.query_pairs_mut()
            .append_pair("cursor", &cursor.to_string());
    }
    Ok(url)
}

/// Lifecycle state, observable through [`ConnectionManager::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Counters reported when the manager stops.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connects: AtomicU64,
    pub reconnects: AtomicU64,
    pub frames: AtomicU64,
    pub malformed_frames: AtomicU64,
}

/// Why a streaming session ended.
enum SessionEnd {
    Shutdown,
    ReceiverGone,
    Failed(&'static str, String),
}

/// Owns the firehose connection and its reconnect loop.
pub struct ConnectionManager {
    config: ConnectionConfig,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let backoff = Backoff::new(config.reconnect.clone());
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            backoff,
            state,
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    /// Subscribe to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Shared counters; remain readable after [`run`](Self::run) returns.
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Stream events into `events` until `shutdown` flips to true or the
    /// receiver is dropped.
    pub async fn run(
        mut self,
        cursor: Cursor,
        events: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let url = match subscribe_url(&self.config.endpoint, cursor.get()) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Cannot build subscribe URL: {}", e);
                    break;
                }
            };

            match cursor.get() {
                Some(position) => info!(cursor = position, "Connecting to firehose (playback)"),
                None => info!("Connecting to firehose (live)"),
            }

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            let ws = match connected {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, "Connection failed: {}", e);
                    increment_reason("archive_reconnects_total", "connect_error");
                    if !self.wait_backoff(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.stats.connects.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Streaming);
            info!(endpoint = %self.config.endpoint, "Connected to firehose");
            let connected_at = Instant::now();

            match self.stream(ws, &events, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::ReceiverGone => {
                    debug!("Event receiver dropped, stopping connection");
                    break;
                }
                SessionEnd::Failed(reason, detail) => {
                    if connected_at.elapsed() >= self.config.reconnect.stable_after {
                        self.backoff.reset();
                    }
                    warn!(
                        reason,
                        streamed_secs = connected_at.elapsed().as_secs(),
                        "Connection lost: {}",
                        detail
                    );
                    increment_reason("archive_reconnects_total", reason);
                    if !self.wait_backoff(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!(
            connects = self.stats.connects.load(Ordering::Relaxed),
            reconnects = self.stats.reconnects.load(Ordering::Relaxed),
            "Connection manager stopped"
        );
    }

    /// Sleep for the next backoff delay. Returns false if stopped meanwhile.
    async fn wait_backoff(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ConnectionState::Reconnecting);
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let delay = self.backoff.next_delay();
        info!(
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn stream<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        events: &mpsc::Sender<Event>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                next = tokio::time::timeout(self.config.read_timeout, read.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    return SessionEnd::Failed(
                        "read_timeout",
                        format!("no frame for {:?}", self.config.read_timeout),
                    );
                }
                Ok(None) => return SessionEnd::Failed("closed", "stream ended".to_string()),
                Ok(Some(Err(e))) => return SessionEnd::Failed("read_error", e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            };

            let delivered = match frame {
                Message::Text(text) => self.deliver(text.as_str(), events).await,
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => self.deliver(text, events).await,
                    Err(e) => {
                        self.malformed(&format!("binary frame is not UTF-8: {e}"));
                        true
                    }
                },
                Message::Ping(data) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return SessionEnd::Failed("write_error", e.to_string());
                    }
                    true
                }
                Message::Close(frame) => {
                    return SessionEnd::Failed("closed", format!("server sent close: {frame:?}"));
                }
                Message::Pong(_) | Message::Frame(_) => true,
            };

            if !delivered {
                return SessionEnd::ReceiverGone;
            }
        }
    }

    /// Decode a frame and hand it downstream. Returns false if the receiver is gone.
    async fn deliver(&self, text: &str, events: &mpsc::Sender<Event>) -> bool {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        match Event::from_json(text) {
            Ok(event) => events.send(event).await.is_ok(),
            Err(e) => {
                self.malformed(&e.to_string());
                true
            }
        }
    }

    fn malformed(&self, detail: &str) {
        self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
        increment("archive_frames_malformed_total", 1);
        debug!("Skipping malformed frame: {}", detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: false,
            stable_after: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<Duration> = (0..12).map(|_| backoff.next_delay()).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(2));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    }

    #[test]
    fn test_reset_returns_to_minimum() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let mut backoff = Backoff::new(ReconnectConfig {
            jitter: true,
            ..no_jitter()
        });
        let mut ceiling = Duration::from_millis(100);
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            ceiling = (ceiling * 2).min(Duration::from_secs(2));
        }
    }

    #[test]
    fn test_multiplier_of_one_is_constant() {
        let mut backoff = Backoff::new(ReconnectConfig {
            multiplier: 1.0,
            ..no_jitter()
        });
        assert_eq!(backoff.next_delay(), backoff.next_delay());
    }

    #[test]
    fn test_subscribe_url_without_cursor() {
        let url = subscribe_url(DEFAULT_JETSTREAM_URL, None).unwrap();
        assert_eq!(url.as_str(), DEFAULT_JETSTREAM_URL);
    }

    #[test]
    fn test_subscribe_url_with_cursor() {
        let url = subscribe_url("ws://127.0.0.1:6008/subscribe", Some(100_000_050)).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:6008/subscribe?cursor=100000050");
    }

    #[test]
    fn test_subscribe_url_keeps_existing_query() {
        let url = subscribe_url(
            "wss://example.com/subscribe?wantedCollections=app.bsky.feed.post",
            Some(7),
        )
        .unwrap();
        assert_eq!(
            url.query(),
            Some("wantedCollections=app.bsky.feed.post&cursor=7")
        );
    }

    #[tokio::test]
    async fn test_streams_events_and_stops() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Message::text(
                r#"{"did":"did:plc:u1","time_us":7,"kind":"identity","identity":{}}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::text("{oops".to_string())).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        });

        let manager = ConnectionManager::new(ConnectionConfig {
            endpoint: format!("ws://{addr}/subscribe"),
            ..Default::default()
        });
        let mut state = manager.state();
        let stats = manager.stats();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(Cursor::new(None), events_tx, stop_rx));

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.time_us, 7);
        assert_eq!(*state.borrow_and_update(), ConnectionState::Streaming);

        stop_tx.send_replace(true);
        task.await.unwrap();
        assert!(events_rx.recv().await.is_none());
        assert_eq!(*state.borrow(), ConnectionState::Stopped);
        assert_eq!(stats.connects.load(Ordering::Relaxed), 1);
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_subscribe_url_rejects_http() {
        assert!(matches!(
            subscribe_url("https://example.com/subscribe", None),
            Err(Error::Config(_))
        ));
        assert!(matches!(subscribe_url("not a url", None), Err(Error::Config(_))));
    }
}
