//! Prometheus metrics helpers for the archiver.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across the pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jetarchive_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("archive_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `archive_`
//! - Suffix: unit or type (`_total`, `_time_us`, `_per_minute`)
//! - Labels: only small closed sets (`reason`, `result`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_archive_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_archive_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` and serves `/metrics` from a background task.
/// Bind errors are returned to the caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<SocketAddr, std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(addr)
}

/// Register descriptions for the archiver's metrics.
///
/// Called automatically by [`init_metrics`].
fn register_archive_metrics() {
    // =========================================================================
    // Stream
    // =========================================================================

    describe_counter!("archive_events_total", "Events decoded from the firehose");
    describe_counter!(
        "archive_events_kept_total",
        "Events kept by the active archive mode"
    );
    describe_counter!(
        "archive_events_dropped_total",
        "Events dropped by classification (label: reason)"
    );
    describe_counter!(
        "archive_frames_malformed_total",
        "Frames that could not be decoded into an event"
    );
    describe_counter!(
        "archive_reconnects_total",
        "Reconnection attempts (label: reason)"
    );
    describe_gauge!(
        "archive_cursor_time_us",
        "Event time of the last classified event (microseconds)"
    );

    // =========================================================================
    // Storage
    // =========================================================================

    describe_counter!(
        "archive_records_written_total",
        "Records appended to shard files"
    );
    describe_counter!("archive_batches_flushed_total", "Batches flushed to disk");
    describe_counter!(
        "archive_batches_lost_total",
        "Batches dropped after exhausting storage retries"
    );
    describe_counter!(
        "archive_storage_retries_total",
        "Shard write attempts that were retried"
    );
    describe_gauge!("archive_open_shards", "Shard files currently held open");

    // =========================================================================
    // Side channels
    // =========================================================================

    describe_gauge!(
        "archive_records_per_minute",
        "Kept records per minute over the last minute"
    );
    describe_counter!(
        "archive_subscriber_lagged_total",
        "Records skipped by live subscribers that fell behind"
    );
    describe_counter!(
        "archive_handle_lookups_total",
        "Handle resolutions (label: result)"
    );
    describe_gauge!(
        "archive_running",
        "Whether the archiver is running (1=yes, 0=no)"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter carrying a `reason` label.
#[inline]
pub fn increment_reason(name: &'static str, reason: &'static str) {
    metrics::counter!(name, "reason" => reason).increment(1);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
