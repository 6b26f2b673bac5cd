//! Jetstream archiver ingestion pipeline.
//!
//! This crate turns the Bluesky Jetstream firehose into hourly JSONL shards
//! on disk, optionally re-emitting kept records to in-process subscribers.
//!
//! # Modules
//!
//! - [`connection`] - WebSocket lifecycle, resume cursor, reconnect backoff
//! - [`buffer`] - Count/time triggered batching
//! - [`router`] - Hourly shard files
//! - [`pipeline`] - Wires the stages together; entry point for a run
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  ConnectionManager  │  WebSocket, backoff + jitter, ?cursor=
//! └──────────┬──────────┘
//!            │ bounded channel (back-pressure)
//!            ▼
//! ┌─────────────────────┐
//! │     classify()      │──────▶ Cursor (advanced per event)
//! └──────────┬──────────┘
//!            ├──────────────────▶ RateMonitor
//!            ├──────────────────▶ LivePublisher → subscribers
//!            ▼
//! ┌─────────────────────┐
//! │     BatchBuffer     │  flush on N events or every interval
//! └──────────┬──────────┘
//!            ▼
//! ┌─────────────────────┐
//! │     FileRouter      │  <mode dir>/YYYY-MM/DD/<prefix>_YYYYMMDD_HH.jsonl
//! └─────────────────────┘
//! ```
//!
//! Delivery to disk is at-least-once: the cursor moves when an event is
//! classified, before its batch is flushed.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod rate;
pub mod resolver;
pub mod router;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use buffer::{Batch, BatchBuffer, BatchConfig};
pub use config::{Credentials, Features, PipelineConfig, mode_from_flags, parse_cursor};
pub use connection::{
    Backoff, ConnectionConfig, ConnectionManager, ConnectionState, ReconnectConfig,
};
pub use cursor::Cursor;
pub use pipeline::{ArchivePipeline, RunSummary, StopHandle};
pub use publisher::{LivePublisher, OverflowPolicy, PublisherConfig, Subscription};
pub use rate::RateMonitor;
pub use resolver::{HandleResolver, ResolverConfig, XrpcHandleResolver};
pub use router::{FileRouter, RouterConfig, WriteReport};
