//! Core types and shared utilities for the Jetstream archiver.
//!
//! This crate provides:
//! - Event decoding from Jetstream JSON frames, keeping the verbatim envelope
//! - Classification of events into the three archiving modes
//! - The hourly shard layout used on disk
//! - Prometheus metrics helpers
//! - Shared error types

pub mod classify;
mod error;
pub mod event;
pub mod metrics;
pub mod shard;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Collection identifier of a Bluesky post.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Public Jetstream endpoint used when none is configured.
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

pub use classify::{
    ArchiveMode, ArchiveRecord, Classification, DropReason, Payload, PostRecord, classify,
};
pub use error::{Error, Result};
pub use event::{Commit, Event, EventKind, Operation};
pub use shard::{ShardKey, shard_path};
