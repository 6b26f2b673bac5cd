//! Record classification.
//!
//! Every decoded event is assigned to exactly one outcome for the run's
//! [`ArchiveMode`]: kept (with the payload to archive) or dropped. The
//! posts-only and non-posts modes partition the stream: an event is kept by
//! exactly one of them, and all-records keeps everything.

use crate::event::{Event, Operation};
use crate::shard::ShardKey;
use crate::POST_COLLECTION;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Archiving mode, fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArchiveMode {
    /// Only post creations, reshaped into [`PostRecord`]s.
    #[default]
    PostsOnly,
    /// Every event, verbatim.
    AllRecords,
    /// Every event a posts-only run would drop, verbatim.
    NonPosts,
}

impl ArchiveMode {
    /// Directory (under the output root) this mode writes into.
    pub fn directory(self) -> &'static str {
        match self {
            Self::PostsOnly => "data",
            Self::AllRecords => "data_everything",
            Self::NonPosts => "data_non_posts",
        }
    }

    /// Shard file name prefix.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::PostsOnly => "posts",
            Self::AllRecords | Self::NonPosts => "records",
        }
    }

    /// Human unit for log lines ("posts" or "records").
    pub fn unit(self) -> &'static str {
        self.file_prefix()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostsOnly => "posts-only",
            Self::AllRecords => "all-records",
            Self::NonPosts => "non-posts",
        }
    }
}

impl fmt::Display for ArchiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posts-only" | "posts" => Ok(Self::PostsOnly),
            "all-records" | "all" => Ok(Self::AllRecords),
            "non-posts" => Ok(Self::NonPosts),
            other => Err(format!(
                "unknown archive mode '{other}': expected posts-only, all-records or non-posts"
            )),
        }
    }
}

/// Flat record written in posts-only mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostRecord {
    /// Resolved handle; `null` unless handle resolution is enabled.
    pub handle: Option<String>,
    /// The post body exactly as committed.
    pub record: Value,
    pub rkey: String,
    pub did: String,
    pub time_us: i64,
}

/// What gets written for a kept event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Post(PostRecord),
    Envelope(Value),
}

/// A kept event, ready for buffering and publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub did: String,
    pub time_us: i64,
    pub shard: ShardKey,
    pub payload: Payload,
}

impl ArchiveRecord {
    /// Serialize the payload as one JSONL line (newline included).
    pub fn write_line(&self, out: &mut Vec<u8>) -> serde_json::Result<()> {
        serde_json::to_writer(&mut *out, &self.payload)?;
        out.push(b'\n');
        Ok(())
    }

    /// The record body, for either payload shape.
    pub fn record(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Post(post) => Some(&post.record),
            Payload::Envelope(envelope) => envelope.get("commit").and_then(|c| c.get("record")),
        }
    }

    /// The record's `text` field, if it has one.
    pub fn text(&self) -> Option<&str> {
        self.record()?.get("text")?.as_str()
    }

    /// Fill in the resolved handle. No-op for verbatim envelopes.
    pub fn set_handle(&mut self, handle: String) {
        if let Payload::Post(post) = &mut self.payload {
            post.handle = Some(handle);
        }
    }
}

/// Why an event was not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The mode's predicate excludes this event.
    Filtered,
    /// The event matched but lacks a field the mode needs.
    Malformed(&'static str),
}

impl DropReason {
    /// Label used for metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Filtered => "filtered",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Keep(ArchiveRecord),
    Drop(DropReason),
}

impl Classification {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep(_))
    }
}

/// Classify `event` for `mode`. Pure: no cursor, buffer or I/O involvement.
pub fn classify(event: &Event, mode: ArchiveMode) -> Classification {
    match mode {
        ArchiveMode::PostsOnly => classify_post(event),
        ArchiveMode::AllRecords => Classification::Keep(verbatim(event)),
        ArchiveMode::NonPosts => match classify_post(event) {
            Classification::Keep(_) => Classification::Drop(DropReason::Filtered),
            Classification::Drop(_) => Classification::Keep(verbatim(event)),
        },
    }
}

fn classify_post(event: &Event) -> Classification {
    if !event.is_commit_in(POST_COLLECTION) {
        return Classification::Drop(DropReason::Filtered);
    }
    match event.commit.as_ref().and_then(|c| c.operation) {
        Some(Operation::Create) => {}
        Some(_) => return Classification::Drop(DropReason::Filtered),
        None => return Classification::Drop(DropReason::Malformed("commit.operation")),
    }

    let Some(record) = event.record() else {
        return Classification::Drop(DropReason::Malformed("commit.record"));
    };
    let Some(rkey) = event.commit.as_ref().and_then(|c| c.rkey.clone()) else {
        return Classification::Drop(DropReason::Malformed("commit.rkey"));
    };

    Classification::Keep(ArchiveRecord {
        did: event.did.clone(),
        time_us: event.time_us,
        shard: event.shard(),
        payload: Payload::Post(PostRecord {
            handle: None,
            record: record.clone(),
            rkey,
            did: event.did.clone(),
            time_us: event.time_us,
        }),
    })
}

fn verbatim(event: &Event) -> ArchiveRecord {
    ArchiveRecord {
        did: event.did.clone(),
        time_us: event.time_us,
        shard: event.shard(),
        payload: Payload::Envelope(event.envelope().clone()),
    }
}
