//! Jetstream event decoding.
//!
//! Each firehose frame is a UTF-8 JSON object:
//!
//! ```text
//! {"did":"did:plc:…","time_us":1725911162329308,"kind":"commit",
//!  "commit":{"rev":"…","operation":"create","collection":"app.bsky.feed.post",
//!            "rkey":"3l3qo2vutsw2b","record":{…},"cid":"…"}}
//! ```
//!
//! [`Event`] exposes the typed header fields used for routing and
//! classification while keeping the decoded envelope untouched, so the
//! all-records and non-posts modes can write it back out verbatim.

use crate::error::{Error, Result};
use crate::shard::ShardKey;
use serde::Deserialize;
use serde_json::Value;

/// Top-level event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A create/update/delete of one record in an account's repository.
    Commit,
    /// An identity (handle / DID document) change.
    Identity,
    /// An account status change (activation, takedown, …).
    Account,
    /// Any kind this archiver does not know about.
    Other(String),
}

impl From<String> for EventKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "commit" => Self::Commit,
            "identity" => Self::Identity,
            "account" => Self::Account,
            _ => Self::Other(kind),
        }
    }
}

impl EventKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Commit => "commit",
            Self::Identity => "identity",
            Self::Account => "account",
            Self::Other(kind) => kind,
        }
    }
}

/// Commit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// Commit header (everything except the record body, which stays in the envelope).
///
/// Every field is optional: only `did` and `time_us` are needed to place an
/// event, and the verbatim modes keep events whose commit is incomplete.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Commit {
    /// Repository revision.
    #[serde(default)]
    pub rev: Option<String>,

    /// Create, update or delete.
    #[serde(default)]
    pub operation: Option<Operation>,

    /// Namespaced record type, e.g. `app.bsky.feed.post`.
    #[serde(default)]
    pub collection: Option<String>,

    /// Record key within the collection.
    #[serde(default)]
    pub rkey: Option<String>,
}

#[derive(Deserialize)]
struct Header {
    did: String,
    time_us: i64,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    commit: Option<Value>,
}

/// A decoded firehose event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Account DID.
    pub did: String,

    /// Event time in microseconds since the Unix epoch.
    pub time_us: i64,

    /// Event kind.
    pub kind: EventKind,

    /// Commit header, present for `kind == commit`.
    pub commit: Option<Commit>,

    shard: ShardKey,
    envelope: Value,
}

impl Event {
    /// Decode an event from a JSON frame.
    pub fn from_json(frame: &str) -> Result<Self> {
        let envelope: Value = serde_json::from_str(frame)?;
        Self::from_value(envelope)
    }

    /// Decode an event from an already-parsed envelope.
    pub fn from_value(envelope: Value) -> Result<Self> {
        if !envelope.is_object() {
            return Err(Error::InvalidField {
                field: "envelope",
                reason: "expected a JSON object".to_string(),
            });
        }
        if envelope.get("did").is_none() {
            return Err(Error::MissingField("did"));
        }
        if envelope.get("time_us").is_none() {
            return Err(Error::MissingField("time_us"));
        }

        let header = Header::deserialize(&envelope)?;
        let shard = ShardKey::from_time_us(header.time_us)?;
        let kind = header
            .kind
            .map(EventKind::from)
            .unwrap_or_else(|| EventKind::Other(String::new()));
        // A commit header of the wrong shape is treated as absent.
        let commit = header
            .commit
            .filter(Value::is_object)
            .map(|c| Commit::deserialize(c).unwrap_or_default());

        Ok(Self {
            did: header.did,
            time_us: header.time_us,
            kind,
            commit,
            shard,
            envelope,
        })
    }

    /// The hourly shard this event belongs to.
    pub fn shard(&self) -> ShardKey {
        self.shard
    }

    /// The verbatim event envelope as received.
    pub fn envelope(&self) -> &Value {
        &self.envelope
    }

    /// Consume the event, returning the verbatim envelope.
    pub fn into_envelope(self) -> Value {
        self.envelope
    }

    /// The commit's record body, if any.
    pub fn record(&self) -> Option<&Value> {
        self.envelope.get("commit").and_then(|c| c.get("record"))
    }

    /// True if this is a commit touching `collection`, whatever the operation.
    pub fn is_commit_in(&self, collection: &str) -> bool {
        self.kind == EventKind::Commit
            && self
                .commit
                .as_ref()
                .is_some_and(|c| c.collection.as_deref() == Some(collection))
    }

    /// True if this is a commit creating a record in `collection`.
    pub fn is_create_in(&self, collection: &str) -> bool {
        self.is_commit_in(collection)
            && self
                .commit
                .as_ref()
                .is_some_and(|c| c.operation == Some(Operation::Create))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST: &str = r#"{"did":"did:plc:abc","time_us":1725911162329308,"kind":"commit","commit":{"rev":"3l3qo2vuowo2b","operation":"create","collection":"app.bsky.feed.post","rkey":"3l3qo2vutsw2b","record":{"$type":"app.bsky.feed.post","text":"hello","createdAt":"2024-09-09T19:46:02.102Z"},"cid":"bafyrei"}}"#;

    #[test]
    fn test_decode_commit() {
        let event = Event::from_json(POST).unwrap();
        assert_eq!(event.did, "did:plc:abc");
        assert_eq!(event.time_us, 1725911162329308);
        assert_eq!(event.kind, EventKind::Commit);

        let commit = event.commit.as_ref().unwrap();
        assert_eq!(commit.operation, Some(Operation::Create));
        assert_eq!(commit.collection.as_deref(), Some("app.bsky.feed.post"));
        assert_eq!(commit.rkey.as_deref(), Some("3l3qo2vutsw2b"));
        assert_eq!(commit.rev.as_deref(), Some("3l3qo2vuowo2b"));
        assert_eq!(event.record().unwrap()["text"], "hello");
    }

    #[test]
    fn test_envelope_is_verbatim() {
        let event = Event::from_json(POST).unwrap();
        let original: Value = serde_json::from_str(POST).unwrap();
        assert_eq!(event.envelope(), &original);
        // Field order survives the round trip.
        assert_eq!(serde_json::to_string(event.envelope()).unwrap(), POST);
    }

    #[test]
    fn test_decode_identity() {
        let frame = r#"{"did":"did:plc:abc","time_us":5,"kind":"identity","identity":{"did":"did:plc:abc","handle":"alice.bsky.social","seq":1,"time":"2024-09-09T19:46:02.102Z"}}"#;
        let event = Event::from_json(frame).unwrap();
        assert_eq!(event.kind, EventKind::Identity);
        assert!(event.commit.is_none());
        assert!(event.record().is_none());
    }

    #[test]
    fn test_unknown_kind_and_operation() {
        let frame = r#"{"did":"d","time_us":1,"kind":"mystery","commit":{"operation":"upsert","collection":"x"}}"#;
        let event = Event::from_json(frame).unwrap();
        assert_eq!(event.kind, EventKind::Other("mystery".to_string()));
        assert_eq!(event.kind.as_str(), "mystery");
        assert_eq!(event.commit.unwrap().operation, Some(Operation::Unknown));
    }

    #[test]
    fn test_delete_has_no_record() {
        let frame = r#"{"did":"d","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"delete","collection":"app.bsky.feed.like","rkey":"k"}}"#;
        let event = Event::from_json(frame).unwrap();
        assert_eq!(event.commit.as_ref().unwrap().operation, Some(Operation::Delete));
        assert!(event.record().is_none());
        assert!(!event.is_create_in("app.bsky.feed.like"));
    }

    #[test]
    fn test_incomplete_commit_still_decodes() {
        let frame = r#"{"did":"d","time_us":1,"kind":"commit","commit":{"rev":"r","collection":"app.bsky.feed.like","rkey":"k"}}"#;
        let event = Event::from_json(frame).unwrap();
        let commit = event.commit.as_ref().unwrap();
        assert_eq!(commit.operation, None);
        assert_eq!(commit.collection.as_deref(), Some("app.bsky.feed.like"));
        assert!(event.is_commit_in("app.bsky.feed.like"));
        assert!(!event.is_create_in("app.bsky.feed.like"));
    }

    #[test]
    fn test_misshapen_commit_still_decodes() {
        for commit in [r#""oops""#, r#"{"operation":5,"collection":"x"}"#, "null"] {
            let frame = format!(r#"{{"did":"d","time_us":1,"kind":"commit","commit":{commit}}}"#);
            let event = Event::from_json(&frame).unwrap();
            assert!(event.commit.as_ref().is_none_or(|c| c.operation.is_none()));
            assert!(!event.is_create_in("x"));
        }
    }

    #[test]
    fn test_missing_time_us() {
        let err = Event::from_json(r#"{"did":"d","kind":"commit"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("time_us")));
    }

    #[test]
    fn test_missing_did() {
        let err = Event::from_json(r#"{"time_us":1,"kind":"commit"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("did")));
    }

    #[test]
    fn test_non_object_frame() {
        let err = Event::from_json("[1,2,3]").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "envelope", .. }));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(Event::from_json("{\"did\":").unwrap_err(), Error::Json(_)));
    }

    #[test]
    fn test_unplaceable_time() {
        let frame = format!(r#"{{"did":"d","time_us":{},"kind":"commit"}}"#, i64::MAX);
        let err = Event::from_json(&frame).unwrap_err();
        assert!(matches!(err, Error::TimeOutOfRange(_)));
    }

    #[test]
    fn test_shard_follows_time() {
        let event = Event::from_json(POST).unwrap();
        assert_eq!(event.shard().to_string(), "2024-09-09T19");
    }

    #[test]
    fn test_wrong_time_type() {
        let err = Event::from_json(r#"{"did":"d","time_us":"soon","kind":"commit"}"#).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
