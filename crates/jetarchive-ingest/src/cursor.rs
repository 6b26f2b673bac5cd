//! Resume cursor.
//!
//! The cursor is the event time (µs) of the last classified event. The
//! processing task advances it after every event; the connection task reads
//! it once per (re)connect to request playback from that point. Both sides
//! share one [`Cursor`] cell, so updates use atomics rather than a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

const UNSET: i64 = i64::MIN;

/// Shared, monotonically advancing resume cursor.
#[derive(Debug, Clone)]
pub struct Cursor {
    value: Arc<AtomicI64>,
}

impl Cursor {
    /// Create a cursor, optionally seeded with a caller-supplied position.
    ///
    /// `None` means "start from now": no cursor is sent on the first connect.
    pub fn new(initial: Option<i64>) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(initial.unwrap_or(UNSET))),
        }
    }

    /// Current position, if one has been set.
    pub fn get(&self) -> Option<i64> {
        match self.value.load(Ordering::Acquire) {
            UNSET => None,
            v => Some(v),
        }
    }

    /// Advance to `time_us`. Never moves backwards.
    ///
    /// Event times are only ordered per account, so an older event from
    /// another account leaves the cursor where it is. Returns the position
    /// after the update.
    pub fn advance(&self, time_us: i64) -> i64 {
        let previous = self.value.fetch_max(time_us, Ordering::AcqRel);
        previous.max(time_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_cursor() {
        let cursor = Cursor::new(None);
        assert_eq!(cursor.get(), None);
    }

    #[test]
    fn test_seeded_cursor() {
        let cursor = Cursor::new(Some(100_000_050));
        assert_eq!(cursor.get(), Some(100_000_050));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let cursor = Cursor::new(None);
        assert_eq!(cursor.advance(100), 100);
        assert_eq!(cursor.advance(300), 300);
        assert_eq!(cursor.advance(200), 300);
        assert_eq!(cursor.get(), Some(300));
    }

    #[test]
    fn test_advance_below_seed_keeps_seed() {
        let cursor = Cursor::new(Some(1_000));
        cursor.advance(999);
        assert_eq!(cursor.get(), Some(1_000));
    }

    #[test]
    fn test_clones_share_state() {
        let writer = Cursor::new(None);
        let reader = writer.clone();
        writer.advance(42);
        assert_eq!(reader.get(), Some(42));
    }

    #[test]
    fn test_concurrent_advances_keep_maximum() {
        let cursor = Cursor::new(None);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cursor = cursor.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        cursor.advance(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cursor.get(), Some(3_999));
    }
}
