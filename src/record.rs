//! Record type and last-write-wins ordering.
//!
//! A record binds a user key to either a value or a tombstone, stamped with
//! the coordinator-assigned wall-clock timestamp in milliseconds. Conflict
//! resolution is by highest timestamp; at equal timestamps a tombstone beats
//! a value so deletes dominate concurrent writes.

use std::cmp::Ordering;

use bytes::Bytes;

/// A key/value pair or a deletion marker at a point in time.
///
/// The value may be empty but present; `None` marks a tombstone. Keys and
/// values are immutable byte slices that readers must never mutate, which
/// `Bytes` enforces by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: Bytes,
    value: Option<Bytes>,
    timestamp_ms: u64,
}

impl Record {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, timestamp_ms: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp_ms,
        }
    }

    pub fn tombstone(key: impl Into<Bytes>, timestamp_ms: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp_ms,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate in-memory footprint, used for flush accounting.
    pub fn approximate_bytes(&self) -> u64 {
        const ENTRY_OVERHEAD: u64 = 24;
        self.key.len() as u64
            + self.value.as_ref().map(|v| v.len() as u64).unwrap_or(0)
            + ENTRY_OVERHEAD
    }

    /// Last-write-wins precedence against another record for the same key.
    pub fn wins_over(&self, other: &Record) -> bool {
        match self.timestamp_ms.cmp(&other.timestamp_ms) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.is_tombstone() && !other.is_tombstone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_timestamp_wins() {
        let old = Record::put(&b"k"[..], &b"v1"[..], 10);
        let new = Record::put(&b"k"[..], &b"v2"[..], 11);
        assert!(new.wins_over(&old));
        assert!(!old.wins_over(&new));
    }

    #[test]
    fn tombstone_beats_value_on_tie() {
        let put = Record::put(&b"k"[..], &b"v"[..], 10);
        let del = Record::tombstone(&b"k"[..], 10);
        assert!(del.wins_over(&put));
        assert!(!put.wins_over(&del));
    }

    #[test]
    fn tombstone_loses_to_newer_value() {
        let del = Record::tombstone(&b"k"[..], 10);
        let put = Record::put(&b"k"[..], &b"v"[..], 11);
        assert!(put.wins_over(&del));
    }

    #[test]
    fn empty_value_is_not_a_tombstone() {
        let rec = Record::put(&b"k"[..], Bytes::new(), 1);
        assert!(!rec.is_tombstone());
        assert_eq!(rec.value().map(|v| v.len()), Some(0));
    }
}
