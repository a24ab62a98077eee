use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Logical version of a stored entry: wall-clock milliseconds plus the
/// writing node's id as a tiebreaker.
///
/// The derived ordering compares `timestamp_ms` first and breaks ties with
/// `node_id`, which is exactly the last-writer-wins total order: version A
/// supersedes version B iff `A > B`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub timestamp_ms: u64,
    pub node_id: u32,
}

impl Version {
    pub fn new(timestamp_ms: u64, node_id: u32) -> Self {
        Self {
            timestamp_ms,
            node_id,
        }
    }

    /// True if `self` strictly supersedes `other` under LWW.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

/// A stored value together with its version and tombstone flag.
///
/// Tombstones carry an empty value and are never pruned: keeping the delete's
/// version around is what prevents read repair or hint replay from
/// resurrecting data that a later DEL removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub is_tombstone: bool,
    pub value: Bytes,
    pub version: Version,
}

impl ValueEntry {
    pub fn live(value: Bytes, version: Version) -> Self {
        Self {
            is_tombstone: false,
            value,
            version,
        }
    }

    pub fn tombstone(version: Version) -> Self {
        Self {
            is_tombstone: true,
            value: Bytes::new(),
            version,
        }
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
