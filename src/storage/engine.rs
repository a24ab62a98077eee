//! Sharded in-memory key-value engine with last-writer-wins versioning.
//!
//! Keys are distributed over a fixed number of shards by MurmurHash3 so that
//! unrelated keys never contend for the same lock. Each shard is guarded by
//! its own read-write lock; there is no global lock, and snapshot iteration
//! copies one shard at a time.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::hash::hash64;
use crate::storage::types::{ValueEntry, Version};

/// Fixed shard count. Changing this would reshuffle key→shard assignment,
/// which is only safe because shard choice is a process-local concern.
pub const NUM_SHARDS: usize = 32;

type Shard = RwLock<HashMap<Bytes, ValueEntry>>;

pub struct StorageEngine {
    shards: Vec<Shard>,
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[(hash64(key) % NUM_SHARDS as u64) as usize]
    }

    /// Look up a key. Returns `None` for absent or tombstoned entries.
    pub fn get(&self, key: &[u8]) -> Option<(Bytes, Version)> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(entry) if !entry.is_tombstone => Some((entry.value.clone(), entry.version)),
            _ => None,
        }
    }

    /// Store `value` under `key` if `version` is strictly newer than the
    /// current entry (or the key is absent). Overwrites the whole entry,
    /// including clearing any tombstone. Returns whether the write applied.
    pub fn set(&self, key: Bytes, value: Bytes, version: Version) -> bool {
        let mut shard = self.shard(&key).write();
        if let Some(existing) = shard.get(&key[..]) {
            if !version.is_newer_than(&existing.version) {
                return false;
            }
        }
        shard.insert(key, ValueEntry::live(value, version));
        true
    }

    /// Replace the entry with a tombstone if `version` is strictly newer.
    /// The map entry is never erased; the tombstone keeps the delete's
    /// version visible to later conflict resolution.
    pub fn del(&self, key: Bytes, version: Version) -> bool {
        let mut shard = self.shard(&key).write();
        if let Some(existing) = shard.get(&key[..]) {
            if !version.is_newer_than(&existing.version) {
                return false;
            }
        }
        shard.insert(key, ValueEntry::tombstone(version));
        true
    }

    /// Copy out every entry, tombstones included. Shards are read-locked one
    /// at a time, so this never holds more than a single lock; ordering
    /// between shards is unspecified.
    pub fn all_entries(&self) -> Vec<(Bytes, ValueEntry)> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            result.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        result
    }

    /// Number of entries currently held, tombstones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
