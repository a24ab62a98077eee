//! Durable Storage Module
//!
//! Implements the node-local state layer: a sharded in-memory map with
//! last-writer-wins conflict resolution, an append-only write-ahead log,
//! and periodic full-state snapshots.
//!
//! ## Core Concepts
//! - **Versioning**: every entry carries a `(timestamp_ms, node_id)` version;
//!   an incoming write is applied only if its version is strictly newer.
//! - **Tombstones**: deletes replace the entry with a versioned tombstone
//!   instead of erasing it, so a stale write can never resurrect deleted data.
//! - **Durability**: mutations are appended to `wal.bin` before being
//!   acknowledged; snapshots bound the amount of log replayed at boot.
//! - **Recovery**: boot state = latest snapshot + every WAL record past the
//!   snapshot's sequence number.

pub mod engine;
pub mod recovery;
pub mod snapshot;
pub mod types;
pub mod wal;

pub use engine::StorageEngine;
pub use types::{ValueEntry, Version};

#[cfg(test)]
mod tests;
