//! Boot-time state reconstruction: latest snapshot plus WAL tail.

use std::path::Path;

use crate::storage::engine::StorageEngine;
use crate::storage::snapshot;
use crate::storage::types::Version;
use crate::storage::wal::{OpType, Wal};

/// What recovery found, for boot logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub snapshot_seq: u64,
    pub snapshot_entries: usize,
    pub wal_records: usize,
    pub wal_replayed: usize,
}

/// Rebuild engine state from disk.
///
/// 1. Load the latest snapshot (if any) and replay its entries with their
///    stored versions — LWW makes this idempotent.
/// 2. Scan the WAL and apply every record with `seq_no` past the snapshot,
///    versioned as `(record timestamp, this node's id)`.
pub fn bootstrap(
    engine: &StorageEngine,
    wal: &Wal,
    snapshot_dir: &Path,
    node_id: u32,
) -> std::io::Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    if let Some(data) = snapshot::find_latest(snapshot_dir).and_then(|path| {
        tracing::info!("loading snapshot {}", path.display());
        snapshot::load(&path)
    }) {
        stats.snapshot_seq = data.seq_no;
        stats.snapshot_entries = data.entries.len();
        for (key, entry) in data.entries {
            if entry.is_tombstone {
                engine.del(key, entry.version);
            } else {
                engine.set(key, entry.value, entry.version);
            }
        }
    }

    let records = wal.recover()?;
    stats.wal_records = records.len();
    for record in records {
        if record.seq_no <= stats.snapshot_seq {
            continue; // already covered by the snapshot
        }
        let version = Version::new(record.timestamp_ms, node_id);
        match record.op {
            OpType::Set => engine.set(record.key, record.value, version),
            OpType::Del => engine.del(record.key, version),
        };
        stats.wal_replayed += 1;
    }

    tracing::info!(
        snapshot_seq = stats.snapshot_seq,
        snapshot_entries = stats.snapshot_entries,
        wal_records = stats.wal_records,
        wal_replayed = stats.wal_replayed,
        "storage recovery complete"
    );

    Ok(stats)
}
