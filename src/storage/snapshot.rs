//! Full-state snapshots.
//!
//! File layout: `[magic "DKVS" 4B] [seq_no 8B LE] [count 4B LE]` followed by
//! one entry per record:
//! `[tombstone 1B] [klen 4B LE] [key] [vlen 4B LE] [value] [ts_ms 8B LE]
//! [node_id 4B LE]`.
//!
//! Files are named `snapshot_<seq_no>.dat`, where `seq_no` is the WAL
//! sequence number the snapshot covers; only the latest snapshot is needed
//! for recovery.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::storage::engine::StorageEngine;
use crate::storage::types::{ValueEntry, Version};

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"DKVS";

/// Parsed contents of one snapshot file. Entries include tombstones.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub seq_no: u64,
    pub entries: Vec<(Bytes, ValueEntry)>,
}

/// Serialize the engine's full state into `directory/snapshot_<seq_no>.dat`.
pub fn save(engine: &StorageEngine, seq_no: u64, directory: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(directory)?;
    let path = directory.join(format!("snapshot_{seq_no}.dat"));

    let entries = engine.all_entries();

    let mut out = BufWriter::new(File::create(&path)?);
    let mut header = BytesMut::with_capacity(16);
    header.put_slice(SNAPSHOT_MAGIC);
    header.put_u64_le(seq_no);
    header.put_u32_le(entries.len() as u32);
    out.write_all(&header)?;

    for (key, entry) in &entries {
        let mut buf =
            BytesMut::with_capacity(1 + 4 + key.len() + 4 + entry.value.len() + 12);
        buf.put_u8(u8::from(entry.is_tombstone));
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(entry.value.len() as u32);
        buf.put_slice(&entry.value);
        buf.put_u64_le(entry.version.timestamp_ms);
        buf.put_u32_le(entry.version.node_id);
        out.write_all(&buf)?;
    }

    out.flush()?;
    Ok(path)
}

/// Read and validate a snapshot file. Any I/O failure, bad magic, or
/// truncated entry yields `None` ("no snapshot").
pub fn load(path: &Path) -> Option<SnapshotData> {
    let mut raw = Vec::new();
    match File::open(path).and_then(|mut f| f.read_to_end(&mut raw)) {
        Ok(_) => {}
        Err(e) => {
            tracing::warn!("cannot read snapshot {}: {e}", path.display());
            return None;
        }
    }

    let mut buf = Bytes::from(raw);
    if buf.remaining() < 16 || &buf[..4] != SNAPSHOT_MAGIC {
        tracing::warn!("invalid snapshot header in {}", path.display());
        return None;
    }
    buf.advance(4);
    let seq_no = buf.get_u64_le();
    let count = buf.get_u32_le() as usize;

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let Some(entry) = read_entry(&mut buf) else {
            tracing::warn!(
                "truncated snapshot entry {index} in {}",
                path.display()
            );
            return None;
        };
        entries.push(entry);
    }

    Some(SnapshotData { seq_no, entries })
}

fn read_entry(buf: &mut Bytes) -> Option<(Bytes, ValueEntry)> {
    if buf.remaining() < 1 + 4 {
        return None;
    }
    let is_tombstone = buf.get_u8() != 0;

    let key_len = buf.get_u32_le() as usize;
    if buf.remaining() < key_len + 4 {
        return None;
    }
    let key = buf.split_to(key_len);

    let val_len = buf.get_u32_le() as usize;
    if buf.remaining() < val_len + 12 {
        return None;
    }
    let value = buf.split_to(val_len);

    let version = Version::new(buf.get_u64_le(), buf.get_u32_le());
    Some((
        key,
        ValueEntry {
            is_tombstone,
            value,
            version,
        },
    ))
}

/// Scan `directory` for `snapshot_<digits>.dat` files and return the path
/// with the highest sequence number.
pub fn find_latest(directory: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(directory).ok()?;

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(seq) = name
            .to_str()
            .and_then(|n| n.strip_prefix("snapshot_"))
            .and_then(|n| n.strip_suffix(".dat"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(max, _)| seq > *max) {
            best = Some((seq, entry.path()));
        }
    }

    best.map(|(_, path)| path)
}
