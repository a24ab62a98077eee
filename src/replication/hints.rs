//! Durable queue of undelivered replica writes, grouped by target node.
//!
//! On-disk format, one `hints_<target_id>.dat` file per target, records
//! appended back to back (integers little-endian):
//!
//! ```text
//! [target_node_id 4B] [addr_len 4B] [addr] [klen 4B] [key]
//! [vlen 4B] [value] [ts_ms 8B] [origin_node_id 4B] [is_del 1B]
//! ```
//!
//! Disk persistence is best-effort: a failed append is logged and never
//! fails the write that produced the hint.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use crate::storage::types::Version;

/// A replica write that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub target_node_id: u32,
    pub target_address: String,
    pub key: Bytes,
    pub value: Bytes,
    pub is_del: bool,
    pub version: Version,
}

pub struct HintStore {
    hints: DashMap<u32, Vec<Hint>>,
    directory: Option<PathBuf>,
}

impl HintStore {
    /// `directory = None` keeps hints in memory only.
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            hints: DashMap::new(),
            directory,
        }
    }

    /// Queue a hint. The in-memory push happens under the map entry's lock;
    /// the disk append runs after it is released.
    pub fn store(&self, hint: Hint) {
        self.hints
            .entry(hint.target_node_id)
            .or_default()
            .push(hint.clone());

        if let Some(directory) = &self.directory {
            if let Err(err) = append_to_disk(directory, &hint) {
                tracing::warn!(
                    target = hint.target_node_id,
                    "failed to persist hint: {err}"
                );
            }
        }
    }

    /// Copy of the pending hints for one target.
    pub fn hints_for(&self, target_node_id: u32) -> Vec<Hint> {
        self.hints
            .get(&target_node_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Drop all hints for a target, in memory and (best-effort) on disk.
    pub fn clear_hints_for(&self, target_node_id: u32) {
        self.hints.remove(&target_node_id);
        if let Some(directory) = &self.directory {
            let _ = fs::remove_file(hint_file_path(directory, target_node_id));
        }
    }

    /// Total pending hints across all targets.
    pub fn total(&self) -> usize {
        self.hints.iter().map(|entry| entry.value().len()).sum()
    }

    /// Replay every `hints_*.dat` file in the directory into memory. Safe to
    /// call at startup before any concurrent use.
    pub fn load(&self) {
        let Some(directory) = &self.directory else {
            return;
        };
        let Ok(entries) = fs::read_dir(directory) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("hints_") || !name.ends_with(".dat") {
                continue;
            }

            let loaded = load_file(&entry.path());
            if !loaded.is_empty() {
                tracing::info!("loaded {} hints from {name}", loaded.len());
            }
            for hint in loaded {
                self.hints
                    .entry(hint.target_node_id)
                    .or_default()
                    .push(hint);
            }
        }
    }
}

// ── Disk format ─────────────────────────────────────────────────────────────

fn hint_file_path(directory: &Path, target_node_id: u32) -> PathBuf {
    directory.join(format!("hints_{target_node_id}.dat"))
}

fn append_to_disk(directory: &Path, hint: &Hint) -> std::io::Result<()> {
    fs::create_dir_all(directory)?;

    let mut buf = BytesMut::with_capacity(
        4 + 4 + hint.target_address.len() + 4 + hint.key.len() + 4 + hint.value.len() + 13,
    );
    buf.put_u32_le(hint.target_node_id);
    buf.put_u32_le(hint.target_address.len() as u32);
    buf.put_slice(hint.target_address.as_bytes());
    buf.put_u32_le(hint.key.len() as u32);
    buf.put_slice(&hint.key);
    buf.put_u32_le(hint.value.len() as u32);
    buf.put_slice(&hint.value);
    buf.put_u64_le(hint.version.timestamp_ms);
    buf.put_u32_le(hint.version.node_id);
    buf.put_u8(u8::from(hint.is_del));

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(hint_file_path(directory, hint.target_node_id))?;
    file.write_all(&buf)
}

fn load_file(path: &Path) -> Vec<Hint> {
    let Ok(raw) = fs::read(path) else {
        return Vec::new();
    };

    let mut buf = Bytes::from(raw);
    let mut hints = Vec::new();
    while let Some(hint) = read_hint(&mut buf) {
        hints.push(hint);
    }
    if buf.has_remaining() {
        tracing::warn!(
            "ignoring {} trailing bytes in {}",
            buf.remaining(),
            path.display()
        );
    }
    hints
}

fn read_hint(buf: &mut Bytes) -> Option<Hint> {
    if buf.remaining() < 8 {
        return None;
    }
    let target_node_id = buf.get_u32_le();

    let addr_len = buf.get_u32_le() as usize;
    if buf.remaining() < addr_len + 4 {
        return None;
    }
    let target_address = String::from_utf8(buf.split_to(addr_len).to_vec()).ok()?;

    let key_len = buf.get_u32_le() as usize;
    if buf.remaining() < key_len + 4 {
        return None;
    }
    let key = buf.split_to(key_len);

    let val_len = buf.get_u32_le() as usize;
    if buf.remaining() < val_len + 13 {
        return None;
    }
    let value = buf.split_to(val_len);

    let version = Version::new(buf.get_u64_le(), buf.get_u32_le());
    let is_del = buf.get_u8() != 0;

    Some(Hint {
        target_node_id,
        target_address,
        key,
        value,
        is_del,
        version,
    })
}
