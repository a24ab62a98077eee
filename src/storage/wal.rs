//! Append-only write-ahead log with CRC32 integrity checks.
//!
//! Record binary format (all integers little-endian):
//!
//! ```text
//! [crc32 4B] [seq_no 8B] [timestamp_ms 8B] [op 1B]
//! [klen 4B] [key ...] [vlen 4B] [value ...]
//! ```
//!
//! The CRC32 covers everything after the checksum field. Recovery scans the
//! file record by record and halts at the first truncated or corrupt record,
//! treating the tail as a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

pub const WAL_FILE_NAME: &str = "wal.bin";

/// Fixed bytes per record before the variable key/value: crc + seq + ts +
/// op + klen + vlen.
const MIN_RECORD_SIZE: usize = 4 + 8 + 8 + 1 + 4 + 4;

/// Operation types recorded in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Set = 0,
    Del = 1,
}

impl OpType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OpType::Set),
            1 => Some(OpType::Del),
            _ => None,
        }
    }
}

/// A single WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq_no: u64,
    pub timestamp_ms: u64,
    pub op: OpType,
    pub key: Bytes,
    /// Empty for DEL records.
    pub value: Bytes,
}

pub struct Wal {
    path: PathBuf,
    file: File,
    /// Serializes appends and owns the next sequence number; holding the
    /// lock across the write syscall keeps records from interleaving.
    append_state: Mutex<u64>,
    dirty: AtomicBool,
    ops_since_sync: AtomicU32,
    fsync_interval_ms: u64,
    fsync_batch_ops: u32,
    /// `true` once `close` ran; the flusher thread watches it through the
    /// condvar so shutdown does not wait out a full interval.
    flush_stopped: Mutex<bool>,
    flush_cv: Condvar,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Open (or create) `directory/wal.bin` for appending.
    ///
    /// A non-zero `fsync_interval_ms` starts the background fsync thread;
    /// `fsync_batch_ops` of zero disables count-based inline fsyncs.
    pub fn open(
        directory: &Path,
        fsync_interval_ms: u64,
        fsync_batch_ops: u32,
    ) -> std::io::Result<Arc<Wal>> {
        fs::create_dir_all(directory)?;
        let path = directory.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let wal = Arc::new(Wal {
            path,
            file,
            append_state: Mutex::new(1),
            dirty: AtomicBool::new(false),
            ops_since_sync: AtomicU32::new(0),
            fsync_interval_ms,
            fsync_batch_ops,
            flush_stopped: Mutex::new(false),
            flush_cv: Condvar::new(),
            flusher: Mutex::new(None),
        });

        if fsync_interval_ms > 0 {
            let handle = thread::Builder::new().name("wal-fsync".into()).spawn({
                let wal = Arc::clone(&wal);
                move || wal.flush_loop()
            })?;
            *wal.flusher.lock() = Some(handle);
        }

        Ok(wal)
    }

    /// Append one record, assigning the next sequence number. Returns the
    /// assigned `seq_no`.
    pub fn append(
        &self,
        op: OpType,
        key: &[u8],
        value: &[u8],
        timestamp_ms: u64,
    ) -> std::io::Result<u64> {
        let seq_no = {
            let mut next_seq = self.append_state.lock();
            let seq_no = *next_seq;
            *next_seq += 1;

            let buf = encode_record(seq_no, timestamp_ms, op, key, value);
            (&self.file).write_all(&buf)?;
            seq_no
        };

        self.dirty.store(true, Ordering::Release);

        if self.fsync_batch_ops > 0 {
            let ops = self.ops_since_sync.fetch_add(1, Ordering::AcqRel) + 1;
            if ops >= self.fsync_batch_ops {
                self.ops_since_sync.store(0, Ordering::Release);
                self.sync()?;
            }
        }

        Ok(seq_no)
    }

    /// Read every valid record from the start of the file. Stops at the
    /// first record that is short or fails its CRC check, and repositions
    /// `next_seq` after the highest recovered sequence number.
    pub fn recover(&self) -> std::io::Result<Vec<WalRecord>> {
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0;
        let mut max_seq = 0u64;

        while offset < data.len() {
            let Some((record, consumed)) = decode_record(&data[offset..]) else {
                tracing::warn!(
                    offset,
                    "WAL recovery halted (truncated or corrupt record)"
                );
                break;
            };
            max_seq = max_seq.max(record.seq_no);
            records.push(record);
            offset += consumed;
        }

        let mut next_seq = self.append_state.lock();
        if max_seq + 1 > *next_seq {
            *next_seq = max_seq + 1;
        }

        Ok(records)
    }

    /// Force an immediate fsync.
    pub fn sync(&self) -> std::io::Result<()> {
        self.dirty.store(false, Ordering::Release);
        self.file.sync_data()
    }

    /// The last assigned sequence number (0 before any append).
    pub fn current_seq_no(&self) -> u64 {
        *self.append_state.lock() - 1
    }

    /// Stop the background flusher and perform the final fsync.
    pub fn close(&self) -> std::io::Result<()> {
        {
            let mut stopped = self.flush_stopped.lock();
            *stopped = true;
        }
        self.flush_cv.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.file.sync_data()
    }

    /// Background fsync thread. Wakes every `fsync_interval_ms` (or on the
    /// shutdown condvar) and flushes if any append happened since the last
    /// sync.
    fn flush_loop(&self) {
        let interval = Duration::from_millis(self.fsync_interval_ms);
        let mut stopped = self.flush_stopped.lock();
        while !*stopped {
            let _ = self.flush_cv.wait_for(&mut stopped, interval);
            if *stopped {
                break;
            }
            if self.dirty.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.file.sync_data() {
                    tracing::error!("WAL background fsync failed: {e}");
                }
            }
        }
    }
}

// ── Record codec ────────────────────────────────────────────────────────────

fn encode_record(
    seq_no: u64,
    timestamp_ms: u64,
    op: OpType,
    key: &[u8],
    value: &[u8],
) -> BytesMut {
    let payload_len = MIN_RECORD_SIZE - 4 + key.len() + value.len();
    let mut buf = BytesMut::with_capacity(4 + payload_len);

    buf.put_u32_le(0); // checksum placeholder
    buf.put_u64_le(seq_no);
    buf.put_u64_le(timestamp_ms);
    buf.put_u8(op as u8);
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);

    let checksum = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Decode one record from the front of `data`. Returns `None` if the buffer
/// is too short for a whole record or the CRC does not match.
fn decode_record(data: &[u8]) -> Option<(WalRecord, usize)> {
    if data.len() < MIN_RECORD_SIZE {
        return None;
    }

    let stored_crc = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let payload = &data[4..];

    let seq_no = u64::from_le_bytes(payload[0..8].try_into().ok()?);
    let timestamp_ms = u64::from_le_bytes(payload[8..16].try_into().ok()?);
    let op_byte = payload[16];
    let key_len = u32::from_le_bytes(payload[17..21].try_into().ok()?) as usize;

    // Room for the key plus the value-length field?
    if 21 + key_len + 4 > payload.len() {
        return None;
    }
    let val_len =
        u32::from_le_bytes(payload[21 + key_len..25 + key_len].try_into().ok()?) as usize;

    let payload_total = 25 + key_len + val_len;
    if payload_total > payload.len() {
        return None;
    }

    if crc32fast::hash(&payload[..payload_total]) != stored_crc {
        return None;
    }

    let op = OpType::from_byte(op_byte)?;
    let key = Bytes::copy_from_slice(&payload[21..21 + key_len]);
    let value = Bytes::copy_from_slice(&payload[25 + key_len..payload_total]);

    Some((
        WalRecord {
            seq_no,
            timestamp_ms,
            op,
            key,
            value,
        },
        4 + payload_total,
    ))
}
