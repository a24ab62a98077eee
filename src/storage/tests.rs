use bytes::Bytes;
use tempfile::tempdir;

use super::engine::StorageEngine;
use super::recovery;
use super::snapshot;
use super::types::{ValueEntry, Version};
use super::wal::{OpType, Wal};

fn b(data: &'static str) -> Bytes {
    Bytes::from_static(data.as_bytes())
}

// ── Versioning ──────────────────────────────────────────────────────────────

#[test]
fn test_version_ordering() {
    let older = Version::new(100, 2);
    let newer = Version::new(200, 1);
    assert!(newer.is_newer_than(&older));
    assert!(!older.is_newer_than(&newer));

    // Equal timestamps: node id breaks the tie.
    assert!(Version::new(100, 3).is_newer_than(&Version::new(100, 2)));
    // A version never supersedes itself.
    assert!(!older.is_newer_than(&older));
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[test]
fn test_engine_set_and_get() {
    let engine = StorageEngine::new();
    assert!(engine.set(b("foo"), b("bar"), Version::new(100, 1)));

    let (value, version) = engine.get(b"foo").expect("key should exist");
    assert_eq!(value, b("bar"));
    assert_eq!(version, Version::new(100, 1));

    assert!(engine.get(b"missing").is_none());
}

#[test]
fn test_engine_lww_rejects_stale_writes() {
    let engine = StorageEngine::new();
    assert!(engine.set(b("k"), b("v2"), Version::new(200, 1)));
    assert!(!engine.set(b("k"), b("v1"), Version::new(100, 1)));
    // Same version is not strictly newer either.
    assert!(!engine.set(b("k"), b("v3"), Version::new(200, 1)));

    let (value, _) = engine.get(b"k").unwrap();
    assert_eq!(value, b("v2"));
}

#[test]
fn test_engine_tombstone_masks_and_blocks_resurrection() {
    let engine = StorageEngine::new();
    assert!(engine.set(b("foo"), b("bar"), Version::new(100, 1)));
    assert!(engine.del(b("foo"), Version::new(200, 1)));
    assert!(engine.get(b"foo").is_none());

    // A write older than the delete must not bring the value back.
    assert!(!engine.set(b("foo"), b("baz"), Version::new(50, 1)));
    assert!(engine.get(b"foo").is_none());

    // A strictly newer write clears the tombstone.
    assert!(engine.set(b("foo"), b("baz"), Version::new(300, 1)));
    let (value, _) = engine.get(b"foo").unwrap();
    assert_eq!(value, b("baz"));
}

#[test]
fn test_engine_all_entries_includes_tombstones() {
    let engine = StorageEngine::new();
    engine.set(b("live"), b("v"), Version::new(1, 1));
    engine.del(b("dead"), Version::new(2, 1));

    let entries = engine.all_entries();
    assert_eq!(entries.len(), 2);
    let dead = entries
        .iter()
        .find(|(k, _)| k == &b("dead"))
        .map(|(_, e)| e)
        .unwrap();
    assert!(dead.is_tombstone);
    assert!(dead.value.is_empty());
    assert_eq!(engine.len(), 2);
}

#[test]
fn test_engine_version_progression_is_monotonic() {
    let engine = StorageEngine::new();
    let mut applied_version = Version::default();
    // Interleave in-order and stale operations; the stored version must
    // never move backwards.
    for (ts, node, is_del) in [
        (10, 1, false),
        (5, 1, false),
        (20, 2, true),
        (20, 1, false),
        (30, 1, false),
    ] {
        let version = Version::new(ts, node);
        let applied = if is_del {
            engine.del(b("k"), version)
        } else {
            engine.set(b("k"), b("v"), version)
        };
        if applied {
            assert!(version.is_newer_than(&applied_version));
            applied_version = version;
        }
        let stored = engine
            .all_entries()
            .into_iter()
            .find(|(k, _)| k == &b("k"))
            .map(|(_, e)| e.version)
            .unwrap();
        assert_eq!(stored, applied_version);
    }
}

// ── WAL ─────────────────────────────────────────────────────────────────────

#[test]
fn test_wal_append_and_recover() {
    let dir = tempdir().unwrap();

    {
        let wal = Wal::open(dir.path(), 0, 0).unwrap();
        let seq = wal.append(OpType::Set, b"hello", b"world", 1000).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(wal.current_seq_no(), 1);
        wal.close().unwrap();
    }

    let wal = Wal::open(dir.path(), 0, 0).unwrap();
    let records = wal.recover().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq_no, 1);
    assert_eq!(records[0].timestamp_ms, 1000);
    assert_eq!(records[0].op, OpType::Set);
    assert_eq!(records[0].key, b("hello"));
    assert_eq!(records[0].value, b("world"));
}

#[test]
fn test_wal_multiple_records_and_seq_continuation() {
    let dir = tempdir().unwrap();

    {
        let wal = Wal::open(dir.path(), 0, 0).unwrap();
        for i in 0..10u64 {
            let key = format!("key_{i}");
            let (op, value) = if i % 2 == 0 {
                (OpType::Set, format!("val_{i}"))
            } else {
                (OpType::Del, String::new())
            };
            let seq = wal.append(op, key.as_bytes(), value.as_bytes(), i * 100).unwrap();
            assert_eq!(seq, i + 1);
        }
        wal.close().unwrap();
    }

    // Reopen: recovery must see all ten and continue the sequence.
    let wal = Wal::open(dir.path(), 0, 0).unwrap();
    let records = wal.recover().unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(records[9].seq_no, 10);
    assert_eq!(records[3].op, OpType::Del);
    assert!(records[3].value.is_empty());

    let seq = wal.append(OpType::Set, b"after", b"recovery", 1).unwrap();
    assert_eq!(seq, 11);
}

#[test]
fn test_wal_recovery_stops_at_torn_tail() {
    let dir = tempdir().unwrap();

    {
        let wal = Wal::open(dir.path(), 0, 0).unwrap();
        for i in 0..5u64 {
            wal.append(OpType::Set, format!("k{i}").as_bytes(), b"value", i)
                .unwrap();
        }
        wal.sync().unwrap();
        wal.close().unwrap();
    }

    // Chop 5 bytes off the end to simulate a torn write.
    let path = dir.path().join(super::wal::WAL_FILE_NAME);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 5).unwrap();

    let wal = Wal::open(dir.path(), 0, 0).unwrap();
    let records = wal.recover().unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records.last().unwrap().seq_no, 4);

    // Appends continue after the last intact record.
    assert_eq!(wal.append(OpType::Set, b"k", b"v", 9).unwrap(), 5);
}

#[test]
fn test_wal_recovery_stops_at_corrupt_record() {
    let dir = tempdir().unwrap();

    {
        let wal = Wal::open(dir.path(), 0, 0).unwrap();
        for i in 0..3u64 {
            wal.append(OpType::Set, b"key", b"value", i).unwrap();
        }
        wal.close().unwrap();
    }

    // Flip a byte inside the second record's payload.
    let path = dir.path().join(super::wal::WAL_FILE_NAME);
    let mut data = std::fs::read(&path).unwrap();
    let record_len = data.len() / 3;
    data[record_len + 12] ^= 0xFF;
    std::fs::write(&path, &data).unwrap();

    let wal = Wal::open(dir.path(), 0, 0).unwrap();
    let records = wal.recover().unwrap();
    assert_eq!(records.len(), 1, "recovery halts at the first bad CRC");
}

#[test]
fn test_wal_batched_fsync_counter() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path(), 0, 2).unwrap();
    // Batch threshold of 2: the inline fsync path runs on every other
    // append. Correctness here is just "records survive".
    for i in 0..5u64 {
        wal.append(OpType::Set, b"k", b"v", i).unwrap();
    }
    wal.close().unwrap();

    let records = wal.recover().unwrap();
    assert_eq!(records.len(), 5);
}

// ── Snapshot ────────────────────────────────────────────────────────────────

#[test]
fn test_snapshot_round_trip_preserves_entry_set() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::new();
    engine.set(b("key1"), b("v1"), Version::new(100, 1));
    engine.set(b("key2"), b("value with spaces"), Version::new(200, 2));
    engine.del(b("gone"), Version::new(300, 1));

    let path = snapshot::save(&engine, 42, dir.path()).unwrap();
    let data = snapshot::load(&path).expect("snapshot should load");
    assert_eq!(data.seq_no, 42);

    let mut expected: Vec<(Bytes, ValueEntry)> = engine.all_entries();
    let mut actual = data.entries;
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    actual.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(expected, actual);
}

#[test]
fn test_snapshot_rejects_bad_magic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("snapshot_7.dat");
    std::fs::write(&path, b"NOPE but long enough to have a header").unwrap();
    assert!(snapshot::load(&path).is_none());
    assert!(snapshot::load(&dir.path().join("absent.dat")).is_none());
}

#[test]
fn test_snapshot_find_latest() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::new();
    engine.set(b("k"), b("v"), Version::new(1, 1));

    snapshot::save(&engine, 5, dir.path()).unwrap();
    snapshot::save(&engine, 12, dir.path()).unwrap();
    snapshot::save(&engine, 9, dir.path()).unwrap();
    // Distractors that must not match the name pattern.
    std::fs::write(dir.path().join("snapshot_xyz.dat"), b"junk").unwrap();
    std::fs::write(dir.path().join("other.txt"), b"junk").unwrap();

    let latest = snapshot::find_latest(dir.path()).unwrap();
    assert!(latest.ends_with("snapshot_12.dat"));

    assert!(snapshot::find_latest(&dir.path().join("missing")).is_none());
}

// ── Recovery composition ────────────────────────────────────────────────────

#[test]
fn test_bootstrap_composes_snapshot_and_wal_tail() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snapshots");

    // Build the durable state: snapshot at seq 5 holding key1/key2, then
    // two WAL records past it.
    {
        let engine = StorageEngine::new();
        engine.set(b("key1"), b("v1"), Version::new(10, 1));
        engine.set(b("key2"), b("v2"), Version::new(20, 1));
        snapshot::save(&engine, 5, &snap_dir).unwrap();

        let wal = Wal::open(&wal_dir, 0, 0).unwrap();
        // Seqs 1..=5 are covered by the snapshot and must be skipped.
        for i in 0..5u64 {
            wal.append(OpType::Set, b"key1", b"stale", i).unwrap();
        }
        wal.append(OpType::Set, b"key3", b"v3", 30).unwrap();
        wal.append(OpType::Set, b"key1", b"v1_updated", 40).unwrap();
        wal.close().unwrap();
    }

    let engine = StorageEngine::new();
    let wal = Wal::open(&wal_dir, 0, 0).unwrap();
    let stats = recovery::bootstrap(&engine, &wal, &snap_dir, 1).unwrap();

    assert_eq!(stats.snapshot_seq, 5);
    assert_eq!(stats.snapshot_entries, 2);
    assert_eq!(stats.wal_records, 7);
    assert_eq!(stats.wal_replayed, 2);

    assert_eq!(engine.get(b"key1").unwrap().0, b("v1_updated"));
    assert_eq!(engine.get(b"key2").unwrap().0, b("v2"));
    assert_eq!(engine.get(b"key3").unwrap().0, b("v3"));

    // New appends continue past the recovered tail.
    assert_eq!(wal.append(OpType::Set, b"k", b"v", 50).unwrap(), 8);
}

#[test]
fn test_bootstrap_replays_snapshot_tombstones() {
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snapshots");

    {
        let engine = StorageEngine::new();
        engine.set(b("kept"), b("v"), Version::new(10, 1));
        engine.del(b("deleted"), Version::new(20, 1));
        snapshot::save(&engine, 1, &snap_dir).unwrap();
        Wal::open(&wal_dir, 0, 0).unwrap().close().unwrap();
    }

    let engine = StorageEngine::new();
    let wal = Wal::open(&wal_dir, 0, 0).unwrap();
    recovery::bootstrap(&engine, &wal, &snap_dir, 1).unwrap();

    assert!(engine.get(b"kept").is_some());
    assert!(engine.get(b"deleted").is_none());
    // The tombstone's version survives: an older resurrecting write loses.
    assert!(!engine.set(b("deleted"), b("zombie"), Version::new(15, 1)));
}
