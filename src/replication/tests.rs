use bytes::Bytes;
use tempfile::tempdir;

use super::hints::{Hint, HintStore};
use crate::storage::types::Version;

fn hint(target: u32, key: &'static str, is_del: bool) -> Hint {
    Hint {
        target_node_id: target,
        target_address: format!("10.0.0.{target}:7001"),
        key: Bytes::from_static(key.as_bytes()),
        value: if is_del {
            Bytes::new()
        } else {
            Bytes::from_static(b"value with spaces")
        },
        is_del,
        version: Version::new(1000 + u64::from(target), 1),
    }
}

#[test]
fn test_store_and_fetch_per_target() {
    let store = HintStore::new(None);
    store.store(hint(2, "a", false));
    store.store(hint(2, "b", true));
    store.store(hint(3, "c", false));

    assert_eq!(store.total(), 3);
    let for_two = store.hints_for(2);
    assert_eq!(for_two.len(), 2);
    assert_eq!(for_two[0].key, Bytes::from_static(b"a"));
    assert!(for_two[1].is_del);
    assert!(store.hints_for(9).is_empty());
}

#[test]
fn test_clear_hints_for_target() {
    let store = HintStore::new(None);
    store.store(hint(2, "a", false));
    store.store(hint(3, "b", false));

    store.clear_hints_for(2);
    assert!(store.hints_for(2).is_empty());
    assert_eq!(store.hints_for(3).len(), 1);
    assert_eq!(store.total(), 1);
}

#[test]
fn test_hints_survive_restart() {
    let dir = tempdir().unwrap();

    {
        let store = HintStore::new(Some(dir.path().to_path_buf()));
        store.store(hint(2, "a", false));
        store.store(hint(2, "b", true));
        store.store(hint(5, "c", false));
    }

    assert!(dir.path().join("hints_2.dat").exists());
    assert!(dir.path().join("hints_5.dat").exists());

    let store = HintStore::new(Some(dir.path().to_path_buf()));
    assert_eq!(store.total(), 0);
    store.load();
    assert_eq!(store.total(), 3);

    let replayed = store.hints_for(2);
    assert_eq!(replayed, vec![hint(2, "a", false), hint(2, "b", true)]);
}

#[test]
fn test_clear_removes_file_on_disk() {
    let dir = tempdir().unwrap();
    let store = HintStore::new(Some(dir.path().to_path_buf()));
    store.store(hint(2, "a", false));
    assert!(dir.path().join("hints_2.dat").exists());

    store.clear_hints_for(2);
    assert!(!dir.path().join("hints_2.dat").exists());

    // Reloading after a clear finds nothing.
    let fresh = HintStore::new(Some(dir.path().to_path_buf()));
    fresh.load();
    assert_eq!(fresh.total(), 0);
}

#[test]
fn test_load_ignores_torn_tail() {
    let dir = tempdir().unwrap();
    {
        let store = HintStore::new(Some(dir.path().to_path_buf()));
        store.store(hint(2, "a", false));
        store.store(hint(2, "b", false));
    }

    // Truncate the file mid-record.
    let path = dir.path().join("hints_2.dat");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();

    let store = HintStore::new(Some(dir.path().to_path_buf()));
    store.load();
    assert_eq!(store.total(), 1, "only the intact record loads");
}
