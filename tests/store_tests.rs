use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use uvars::store::{VariableStore, SAVE_MSG, TEMP_PREFIX, VERSION_LINE};

#[test]
fn test_round_trip_through_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vars");

    let writer = VariableStore::new();
    let awkward = "tab\there, newline\nthere, snowman ☃, fish 🐟, back\\slash";
    writer.set("awkward", awkward, true).unwrap();
    writer.set("empty", "", false).unwrap();
    assert!(writer.sync(&path));

    let reader = VariableStore::new();
    assert!(reader.load(&path));
    assert_eq!(reader.get("awkward").as_deref(), Some(awkward));
    assert!(reader.get_export("awkward"));
    assert_eq!(reader.get("empty").as_deref(), Some(""));
}

#[test]
fn test_file_is_line_oriented_and_sorted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vars");

    let store = VariableStore::new();
    for name in ["c", "a", "b"] {
        store.set(name, "multi\nline", false).unwrap();
    }
    store.sync(&path);

    let contents = fs::read_to_string(&path).unwrap();
    let body = contents
        .strip_prefix(SAVE_MSG)
        .and_then(|rest| rest.strip_prefix(VERSION_LINE))
        .unwrap();
    assert_eq!(
        body,
        "SET a:multi\\x0aline\nSET b:multi\\x0aline\nSET c:multi\\x0aline\n"
    );
}

#[test]
fn test_repeated_load_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vars");
    fs::write(&path, "SET a:1\nSET_EXPORT b:2\n").unwrap();

    let store = VariableStore::new();
    let first = store.load_reporting(&path).unwrap();
    assert_eq!(first.len(), 2);
    let before = store.snapshot();

    for _ in 0..3 {
        assert_eq!(store.load_reporting(&path), Some(Vec::new()));
    }
    assert_eq!(store.snapshot(), before);
}

#[test]
fn test_interrupted_save_leaves_file_intact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vars");

    let store = VariableStore::new();
    store.set("safe", "original", false).unwrap();
    assert!(store.sync(&path));
    let saved = fs::read(&path).unwrap();

    // What a writer killed between writing its temporary file and renaming
    // it would leave behind.
    fs::write(
        dir.path().join(format!("{}crashed", TEMP_PREFIX)),
        "SET safe:half-writ",
    )
    .unwrap();

    let reader = VariableStore::new();
    assert!(reader.load(&path));
    assert_eq!(reader.get("safe").as_deref(), Some("original"));
    assert_eq!(fs::read(&path).unwrap(), saved);
}

#[test]
fn test_external_edit_picked_up_on_next_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vars");

    let store = VariableStore::new();
    store.set("mine", "1", false).unwrap();
    store.sync(&path);

    let other = VariableStore::new();
    other.load(&path);
    other.set("theirs", "2", false).unwrap();
    other.remove("mine").unwrap();
    other.sync(&path);

    let changes = store.load_reporting(&path).unwrap();
    assert_eq!(changes.len(), 2);
    assert!(store.get("mine").is_none());
    assert_eq!(store.get("theirs").as_deref(), Some("2"));
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let path = Arc::new(dir.path().join("vars"));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let store = VariableStore::new();
                for round in 0..5 {
                    store.set(&format!("writer_{}_{}", i, round), "x", false).unwrap();
                    while !store.modified_names().is_empty() {
                        store.sync(&path);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reader = VariableStore::new();
    reader.load(&path);
    assert_eq!(reader.len(), 20);
}
