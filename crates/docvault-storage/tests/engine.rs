//! Engine scenario tests
//!
//! End-to-end behavior against a real data directory:
//! - CRUD round-trips and shard placement
//! - Secondary-key and folder bookkeeping
//! - Folder move/delete
//! - Compaction healing in both directions
//! - Crash recovery through the WAL
//! - Writer exclusion

use docvault_common::{EngineConfig, Error, OrphanPolicy, Record, RecordKey};
use docvault_storage::{Engine, ExclusiveLock};
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn open(dir: &Path) -> Engine {
    Engine::open(EngineConfig::with_data_dir(dir)).unwrap()
}

fn rec(value: Value) -> Record {
    value.as_object().unwrap().clone()
}

fn num(n: u64) -> RecordKey {
    RecordKey::Numeric(n)
}

fn folder_of(engine: &Engine, key: u64) -> Value {
    engine.get(&num(key)).unwrap().unwrap()["folder"].clone()
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

#[test]
fn test_create_then_get_returns_record() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    let stored = engine
        .create(rec(json!({"id": 10, "filename": "r.pdf", "size": 2048})))
        .unwrap();
    let fetched = engine.get(&num(10)).unwrap().unwrap();
    assert_eq!(fetched, stored);
    assert_eq!(fetched["size"], 2048);
}

#[test]
fn test_delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1}))).unwrap();

    assert!(engine.delete(&num(1)).unwrap());
    assert!(!engine.delete(&num(1)).unwrap());
    assert!(engine.get(&num(1)).unwrap().is_none());
    assert!(!engine.exists(&num(1)));
}

#[test]
fn test_shard_placement() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.create(rec(json!({"id": "5"}))).unwrap();
    engine.create(rec(json!({"id": "1050"}))).unwrap();

    assert!(dir.path().join("documents/0-999/5.json").is_file());
    assert!(dir.path().join("documents/1000-1999/1050.json").is_file());
}

#[test]
fn test_named_keys() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine
        .create(rec(json!({"id": "invoice-2026-03", "filename": "inv.pdf"})))
        .unwrap();
    let key = RecordKey::Named("invoice-2026-03".into());
    assert_eq!(engine.get(&key).unwrap().unwrap()["filename"], "inv.pdf");

    let err = engine.create(rec(json!({"id": "../escape"}))).unwrap_err();
    assert!(matches!(err, Error::InvalidKey(_)));
}

#[test]
fn test_update_never_relocates() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        shard_capacity: 10,
        ..EngineConfig::with_data_dir(dir.path())
    };
    let engine = Engine::open(config).unwrap();
    engine.create(rec(json!({"id": 15, "filename": "a"}))).unwrap();

    engine
        .update(&num(15), rec(json!({"filename": "b", "folder": "moved"})))
        .unwrap();
    assert!(dir.path().join("documents/10-19/15.json").is_file());
    assert_eq!(engine.get(&num(15)).unwrap().unwrap()["filename"], "b");

    let moved = engine.list_by_group("moved", false).unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0]["id"], 15);
    assert!(engine.list_ungrouped().unwrap().is_empty());

    engine
        .update(&num(15), rec(json!({"folder": "elsewhere"})))
        .unwrap();
    assert!(engine.list_by_group("moved", false).unwrap().is_empty());
    assert_eq!(engine.list_by_group("elsewhere", false).unwrap().len(), 1);
    assert_eq!(engine.list_folders(), vec!["elsewhere"]);
}

#[test]
fn test_keys_beyond_eighteen_digits_stay_numeric() {
    let dir = tempdir().unwrap();
    let config = || EngineConfig {
        orphan_policy: OrphanPolicy::Delete,
        ..EngineConfig::with_data_dir(dir.path())
    };
    let big = 1_000_000_000_000_000_000_u64;
    {
        let engine = Engine::open(config()).unwrap();
        engine.create(rec(json!({"id": big, "filename": "big"}))).unwrap();
        engine.create(rec(json!({"id": u64::MAX}))).unwrap();

        assert!(engine.compact().unwrap().is_clean());
        assert!(engine.compact().unwrap().is_clean());
        assert_eq!(engine.get(&num(big)).unwrap().unwrap()["filename"], "big");
        engine.close().unwrap();
    }

    let engine = Engine::open(config()).unwrap();
    assert_eq!(engine.len(), 2);
    assert_eq!(engine.list_all().unwrap().len(), 2);
    assert!(engine.exists(&num(u64::MAX)));
    assert!(!engine.exists(&RecordKey::Named(big.to_string())));

    assert!(engine.compact().unwrap().is_clean());
    drop(engine);
    let engine = Engine::open(config()).unwrap();
    assert_eq!(engine.get(&num(big)).unwrap().unwrap()["filename"], "big");
    assert_eq!(engine.stats().last_id, u64::MAX);
}

// ---------------------------------------------------------------------------
// Secondary key and folders
// ---------------------------------------------------------------------------

#[test]
fn test_secondary_key_follows_updates() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1, "checksum": "aaa"}))).unwrap();

    engine
        .update(&num(1), rec(json!({"checksum": "bbb"})))
        .unwrap();
    assert!(engine.find_by_secondary_key("aaa").unwrap().is_none());
    assert_eq!(engine.find_by_secondary_key("bbb").unwrap().unwrap()["id"], 1);

    engine.delete(&num(1)).unwrap();
    assert!(engine.find_by_secondary_key("bbb").unwrap().is_none());
}

#[test]
fn test_list_by_group() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1, "folder": "A"}))).unwrap();
    engine.create(rec(json!({"id": 2, "folder": "/A/B/"}))).unwrap();
    engine.create(rec(json!({"id": 3, "folder": "AB"}))).unwrap();
    engine.create(rec(json!({"id": 4}))).unwrap();

    let direct = engine.list_by_group("A", false).unwrap();
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0]["id"], 1);

    let subtree = engine.list_by_group("A", true).unwrap();
    let ids: Vec<_> = subtree.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
    assert_eq!(subtree[1]["folder"], "A/B");

    let root = engine.list_ungrouped().unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0]["id"], 4);
    assert_eq!(engine.list_all().unwrap().len(), 4);
}

#[test]
fn test_list_folders_includes_implied_ancestors() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create_folder("Empty", Record::new()).unwrap();
    engine
        .create(rec(json!({"id": 1, "folder": "Work/2026/Q1"})))
        .unwrap();

    assert_eq!(
        engine.list_folders(),
        vec!["Empty", "Work", "Work/2026", "Work/2026/Q1"]
    );
}

#[test]
fn test_move_group_scenario() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1, "folder": "A"}))).unwrap();
    engine.create(rec(json!({"id": 2, "folder": "A/B"}))).unwrap();
    engine.create(rec(json!({"id": 3, "folder": "AX"}))).unwrap();
    engine.create_folder("A/B", Record::new()).unwrap();

    assert_eq!(engine.move_group("A", Some("Z")).unwrap(), 2);
    assert_eq!(folder_of(&engine, 1), "Z");
    assert_eq!(folder_of(&engine, 2), "Z/B");
    assert_eq!(folder_of(&engine, 3), "AX");
    assert!(engine.get_folder("Z/B").is_some());
    assert!(engine.get_folder("A/B").is_none());
    assert!(!engine.list_folders().contains(&"A".to_string()));

    assert_eq!(engine.move_group("Z", None).unwrap(), 2);
    assert_eq!(folder_of(&engine, 1), Value::Null);
    assert_eq!(folder_of(&engine, 2), "B");
    assert_eq!(engine.list_ungrouped().unwrap().len(), 1);
}

#[test]
fn test_delete_group_removes_subtree() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create_folder("P", Record::new()).unwrap();
    engine.create_folder("P/Q", Record::new()).unwrap();
    engine.create(rec(json!({"id": 1, "folder": "P"}))).unwrap();
    engine.create(rec(json!({"id": 2, "folder": "P/Q/R"}))).unwrap();
    engine.create(rec(json!({"id": 3, "folder": "PQ"}))).unwrap();

    assert_eq!(engine.delete_group("P").unwrap(), 2);
    assert!(engine.list_by_group("P", true).unwrap().is_empty());
    assert!(engine.get_folder("P").is_none());
    assert!(engine.get_folder("P/Q").is_none());
    assert!(engine.get(&num(3)).unwrap().is_some());
    assert_eq!(engine.list_folders(), vec!["PQ"]);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.create_folder("Kept", rec(json!({"color": "red"}))).unwrap();
        engine
            .create(rec(json!({"id": 7, "folder": "Docs", "checksum": "x1"})))
            .unwrap();
        engine.close().unwrap();
    }

    let engine = open(dir.path());
    assert_eq!(engine.get_folder("Kept").unwrap().extra["color"], "red");
    assert_eq!(engine.find_by_secondary_key("x1").unwrap().unwrap()["id"], 7);
    assert_eq!(engine.list_by_group("Docs", false).unwrap().len(), 1);
    assert_eq!(engine.stats().last_id, 7);
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_drops_entries_for_missing_files() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1, "checksum": "c"}))).unwrap();
    engine.create(rec(json!({"id": 2}))).unwrap();

    fs::remove_file(dir.path().join("documents/0-999/1.json")).unwrap();
    let report = engine.compact().unwrap();

    assert_eq!(report.dropped, 1);
    assert!(!engine.exists(&num(1)));
    assert!(engine.find_by_secondary_key("c").unwrap().is_none());
    assert_eq!(engine.len(), 1);
}

#[test]
fn test_compaction_of_consistent_store_is_noop() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    for id in 1..=5 {
        engine.create(rec(json!({"id": id, "folder": "f"}))).unwrap();
    }

    let first = engine.compact().unwrap();
    assert!(first.is_clean());
    let before = fs::read(dir.path().join("index.json")).unwrap();

    let second = engine.compact().unwrap();
    assert!(second.is_clean());
    let after = fs::read(dir.path().join("index.json")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_compaction_adopts_orphans() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());
    engine.create(rec(json!({"id": 1}))).unwrap();

    fs::write(
        dir.path().join("documents/0-999/9.json"),
        br#"{"id": 9, "folder": "X", "checksum": "zz", "filename": "orphan.pdf"}"#,
    )
    .unwrap();
    fs::write(dir.path().join("documents/0-999/8.json"), b"{ torn").unwrap();
    fs::write(dir.path().join("documents/0-999/1.json.tmp"), b"{}").unwrap();
    assert!(engine.get(&num(9)).unwrap().is_none());

    let report = engine.compact().unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.removed_temp, 1);
    assert_eq!(report.deleted_orphans, 0);

    assert_eq!(engine.get(&num(9)).unwrap().unwrap()["filename"], "orphan.pdf");
    assert_eq!(engine.find_by_secondary_key("zz").unwrap().unwrap()["id"], 9);
    assert_eq!(engine.list_by_group("X", false).unwrap().len(), 1);
    assert_eq!(engine.stats().last_id, 9);
    // Unreadable orphans stay where they are
    assert!(dir.path().join("documents/0-999/8.json").exists());
}

#[test]
fn test_compaction_delete_policy() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        orphan_policy: OrphanPolicy::Delete,
        ..EngineConfig::with_data_dir(dir.path())
    };
    let engine = Engine::open(config).unwrap();
    engine.create(rec(json!({"id": 1}))).unwrap();

    let orphan = dir.path().join("documents/0-999/2.json");
    fs::write(&orphan, br#"{"id": 2}"#).unwrap();

    let report = engine.compact().unwrap();
    assert_eq!(report.deleted_orphans, 1);
    assert!(!orphan.exists());
    assert_eq!(engine.len(), 1);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

fn append_wal_line(dir: &Path, line: &str) {
    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("logs/writes.log"))
        .unwrap();
    writeln!(log, "{line}").unwrap();
}

#[test]
fn test_recovery_indexes_written_but_unindexed_record() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.create(rec(json!({"id": 1}))).unwrap();
        engine.close().unwrap();
    }

    // Crash after the record write and WAL flush, before the index save
    fs::write(
        dir.path().join("documents/0-999/2.json"),
        br#"{"id": 2, "filename": "crash.pdf", "checksum": "k"}"#,
    )
    .unwrap();
    append_wal_line(
        dir.path(),
        r#"{"timestamp":"2026-01-01T00:00:00.000Z","operation":"create","data":{"id":2}}"#,
    );

    let engine = open(dir.path());
    assert_eq!(engine.get(&num(2)).unwrap().unwrap()["filename"], "crash.pdf");
    assert_eq!(engine.find_by_secondary_key("k").unwrap().unwrap()["id"], 2);
    let index = fs::read_to_string(dir.path().join("index.json")).unwrap();
    assert!(index.contains("crash.pdf"));
}

#[test]
fn test_recovery_drops_deleted_record() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.create(rec(json!({"id": 3}))).unwrap();
        engine.close().unwrap();
    }

    // Crash after the file removal, before the index save
    fs::remove_file(dir.path().join("documents/0-999/3.json")).unwrap();
    append_wal_line(
        dir.path(),
        r#"{"timestamp":"2026-01-01T00:00:00.000Z","operation":"delete","data":{"id":3}}"#,
    );

    let engine = open(dir.path());
    assert!(!engine.exists(&num(3)));
    assert!(engine.is_empty());
    assert_eq!(engine.stats().last_id, 3);
}

#[test]
fn test_recovery_tolerates_corrupt_wal_and_index() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.create(rec(json!({"id": 4}))).unwrap();
        engine.close().unwrap();
    }
    append_wal_line(dir.path(), "{\"timestamp\": \"2026");
    fs::write(dir.path().join("index.json"), b"garbage").unwrap();

    // The index comes back empty, then the WAL re-derives record 4 from disk
    let engine = open(dir.path());
    assert!(engine.exists(&num(4)));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_creates_lose_nothing() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(open(dir.path()));

    let mut ids: Vec<u64> = (1..=200).collect();
    ids.shuffle(&mut rand::thread_rng());

    let handles: Vec<_> = ids
        .chunks(25)
        .map(|chunk| {
            let engine = Arc::clone(&engine);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for id in chunk {
                    engine.create(rec(json!({"id": id}))).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(engine.len(), 200);
    drop(engine);
    assert_eq!(open(dir.path()).len(), 200);
}

// A FIFO posing as an orphan record parks compaction inside its file
// reads until the test writes to it.
#[cfg(unix)]
#[test]
fn test_cached_reads_proceed_during_compaction() {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::os::unix::fs::OpenOptionsExt;
    use std::sync::mpsc;
    use std::time::Instant;

    let dir = tempdir().unwrap();
    let engine = Arc::new(open(dir.path()));
    engine.create(rec(json!({"id": 1, "filename": "hot"}))).unwrap();

    let fifo = dir.path().join("documents/0-999/77.json");
    mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

    let compactor = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.compact())
    };

    // A non-blocking writer open only succeeds once compaction has the
    // FIFO open for reading
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut feed = loop {
        match fs::OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&fifo)
        {
            Ok(file) => break file,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("compaction never reached the orphan file: {e}"),
        }
    };

    let (tx, rx) = mpsc::channel();
    let reader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let record = engine.get(&num(1)).unwrap();
            tx.send(record).unwrap();
        })
    };
    let during = rx.recv_timeout(Duration::from_secs(5));

    feed.write_all(br#"{"id": 77}"#).unwrap();
    drop(feed);
    let report = compactor.join().unwrap().unwrap();
    reader.join().unwrap();

    let record = during.expect("cached get waited for compaction");
    assert_eq!(record.unwrap()["filename"], "hot");
    assert_eq!(report.adopted, 1);
    assert!(engine.exists(&num(77)));
}

#[test]
fn test_writer_times_out_on_foreign_lock() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        lock_timeout_ms: 150,
        lock_poll_interval_ms: 10,
        ..EngineConfig::with_data_dir(dir.path())
    };
    let engine = Engine::open(config).unwrap();

    let foreign = ExclusiveLock::new(dir.path().join("db.lock"), Duration::from_millis(10));
    let held = foreign.acquire(Duration::from_secs(1)).unwrap();

    let err = engine.create(rec(json!({"id": 1}))).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(!engine.exists(&num(1)));

    held.release().unwrap();
    engine.create(rec(json!({"id": 1}))).unwrap();
    assert!(engine.exists(&num(1)));
}
