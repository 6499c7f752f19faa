use std::fs;
use std::io::Write;
use std::path::Path;

use aostore::txn::inspect_redo_log;
use aostore::{IsolationLevel, RedoSyncMode, Result, StoreConfig, TransactionEngine};
use tempfile::tempdir;

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
        .handler_threads(2)
        .page_split_size(1024)
        .redo_sync(RedoSyncMode::Instant)
}

fn committed(engine: &TransactionEngine, map: &str, keys: std::ops::Range<u64>) -> Result<()> {
    let accounts = engine.open_default_map::<u64, String>(map)?;
    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    for key in keys {
        tx.insert(&accounts, key, format!("v{key}"))?;
    }
    tx.commit()
}

#[test]
fn committed_writes_survive_a_crash() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..200)?;
        let accounts = engine.open_default_map::<u64, String>("accounts")?;
        let mut unfinished = engine.begin(IsolationLevel::ReadCommitted)?;
        unfinished.insert(&accounts, 1_000, "lost".into())?;
        std::mem::forget(unfinished);
        // no close: nothing was saved to the map chunks
    }

    let engine = TransactionEngine::open(config(dir.path()))?;
    assert_eq!(engine.pending_redo_maps(), vec!["accounts".to_string()]);
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    assert!(engine.pending_redo_maps().is_empty());
    assert_eq!(accounts.size(), 200);
    let tx = engine.begin(IsolationLevel::ReadCommitted)?;
    for key in 0..200u64 {
        assert_eq!(tx.get(&accounts, &key)?, Some(format!("v{key}")));
    }
    assert_eq!(tx.get(&accounts, &1_000)?, None);
    tx.rollback()?;
    engine.close()
}

#[test]
fn checkpoint_then_crash_replays_only_the_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..100)?;
        engine.checkpoint()?;
        assert_eq!(engine.checkpointer().redo_bytes_since_checkpoint(), 0);

        let accounts = engine.open_default_map::<u64, String>("accounts")?;
        let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
        for key in 0..10u64 {
            tx.delete(&accounts, key)?;
        }
        for key in 10..20u64 {
            tx.update(&accounts, key, format!("w{key}"))?;
        }
        tx.commit()?;
    }

    let redo_dir = config(dir.path()).redo_log_path();
    let summary = inspect_redo_log(&redo_dir)?;
    let records: usize = summary.iter().map(|c| c.records).sum();
    assert_eq!(records, 20, "checkpointed records were deleted");

    let engine = TransactionEngine::open(config(dir.path()))?;
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    assert_eq!(accounts.size(), 90);
    let tx = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(tx.get(&accounts, &5)?, None);
    assert_eq!(tx.get(&accounts, &15)?, Some("w15".to_string()));
    assert_eq!(tx.get(&accounts, &50)?, Some("v50".to_string()));
    tx.rollback()?;
    engine.close()
}

#[test]
fn torn_redo_tail_is_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..10)?;
    }
    let redo_dir = config(dir.path()).redo_log_path();
    let last = inspect_redo_log(&redo_dir)?
        .last()
        .map(|c| c.id)
        .expect("a redo chunk");
    let path = redo_dir.join(format!("redoLog_{last}"));
    let mut file = fs::OpenOptions::new().append(true).open(&path)?;
    file.write_all(&[8, b'a', b'c', b'c', 0, 0, 0, 40, 1])?;
    drop(file);

    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        let accounts = engine.open_default_map::<u64, String>("accounts")?;
        assert_eq!(accounts.size(), 10);
        committed(&engine, "accounts", 10..20)?;
    }

    let engine = TransactionEngine::open(config(dir.path()))?;
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    assert_eq!(accounts.size(), 20);
    engine.close()
}

#[test]
fn unopened_maps_keep_their_records_across_checkpoints() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "a", 0..5)?;
        committed(&engine, "b", 0..7)?;
    }
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        let a = engine.open_default_map::<u64, String>("a")?;
        let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
        tx.delete(&a, 0)?;
        tx.commit()?;
        engine.checkpoint()?;
        assert_eq!(engine.pending_redo_maps(), vec!["b".to_string()]);
    }

    let engine = TransactionEngine::open(config(dir.path()))?;
    assert_eq!(engine.pending_redo_maps(), vec!["b".to_string()]);
    let a = engine.open_default_map::<u64, String>("a")?;
    let b = engine.open_default_map::<u64, String>("b")?;
    assert_eq!(a.size(), 4, "deleted key stays deleted");
    assert!(a.get(&0)?.is_none());
    assert_eq!(b.size(), 7);
    engine.close()
}

#[test]
fn close_folds_the_redo_log_into_the_maps() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..50)?;
        engine.close()?;
    }
    let summary = inspect_redo_log(&config(dir.path()).redo_log_path())?;
    assert_eq!(summary.iter().map(|c| c.records).sum::<usize>(), 0);

    let engine = TransactionEngine::open(config(dir.path()))?;
    assert!(engine.pending_redo_maps().is_empty());
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    assert_eq!(accounts.size(), 50);
    engine.close()
}

#[test]
fn read_only_engine_reads_but_rejects_writes() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..5)?;
        engine.close()?;
    }
    let mut cfg = config(dir.path());
    cfg.read_only = true;
    let engine = TransactionEngine::open(cfg)?;
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(tx.get(&accounts, &3)?, Some("v3".to_string()));
    assert!(tx.insert(&accounts, 9, "x".into()).is_err());
    tx.rollback()?;
    engine.close()
}

#[test]
fn checkpoint_with_open_transactions_saves_only_committed_entries() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let engine = TransactionEngine::open(config(dir.path()))?;
        committed(&engine, "accounts", 0..3)?;
        let accounts = engine.open_default_map::<u64, String>("accounts")?;

        let reader = engine.begin(IsolationLevel::RepeatableRead)?;
        let mut deleter = engine.begin(IsolationLevel::ReadCommitted)?;
        deleter.delete(&accounts, 0)?;
        deleter.commit()?;
        assert!(accounts.get(&0)?.is_some_and(|cell| cell.is_tombstone()));

        let mut unfinished = engine.begin(IsolationLevel::ReadCommitted)?;
        unfinished.insert(&accounts, 1_000, "uncommitted".into())?;
        assert_eq!(accounts.size(), 3);
        engine.checkpoint()?;

        std::mem::forget(unfinished);
        std::mem::forget(reader);
    }

    let engine = TransactionEngine::open(config(dir.path()))?;
    assert!(engine.pending_redo_maps().is_empty());
    let accounts = engine.open_default_map::<u64, String>("accounts")?;
    assert_eq!(accounts.size(), 2);
    assert!(accounts.get(&0)?.is_none(), "tombstones are not saved");
    assert!(accounts.get(&1_000)?.is_none());
    let tx = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(tx.get(&accounts, &1)?, Some("v1".to_string()));
    assert_eq!(tx.get(&accounts, &2)?, Some("v2".to_string()));
    tx.rollback()?;

    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    tx.insert(&accounts, 0, "again".into())?;
    tx.insert(&accounts, 1_000, "now".into())?;
    tx.commit()?;
    assert_eq!(accounts.size(), 4);
    engine.close()
}
