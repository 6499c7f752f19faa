use std::path::Path;

use aostore::txn::EngineContext;
use aostore::{IsolationLevel, RedoSyncMode, Result, StoreConfig, StoreError, TransactionEngine};
use tempfile::tempdir;

fn engine(dir: &Path) -> Result<TransactionEngine> {
    TransactionEngine::open(
        StoreConfig::new(dir)
            .handler_threads(2)
            .redo_sync(RedoSyncMode::NoSync),
    )
}

#[test]
fn rollback_reverts_writes_across_maps() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let users = engine.open_default_map::<u64, String>("users")?;
    let emails = engine.open_default_map::<String, u64>("emails")?;

    let mut setup = engine.begin(IsolationLevel::ReadCommitted)?;
    setup.insert(&users, 1, "ann".into())?;
    setup.insert(&emails, "ann@example.com".into(), 1)?;
    setup.commit()?;

    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    tx.update(&users, 1, "anne".into())?;
    tx.delete(&emails, "ann@example.com".into())?;
    tx.insert(&users, 2, "bob".into())?;
    tx.insert(&emails, "bob@example.com".into(), 2)?;
    assert_eq!(users.size(), 2);
    tx.rollback()?;

    let check = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(check.get(&users, &1)?, Some("ann".to_string()));
    assert_eq!(check.get(&users, &2)?, None);
    assert_eq!(check.get(&emails, &"ann@example.com".to_string())?, Some(1));
    assert_eq!(check.get(&emails, &"bob@example.com".to_string())?, None);
    check.rollback()?;
    assert_eq!(users.size(), 1);
    assert_eq!(emails.size(), 1);
    engine.close()
}

#[test]
fn nested_savepoints_unwind_in_order() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let m = engine.open_default_map::<u64, u64>("m")?;

    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    tx.insert(&m, 1, 1)?;
    let outer = tx.savepoint();
    tx.update(&m, 1, 2)?;
    let inner = tx.savepoint();
    tx.update(&m, 1, 3)?;
    tx.insert(&m, 2, 2)?;

    tx.rollback_to(inner)?;
    assert_eq!(tx.get(&m, &1)?, Some(2));
    assert_eq!(tx.get(&m, &2)?, None);
    tx.rollback_to(outer)?;
    assert_eq!(tx.get(&m, &1)?, Some(1));
    tx.insert(&m, 3, 3)?;
    tx.commit()?;

    let check = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(check.get(&m, &1)?, Some(1));
    assert_eq!(check.get(&m, &3)?, Some(3));
    check.rollback()?;
    assert_eq!(m.size(), 2);
    engine.close()
}

#[test]
fn uncommitted_writes_block_other_writers_until_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let m = engine.open_default_map::<u64, u64>("m")?;

    let mut first = engine.begin(IsolationLevel::ReadCommitted)?;
    let mut second = engine.begin(IsolationLevel::ReadCommitted)?;
    first.insert(&m, 7, 1)?;
    assert!(matches!(second.insert(&m, 7, 2), Err(StoreError::WriteConflict(_))));
    assert!(matches!(second.delete(&m, 7), Err(StoreError::WriteConflict(_))));
    assert_eq!(second.get(&m, &7)?, None);
    first.commit()?;

    assert!(matches!(second.insert(&m, 7, 2), Err(StoreError::DuplicateKey(_))));
    assert_eq!(second.delete(&m, 7)?, 1);
    second.commit()?;
    assert_eq!(m.size(), 0);
    engine.close()
}

#[test]
fn a_failed_write_leaves_the_transaction_usable() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let m = engine.open_default_map::<u64, String>("m")?;
    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
    assert!(matches!(tx.update(&m, 1, "x".into()), Err(StoreError::NotFound)));
    tx.insert(&m, 1, "a".into())?;
    assert!(matches!(tx.insert(&m, 1, "b".into()), Err(StoreError::DuplicateKey(_))));
    tx.commit()?;
    assert_eq!(m.size(), 1);
    engine.close()
}

#[test]
fn repeatable_read_defers_tombstone_removal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let m = engine.open_default_map::<u64, u64>("m")?;
    let mut setup = engine.begin(IsolationLevel::ReadCommitted)?;
    for key in 0..10u64 {
        setup.insert(&m, key, key)?;
    }
    setup.commit()?;

    let reader = engine.begin(IsolationLevel::RepeatableRead)?;
    let mut deleter = engine.begin(IsolationLevel::ReadCommitted)?;
    for key in 0..5u64 {
        deleter.delete(&m, key)?;
    }
    deleter.commit()?;
    assert_eq!(m.size(), 5);
    assert_eq!(engine.pending_purges(), 5);

    // a checkpoint while the reader is active keeps the tombstones
    engine.checkpoint()?;
    assert_eq!(engine.pending_purges(), 5);
    assert!(m.get(&0)?.is_some_and(|cell| cell.is_tombstone()));

    reader.rollback()?;
    assert_eq!(engine.pending_purges(), 0);
    for key in 0..5u64 {
        assert!(m.get(&key)?.is_none());
    }
    assert_eq!(m.size(), 5);
    engine.close()
}

#[test]
fn ids_increase_and_drop_ends_the_transaction() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = engine(dir.path())?;
    let m = engine.open_default_map::<u64, u64>("m")?;
    let mut tx = engine.begin(IsolationLevel::RepeatableRead)?;
    tx.insert(&m, 1, 1)?;
    let id = tx.id();
    tx.commit()?;
    let next = engine.begin(IsolationLevel::ReadCommitted)?;
    assert!(next.id() > id);
    drop(next);
    assert_eq!(engine.active_transactions(), 0);
    assert!(!engine.contains_repeatable_read_transactions());
    engine.close()
}
