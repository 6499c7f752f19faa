use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aostore::{
    IsolationLevel, RedoSyncMode, Result, StoreConfig, StoreError, TransactionEngine,
};
use tempfile::tempdir;

const THREADS: u64 = 6;
const KEYS_PER_THREAD: u64 = 300;
const SHARED_KEYS: u64 = 64;

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
        .handler_threads(3)
        .page_split_size(512)
        .redo_sync(RedoSyncMode::NoSync)
}

#[test]
fn concurrent_transactions_on_disjoint_and_shared_keys() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let engine = Arc::new(TransactionEngine::open(config(dir.path()))?);
    let map = engine.open_default_map::<u64, u64>("m")?;
    let shared_wins = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let map = map.clone();
            let shared_wins = Arc::clone(&shared_wins);
            thread::spawn(move || -> Result<()> {
                let base = 1_000_000 * (t + 1);
                for batch in 0..KEYS_PER_THREAD / 10 {
                    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
                    for i in 0..10 {
                        tx.insert(&map, base + batch * 10 + i, t)?;
                    }
                    if batch % 5 == 4 {
                        tx.rollback()?;
                    } else {
                        tx.commit()?;
                    }
                }
                for key in 0..SHARED_KEYS {
                    let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
                    match tx.insert(&map, key, t) {
                        Ok(()) => {
                            tx.commit()?;
                            shared_wins.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(StoreError::WriteConflict(_)) | Err(StoreError::DuplicateKey(_)) => {
                            tx.rollback()?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread")?;
    }

    // every shared key is claimed by at most one thread
    let wins = shared_wins.load(Ordering::Relaxed) as u64;
    let claimed = (0..SHARED_KEYS)
        .filter(|key| map.get(key).ok().flatten().is_some())
        .count() as u64;
    assert_eq!(wins, claimed);

    let committed_per_thread = KEYS_PER_THREAD - KEYS_PER_THREAD / 50 * 10;
    assert_eq!(map.size(), THREADS * committed_per_thread + claimed);
    assert_eq!(engine.active_transactions(), 0);

    engine.checkpoint()?;
    engine.close()?;
    drop(map);

    let engine = TransactionEngine::open(config(dir.path()))?;
    let map = engine.open_default_map::<u64, u64>("m")?;
    assert_eq!(map.size(), THREADS * committed_per_thread + claimed);
    let tx = engine.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(tx.get(&map, &(1_000_000 * 2 + 3))?, Some(1));
    assert_eq!(tx.get(&map, &(1_000_000 * 2 + 45))?, None, "rolled back batch");
    tx.rollback()?;
    engine.close()
}

#[test]
fn background_checkpoints_run_while_writing() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut cfg = config(dir.path()).checkpoint_period(Some(Duration::from_millis(10)));
    cfg.redo_checkpoint_bytes = 256;
    let engine = TransactionEngine::open(cfg)?;
    let map = engine.open_default_map::<u64, String>("log")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut key = 0u64;
    while engine.checkpointer().checkpoints_completed() == 0 {
        assert!(Instant::now() < deadline, "no background checkpoint ran");
        let mut tx = engine.begin(IsolationLevel::ReadCommitted)?;
        tx.insert(&map, key, format!("entry {key}"))?;
        tx.commit()?;
        key += 1;
        thread::sleep(Duration::from_millis(2));
    }
    engine.close()?;

    let engine = TransactionEngine::open(config(dir.path()))?;
    let map = engine.open_default_map::<u64, String>("log")?;
    assert_eq!(map.size(), key);
    engine.close()
}
