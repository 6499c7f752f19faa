#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::chunk::RedoLogChunk;
use crate::config::{RedoSyncMode, StoreConfig};
use crate::txn::checkpoint::CheckpointService;
use crate::types::{clone_error, Result};

/// Batching and durability settings of the redo committer.
#[derive(Clone, Copy, Debug)]
pub struct RedoCommitConfig {
    /// Maximum number of commit requests to batch together
    pub max_batch_commits: usize,
    /// Maximum time to wait for additional commits before flushing a batch
    pub max_batch_wait: Duration,
    pub sync: RedoSyncMode,
    /// Minimum spacing of fsyncs under [`RedoSyncMode::Periodic`]
    pub sync_period: Duration,
}

impl Default for RedoCommitConfig {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl RedoCommitConfig {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_batch_commits: config.redo_batch_max_commits,
            max_batch_wait: Duration::from_micros(config.redo_batch_max_wait_us),
            sync: config.redo_sync,
            sync_period: Duration::from_millis(config.redo_sync_period_ms),
        }
    }

    fn normalize(mut self) -> Self {
        if self.max_batch_commits == 0 {
            self.max_batch_commits = 1;
        }
        if self.max_batch_wait.is_zero() {
            self.max_batch_wait = Duration::from_micros(100);
        }
        self
    }
}

/// Appends commit buffers to the live redo chunk from a worker thread.
///
/// Concurrent commits are coalesced into one write, and one fsync when the
/// sync mode asks for it. The worker is spawned on demand and exits once the
/// queue drains.
pub struct RedoCommitter {
    shared: Arc<Shared>,
}

struct Shared {
    live: Arc<Mutex<RedoLogChunk>>,
    service: Arc<dyn CheckpointService>,
    config: RedoCommitConfig,
    state: Mutex<CommitState>,
    wakeup: Condvar,
    last_sync: Mutex<Instant>,
}

/// Ticket representing a pending commit.
pub struct RedoCommitTicket {
    request: Arc<CommitRequest>,
}

impl RedoCommitTicket {
    /// Blocks until the buffer is appended (and synced, per the sync mode).
    pub fn wait(self) -> Result<()> {
        self.request.wait()
    }
}

impl RedoCommitter {
    pub fn new(
        live: Arc<Mutex<RedoLogChunk>>,
        service: Arc<dyn CheckpointService>,
        config: RedoCommitConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                live,
                service,
                config: config.normalize(),
                state: Mutex::new(CommitState::default()),
                wakeup: Condvar::new(),
                last_sync: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Enqueues `buffer` without blocking. Empty buffers need no ticket.
    pub fn enqueue(&self, buffer: Vec<u8>) -> Option<RedoCommitTicket> {
        if buffer.is_empty() {
            return None;
        }
        let request = Arc::new(CommitRequest::new(buffer));
        {
            let mut state = self.shared.state.lock();
            state.pending.push_back(Arc::clone(&request));
            debug!(
                bytes = request.buffer.len(),
                pending = state.pending.len(),
                worker_running = state.worker_running,
                "redo.committer.enqueue"
            );
            if !state.worker_running {
                state.worker_running = true;
                let shared = Arc::clone(&self.shared);
                thread::spawn(move || shared.worker_loop());
            } else {
                self.shared.wakeup.notify_one();
            }
        }
        Some(RedoCommitTicket { request })
    }

    /// Enqueues `buffer` and blocks until it is durable per the sync mode.
    pub fn commit(&self, buffer: Vec<u8>) -> Result<()> {
        match self.enqueue(buffer) {
            Some(ticket) => ticket.wait(),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> RedoCommitConfig {
        self.shared.config
    }
}

impl Shared {
    fn worker_loop(self: Arc<Self>) {
        let mut batch = Vec::new();
        loop {
            batch.clear();
            {
                let mut guard = self.state.lock();
                let Some(first) = guard.pending.pop_front() else {
                    guard.worker_running = false;
                    debug!("redo.committer.worker_exit");
                    break;
                };
                batch.push(first);
            }
            self.coalesce_batch(&mut batch);
            match self.apply_batch(&batch) {
                Ok(()) => {
                    for req in batch.drain(..) {
                        req.finish(Ok(()));
                    }
                }
                Err(err) => {
                    for req in &batch {
                        req.finish(Err(clone_error(&err)));
                    }
                    let mut guard = self.state.lock();
                    while let Some(req) = guard.pending.pop_front() {
                        req.finish(Err(clone_error(&err)));
                    }
                    guard.worker_running = false;
                    break;
                }
            }
        }
    }

    fn coalesce_batch(&self, batch: &mut Vec<Arc<CommitRequest>>) {
        let start = Instant::now();
        while batch.len() < self.config.max_batch_commits {
            let remaining = match self.config.max_batch_wait.checked_sub(start.elapsed()) {
                Some(dur) if !dur.is_zero() => dur,
                _ => break,
            };
            let mut guard = self.state.lock();
            if guard.pending.is_empty() {
                let wait_result = self.wakeup.wait_for(&mut guard, remaining);
                if wait_result.timed_out() && guard.pending.is_empty() {
                    break;
                }
            }
            if let Some(req) = guard.pending.pop_front() {
                batch.push(req);
            }
        }
    }

    fn apply_batch(&self, batch: &[Arc<CommitRequest>]) -> Result<()> {
        let total: usize = batch.iter().map(|req| req.buffer.len()).sum();
        let mut flat = Vec::with_capacity(total);
        for req in batch {
            flat.extend_from_slice(&req.buffer);
        }
        let mut live = self.live.lock();
        let start = live.len();
        let synced = match self.config.sync {
            RedoSyncMode::Instant => true,
            RedoSyncMode::Periodic => self.last_sync.lock().elapsed() >= self.config.sync_period,
            RedoSyncMode::NoSync => false,
        };
        let written = match live.append(&flat) {
            Ok(()) if synced => live.sync(),
            other => other,
        };
        if let Err(err) = written {
            // failed commits must not become durable with a later sync
            warn!(chunk = live.id().0, start, error = %err, "redo.committer.batch_failed");
            if let Err(cut) = live.discard_from(start) {
                warn!(chunk = live.id().0, error = %cut, "redo.committer.discard_failed");
            }
            return Err(err);
        }
        if synced {
            *self.last_sync.lock() = Instant::now();
        }
        debug!(
            chunk = live.id().0,
            batch_commits = batch.len(),
            bytes = total,
            synced,
            "redo.committer.batch_applied"
        );
        drop(live);
        self.service.on_redo_appended(total as u64);
        Ok(())
    }
}

#[derive(Default)]
struct CommitState {
    pending: VecDeque<Arc<CommitRequest>>,
    worker_running: bool,
}

struct CommitRequest {
    buffer: Vec<u8>,
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl CommitRequest {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<()>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use crate::txn::checkpoint::{CheckpointPolicy, Checkpointer};
    use crate::types::{ChunkId, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    type Harness = (RedoCommitter, Arc<Checkpointer>, Arc<Mutex<RedoLogChunk>>);

    fn committer(dir: &std::path::Path, sync: RedoSyncMode) -> Result<Harness> {
        let live = Arc::new(Mutex::new(RedoLogChunk::open(dir, ChunkId(0))?));
        let service = Checkpointer::new(CheckpointPolicy {
            redo_bytes: u64::MAX,
            dirty_memory: usize::MAX,
            period: None,
        });
        let config = RedoCommitConfig {
            sync,
            sync_period: Duration::from_secs(60),
            ..RedoCommitConfig::default()
        };
        let committer = RedoCommitter::new(Arc::clone(&live), service.clone(), config);
        Ok((committer, service, live))
    }

    #[test]
    fn commits_append_in_order_and_report_bytes() -> Result<()> {
        let dir = tempdir().unwrap();
        let (committer, service, live) = committer(dir.path(), RedoSyncMode::Instant)?;
        committer.commit(vec![1, 2, 3])?;
        committer.commit(vec![4])?;
        committer.commit(Vec::new())?;
        assert_eq!(live.lock().len(), 4);
        assert!(!live.lock().has_unsynced());
        assert_eq!(service.redo_bytes_since_checkpoint(), 4);
        let bytes = std::fs::read(live.lock().path())?;
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn concurrent_commits_all_land() -> Result<()> {
        let dir = tempdir().unwrap();
        let (committer, _service, live) = committer(dir.path(), RedoSyncMode::NoSync)?;
        let committer = Arc::new(committer);
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let committer = Arc::clone(&committer);
                thread::spawn(move || -> Result<()> {
                    for _ in 0..50 {
                        committer.commit(vec![t; 3])?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap()?;
        }
        assert_eq!(live.lock().len(), 8 * 50 * 3);
        let bytes = std::fs::read(live.lock().path())?;
        for triple in bytes.chunks(3) {
            assert!(triple.iter().all(|b| *b == triple[0]), "commits interleaved");
        }
        Ok(())
    }

    /// File whose next `fail_syncs` syncs fail.
    struct FlakySync {
        file: StdFileIo,
        fail_syncs: AtomicUsize,
    }

    impl FileIo for FlakySync {
        fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
            self.file.read_at(off, dst)
        }

        fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
            self.file.write_at(off, src)
        }

        fn sync_all(&self) -> Result<()> {
            let failing = self
                .fail_syncs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(std::io::Error::other("injected sync failure").into());
            }
            self.file.sync_all()
        }

        fn len(&self) -> Result<u64> {
            self.file.len()
        }

        fn truncate(&self, len: u64) -> Result<()> {
            self.file.truncate(len)
        }
    }

    #[test]
    fn failed_batch_is_cut_from_the_chunk() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redoLog_0");
        let io = Arc::new(FlakySync {
            file: StdFileIo::open(&path)?,
            fail_syncs: AtomicUsize::new(0),
        });
        let chunk = RedoLogChunk::with_io(ChunkId(0), path.clone(), Arc::clone(&io) as Arc<dyn FileIo>)?;
        let live = Arc::new(Mutex::new(chunk));
        let service = Checkpointer::new(CheckpointPolicy {
            redo_bytes: u64::MAX,
            dirty_memory: usize::MAX,
            period: None,
        });
        let config = RedoCommitConfig {
            sync: RedoSyncMode::Instant,
            ..RedoCommitConfig::default()
        };
        let committer = RedoCommitter::new(Arc::clone(&live), service.clone(), config);

        committer.commit(vec![1, 1])?;
        io.fail_syncs.store(1, Ordering::Release);
        assert!(matches!(committer.commit(vec![2, 2, 2]), Err(StoreError::Io(_))));
        assert_eq!(live.lock().len(), 2);
        committer.commit(vec![3])?;

        assert_eq!(std::fs::read(&path)?, vec![1, 1, 3]);
        assert_eq!(service.redo_bytes_since_checkpoint(), 3);
        Ok(())
    }

    #[test]
    fn periodic_mode_defers_sync() -> Result<()> {
        let dir = tempdir().unwrap();
        let (committer, _service, live) = committer(dir.path(), RedoSyncMode::Periodic)?;
        committer.commit(vec![9; 16])?;
        assert!(live.lock().has_unsynced());
        Ok(())
    }
}
