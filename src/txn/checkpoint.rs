//! Checkpoint policy and its optional background worker.
//!
//! The redo log reports appended bytes and chunk rotations through
//! [`CheckpointService`]; [`Checkpointer`] turns those signals plus the dirty
//! memory of the open maps into a decision, and can drive the engine's
//! checkpoint from a dedicated thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::types::{ChunkId, Result};

/// Hooks the redo log calls as it grows.
pub trait CheckpointService: Send + Sync {
    /// `bytes` of redo records were appended to the live chunk.
    fn on_redo_appended(&self, bytes: u64);
    /// The live redo chunk was sealed and `id` started.
    fn on_new_chunk(&self, id: ChunkId);
    /// The next due checkpoint should be skipped.
    fn skip_next_checkpoint(&self);
}

/// Thresholds that make a checkpoint due.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub redo_bytes: u64,
    pub dirty_memory: usize,
    pub period: Option<Duration>,
}

impl CheckpointPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            redo_bytes: config.redo_checkpoint_bytes,
            dirty_memory: config.dirty_memory_threshold,
            period: config.checkpoint_period_ms.map(Duration::from_millis),
        }
    }
}

struct WorkerHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: JoinHandle<()>,
}

/// Default [`CheckpointService`].
pub struct Checkpointer {
    policy: CheckpointPolicy,
    redo_bytes: AtomicU64,
    live_chunk: AtomicU32,
    skip_next: AtomicBool,
    last_checkpoint: Mutex<Instant>,
    checkpoints: AtomicU64,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Checkpointer {
    pub fn new(policy: CheckpointPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            redo_bytes: AtomicU64::new(0),
            live_chunk: AtomicU32::new(0),
            skip_next: AtomicBool::new(false),
            last_checkpoint: Mutex::new(Instant::now()),
            checkpoints: AtomicU64::new(0),
            worker: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    /// Redo bytes appended since the last checkpoint.
    pub fn redo_bytes_since_checkpoint(&self) -> u64 {
        self.redo_bytes.load(Ordering::Acquire)
    }

    pub fn live_chunk(&self) -> ChunkId {
        ChunkId(self.live_chunk.load(Ordering::Acquire))
    }

    pub fn checkpoints_completed(&self) -> u64 {
        self.checkpoints.load(Ordering::Acquire)
    }

    /// Whether any threshold is crossed, given the current dirty memory.
    pub fn is_due(&self, dirty_memory: usize) -> bool {
        if self.redo_bytes_since_checkpoint() >= self.policy.redo_bytes {
            return true;
        }
        if dirty_memory >= self.policy.dirty_memory {
            return true;
        }
        self.policy
            .period
            .is_some_and(|period| self.last_checkpoint.lock().elapsed() >= period)
    }

    /// Like [`Checkpointer::is_due`], but consumes a pending skip request.
    pub fn should_run(&self, dirty_memory: usize) -> bool {
        if !self.is_due(dirty_memory) {
            return false;
        }
        if self.skip_next.swap(false, Ordering::AcqRel) {
            debug!("checkpoint.skipped");
            *self.last_checkpoint.lock() = Instant::now();
            return false;
        }
        true
    }

    /// Resets the counters after a completed checkpoint that sealed
    /// `appended_before` redo bytes.
    pub fn record_checkpoint(&self, appended_before: u64) {
        let _ = self
            .redo_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                Some(bytes.saturating_sub(appended_before))
            });
        *self.last_checkpoint.lock() = Instant::now();
        self.checkpoints.fetch_add(1, Ordering::AcqRel);
    }

    /// Starts a thread that calls `task` once per `period` until
    /// [`Checkpointer::stop_worker`]. Task errors are logged.
    pub fn start_worker<F>(&self, period: Duration, task: F) -> Result<()>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("aostore-checkpoint".into())
            .spawn(move || {
                let (lock, cv) = &*signal;
                loop {
                    {
                        let mut stopped = lock.lock();
                        if !*stopped {
                            cv.wait_for(&mut stopped, period);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if let Err(err) = task() {
                        warn!(error = %err, "checkpoint.worker.failed");
                    }
                }
                debug!("checkpoint.worker.exit");
            })?;
        *slot = Some(WorkerHandle { stop, thread });
        debug!(period_ms = period.as_millis() as u64, "checkpoint.worker.started");
        Ok(())
    }

    /// Stops and joins the background worker, if any.
    pub fn stop_worker(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        {
            let (lock, cv) = &*handle.stop;
            *lock.lock() = true;
            cv.notify_all();
        }
        if handle.thread.thread().id() != thread::current().id() && handle.thread.join().is_err() {
            warn!("checkpoint.worker.panicked");
        }
    }
}

impl CheckpointService for Checkpointer {
    fn on_redo_appended(&self, bytes: u64) {
        self.redo_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn on_new_chunk(&self, id: ChunkId) {
        self.live_chunk.store(id.0, Ordering::Release);
        debug!(chunk = id.0, "checkpoint.redo_chunk_started");
    }

    fn skip_next_checkpoint(&self) {
        self.skip_next.store(true, Ordering::Release);
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn policy() -> CheckpointPolicy {
        CheckpointPolicy {
            redo_bytes: 100,
            dirty_memory: 1_000,
            period: None,
        }
    }

    #[test]
    fn thresholds_make_checkpoint_due() {
        let cp = Checkpointer::new(policy());
        assert!(!cp.is_due(0));
        assert!(cp.is_due(1_000));
        cp.on_redo_appended(60);
        cp.on_redo_appended(50);
        assert!(cp.is_due(0));
        cp.record_checkpoint(110);
        assert!(!cp.is_due(0));
        assert_eq!(cp.checkpoints_completed(), 1);
    }

    #[test]
    fn bytes_appended_during_checkpoint_are_kept() {
        let cp = Checkpointer::new(policy());
        cp.on_redo_appended(80);
        let sealed = cp.redo_bytes_since_checkpoint();
        cp.on_redo_appended(30);
        cp.record_checkpoint(sealed);
        assert_eq!(cp.redo_bytes_since_checkpoint(), 30);
    }

    #[test]
    fn skip_request_is_consumed_once() {
        let cp = Checkpointer::new(policy());
        cp.on_redo_appended(500);
        cp.skip_next_checkpoint();
        assert!(!cp.should_run(0));
        assert!(cp.should_run(0));
    }

    #[test]
    fn period_makes_checkpoint_due() {
        let cp = Checkpointer::new(CheckpointPolicy {
            period: Some(Duration::from_millis(10)),
            ..policy()
        });
        assert!(!cp.is_due(0));
        thread::sleep(Duration::from_millis(20));
        assert!(cp.is_due(0));
    }

    #[test]
    fn tracks_live_chunk() {
        let cp = Checkpointer::new(policy());
        cp.on_new_chunk(ChunkId(7));
        assert_eq!(cp.live_chunk(), ChunkId(7));
    }

    #[test]
    fn worker_runs_until_stopped() -> Result<()> {
        let cp = Checkpointer::new(policy());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        cp.start_worker(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        thread::sleep(Duration::from_millis(60));
        cp.stop_worker();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        Ok(())
    }
}
