#![forbid(unsafe_code)]
//! Page-operation handlers.
//!
//! A write first runs on the calling thread. When it hits a page reference
//! locked by someone else it is boxed as a [`PageOperation`] and queued on the
//! handler that holds the lock, so contended writes to the same leaf serialize
//! on one thread instead of spinning. Handlers are identified by
//! [`HandlerId`]: pool threads use `1..=N`, calling threads draw ids from a
//! process-wide counter above the pool range.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::types::{HandlerId, Result, StoreError};

const FIRST_CALLER_ID: u32 = 1 << 16;
const MAX_POOL_THREADS: usize = (FIRST_CALLER_ID - 1) as usize;

static NEXT_CALLER_ID: AtomicU32 = AtomicU32::new(FIRST_CALLER_ID);

thread_local! {
    static CALLER_ID: Cell<u32> = const { Cell::new(0) };
}

/// Identity of the thread executing a page operation.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    id: HandlerId,
    pool_handler: bool,
}

impl HandlerContext {
    /// Context of the current (non-pool) thread. The id is stable for the
    /// lifetime of the thread.
    pub fn current() -> Self {
        let id = CALLER_ID.with(|slot| {
            let mut id = slot.get();
            if id == 0 {
                id = NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed);
                slot.set(id);
            }
            id
        });
        Self {
            id: HandlerId(id),
            pool_handler: false,
        }
    }

    fn pool(index: usize) -> Self {
        Self {
            id: HandlerId(index as u32 + 1),
            pool_handler: true,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// True on a handler-pool thread.
    pub fn is_pool_handler(&self) -> bool {
        self.pool_handler
    }
}

/// Outcome of one attempt at a page operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOperationResult {
    /// Completed; the operation has delivered its result.
    Succeeded,
    /// A page reference was contended or the tree shape changed under the
    /// attempt. `holder` names the handler owning the contended lock.
    Retry { holder: Option<HandlerId> },
}

/// A queued unit of work that can be attempted repeatedly.
pub trait PageOperation: Send {
    /// Attempts the operation. Errors are delivered by the operation itself
    /// and reported as `Succeeded`.
    fn run(&mut self, ctx: &HandlerContext) -> PageOperationResult;

    /// Completes the operation with `err` without running it.
    fn fail(self: Box<Self>, err: StoreError);
}

struct HandlerQueue {
    ops: Mutex<VecDeque<Box<dyn PageOperation>>>,
    ready: Condvar,
}

struct PoolInner {
    queues: Vec<HandlerQueue>,
    next: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn queue_index(&self, affinity: Option<HandlerId>) -> usize {
        match affinity {
            Some(HandlerId(id)) if id >= 1 && (id as usize) <= self.queues.len() => id as usize - 1,
            _ => self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
        }
    }

    fn push(&self, index: usize, op: Box<dyn PageOperation>) -> usize {
        let queue = &self.queues[index];
        let mut ops = queue.ops.lock();
        ops.push_back(op);
        let depth = ops.len();
        queue.ready.notify_one();
        depth
    }
}

/// Fixed set of handler threads, one operation queue each.
pub struct PageOperationHandlerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PageOperationHandlerPool {
    /// Spawns `threads` handler threads.
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        if threads == 0 || threads > MAX_POOL_THREADS {
            return Err(StoreError::Config(format!(
                "handler pool size {threads} out of range"
            )));
        }
        let inner = Arc::new(PoolInner {
            queues: (0..threads)
                .map(|_| HandlerQueue {
                    ops: Mutex::new(VecDeque::new()),
                    ready: Condvar::new(),
                })
                .collect(),
            next: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("aostore-handler-{}", index + 1))
                .spawn(move || worker_loop(inner, index))?;
            handles.push(handle);
        }
        debug!(threads, "handler.pool.started");
        Ok(Arc::new(Self {
            inner,
            threads: Mutex::new(handles),
        }))
    }

    pub fn size(&self) -> usize {
        self.inner.queues.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Queues `op` on the handler named by `affinity` when it belongs to this
    /// pool, otherwise on the next handler in round-robin order.
    ///
    /// After shutdown the operation is dropped without being failed and
    /// [`StoreError::Shutdown`] is returned.
    pub fn submit(&self, op: Box<dyn PageOperation>, affinity: Option<HandlerId>) -> Result<()> {
        let index = self.inner.queue_index(affinity);
        let queue = &self.inner.queues[index];
        let mut ops = queue.ops.lock();
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(StoreError::Shutdown);
        }
        ops.push_back(op);
        trace!(handler = index + 1, depth = ops.len(), "handler.submit");
        queue.ready.notify_one();
        Ok(())
    }

    /// Stops the handler threads and fails every queued operation with
    /// [`StoreError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.inner.queues {
            let _guard = queue.ops.lock();
            queue.ready.notify_all();
        }
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        let mut failed = 0usize;
        for queue in &self.inner.queues {
            let drained: Vec<_> = queue.ops.lock().drain(..).collect();
            failed += drained.len();
            for op in drained {
                op.fail(StoreError::Shutdown);
            }
        }
        debug!(failed, "handler.pool.shutdown");
    }
}

impl Drop for PageOperationHandlerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, index: usize) {
    let ctx = HandlerContext::pool(index);
    let queue = &inner.queues[index];
    loop {
        let mut op = {
            let mut ops = queue.ops.lock();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(op) = ops.pop_front() {
                    break op;
                }
                queue.ready.wait(&mut ops);
            }
        };
        match op.run(&ctx) {
            PageOperationResult::Succeeded => {}
            PageOperationResult::Retry { holder } => {
                let target = match holder {
                    Some(HandlerId(id)) if id >= 1 && (id as usize) <= inner.queues.len() => {
                        id as usize - 1
                    }
                    _ => index,
                };
                let depth = inner.push(target, op);
                trace!(
                    handler = index + 1,
                    target = target + 1,
                    "handler.retry.rerouted"
                );
                if target == index && depth == 1 {
                    thread::yield_now();
                }
            }
        }
    }
}

/// One-shot completion slot a synchronous caller blocks on.
pub(crate) struct OpListener<T> {
    result: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> OpListener<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Stores the outcome; later calls are ignored.
    pub(crate) fn finish(&self, outcome: Result<T>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> Result<T> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }
}
