//! Point writes: the attempt protocol, the synchronous and asynchronous
//! entry points, and the convenience wrappers built on them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{trace, warn};

use super::{Attempt, BTree};
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::ops::{Completion, OpCallback, OpOutput, ValuePredicate, WriteOp, WriteTask};
use crate::storage::btree::page::RefLock;
use crate::storage::handler::{HandlerContext, OpListener};
use crate::types::{Result, StoreError};

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// One attempt at `op` on behalf of `ctx`.
    ///
    /// Locks the owning leaf, re-descends to verify the leaf is still the one
    /// owning the key, applies the operation and then splits or unlinks the
    /// leaf as needed. Lock conflicts and stale paths come back as
    /// [`Attempt::Retry`].
    pub(crate) fn attempt(
        &self,
        ctx: &HandlerContext,
        op: &mut WriteOp<K, V>,
    ) -> Result<Attempt<OpOutput<K, V>>> {
        let inner = &*self.inner;
        let _shared = inner.map_lock.read();
        inner.check_write()?;
        let key = op.key().clone();
        let (leaf_ref, _) = inner.find_leaf(&key)?;
        let lock = match RefLock::acquire(&leaf_ref, ctx.id()) {
            Ok(lock) => lock,
            Err(holder) => {
                inner.stats.add_lock_conflicts(1);
                return Ok(Attempt::Retry(Some(holder)));
            }
        };
        let (current, leaf) = inner.find_leaf(&key)?;
        if !Arc::ptr_eq(&current, &leaf_ref) {
            trace!(map = %inner.name, "btree.write.stale_leaf");
            return Ok(Attempt::Retry(None));
        }
        let applied = op.apply(&leaf)?;
        if let Some(page) = applied.page {
            let page = Arc::new(page);
            inner.install(lock.target(), Arc::clone(&page));
            inner.adjust_size(applied.size_delta);
            if let Some(seq) = K::to_sequence(&key) {
                inner.max_seq.fetch_max(seq, Ordering::AcqRel);
            }
            let maintenance = if page.needs_split(inner.options.page_split_size) {
                inner.split(ctx, lock.target(), page, &key)
            } else if page.key_count() == 0 && !leaf_ref.is_root() {
                inner.unlink_empty_leaf(ctx, lock.target(), &key)
            } else {
                Ok(())
            };
            if let Err(err) = maintenance {
                // the write is installed; the leaf is split or unlinked by a later write
                inner.stats.add_maintenance_failures(1);
                warn!(map = %inner.name, error = %err, "btree.write.maintenance_failed");
            }
        }
        Ok(Attempt::Done(applied.output))
    }

    fn check_payload(&self, op: &WriteOp<K, V>) -> Result<()> {
        let size = op.payload_size();
        let limit = self.inner.options.max_payload_size;
        if size > limit {
            return Err(StoreError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    /// Runs `op` and blocks until it completes.
    ///
    /// The first attempt runs on the calling thread. A contended attempt is
    /// handed to the pool handler holding the lock; pool handlers calling
    /// this retry in place instead of queueing behind themselves.
    pub fn execute(&self, ctx: &HandlerContext, mut op: WriteOp<K, V>) -> Result<OpOutput<K, V>> {
        self.check_payload(&op)?;
        let holder = match self.attempt(ctx, &mut op)? {
            Attempt::Done(output) => {
                self.inner.stats.add_fast_path_writes(1);
                return Ok(output);
            }
            Attempt::Retry(holder) => holder,
        };
        self.inner.stats.add_retried_writes(1);
        if ctx.is_pool_handler() {
            loop {
                thread::yield_now();
                if let Attempt::Done(output) = self.attempt(ctx, &mut op)? {
                    return Ok(output);
                }
            }
        }
        let listener = OpListener::new();
        let task = WriteTask {
            tree: self.clone(),
            op,
            done: Some(Completion::Listener(Arc::clone(&listener))),
        };
        self.inner.pool.submit(Box::new(task), holder)?;
        listener.wait()
    }

    /// Queues `op` on the handler pool. `callback` runs exactly once on a
    /// handler thread if this returns `Ok`, and never otherwise.
    pub fn execute_async(
        &self,
        op: WriteOp<K, V>,
        callback: OpCallback<OpOutput<K, V>>,
    ) -> Result<()> {
        self.check_payload(&op)?;
        self.inner.check_write()?;
        let task = WriteTask {
            tree: self.clone(),
            op,
            done: Some(Completion::Callback(callback)),
        };
        self.inner.pool.submit(Box::new(task), None)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.execute(&HandlerContext::current(), WriteOp::Put { key, value })
            .map(OpOutput::into_previous)
    }

    /// Stores `value` only if `key` is absent; returns the existing value
    /// otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.execute(&HandlerContext::current(), WriteOp::PutIfAbsent { key, value })
            .map(OpOutput::into_previous)
    }

    /// Overwrites `key` only if its current value equals `expected`.
    pub fn replace(&self, key: K, expected: V, value: V) -> Result<bool>
    where
        V: PartialEq,
    {
        let matches: ValuePredicate<V> = Box::new(move |current: &V| *current == expected);
        match self.execute(
            &HandlerContext::current(),
            WriteOp::Replace {
                key,
                matches,
                value,
            },
        )? {
            OpOutput::Replaced(done) => Ok(done),
            _ => Ok(false),
        }
    }

    /// Inserts `value` under the next key of the map's sequence and returns
    /// that key. Only key types with a sequence mapping support this.
    pub fn append(&self, value: V) -> Result<K> {
        let seq = self.inner.max_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let key = K::from_sequence(seq).ok_or(StoreError::Unsupported(
            "append requires a key type with a sequence mapping",
        ))?;
        match self.execute(&HandlerContext::current(), WriteOp::Append { key, value })? {
            OpOutput::Appended(key) => Ok(key),
            _ => Err(StoreError::Invalid("append produced no key")),
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: K) -> Result<Option<V>> {
        self.remove_if(key, None, true)
    }

    /// Removes `key` when `condition` (if any) accepts its value. With
    /// `adjust_size == false` the size counter is left unchanged, for entries
    /// that were already subtracted when they became tombstones.
    pub fn remove_if(
        &self,
        key: K,
        condition: Option<ValuePredicate<V>>,
        adjust_size: bool,
    ) -> Result<Option<V>> {
        self.execute(
            &HandlerContext::current(),
            WriteOp::Remove {
                key,
                condition,
                adjust_size,
            },
        )
        .map(OpOutput::into_previous)
    }

    /// Asynchronous [`BTree::put`].
    pub fn put_async(&self, key: K, value: V, callback: OpCallback<Option<V>>) -> Result<()> {
        self.execute_async(
            WriteOp::Put { key, value },
            Box::new(move |ctx, result| callback(ctx, result.map(OpOutput::into_previous))),
        )
    }

    /// Asynchronous [`BTree::remove`].
    pub fn remove_async(&self, key: K, callback: OpCallback<Option<V>>) -> Result<()> {
        self.execute_async(
            WriteOp::Remove {
                key,
                condition: None,
                adjust_size: true,
            },
            Box::new(move |ctx, result| callback(ctx, result.map(OpOutput::into_previous))),
        )
    }

    /// Adds one to the size without a structural change.
    pub fn increment_size(&self) {
        self.inner.adjust_size(1);
    }

    /// Subtracts one from the size without a structural change.
    pub fn decrement_size(&self) {
        self.inner.adjust_size(-1);
    }

    /// Runs `f`, which changes state shared with the value stored under
    /// `key`, while saves are held off, then flags the owning leaf dirty.
    /// A save therefore sees either none or all of the change, together
    /// with any size adjustment `f` makes.
    pub fn mutate_in_place<R>(&self, key: &K, f: impl FnOnce() -> R) -> Result<R> {
        let inner = &*self.inner;
        let _shared = inner.map_lock.read();
        inner.check_write()?;
        let (leaf_ref, leaf) = inner.find_leaf(key)?;
        let out = f();
        leaf_ref.mark_dirty();
        inner.gc.on_mark_dirty(leaf.memory());
        Ok(out)
    }

    /// Flags the leaf owning `key` for rewrite at the next save.
    pub fn mark_dirty(&self, key: &K) -> Result<()> {
        self.inner.check_write()?;
        let (leaf_ref, leaf) = self.inner.find_leaf(key)?;
        leaf_ref.mark_dirty();
        self.inner.gc.on_mark_dirty(leaf.memory());
        Ok(())
    }
}
