//! Single-key write operations and their queued form.

use std::sync::Arc;

use super::codecs::{KeyCodec, ValCodec};
use super::page::Page;
use super::tree::{Attempt, BTree};
use crate::storage::handler::{HandlerContext, OpListener, PageOperation, PageOperationResult};
use crate::types::{Result, StoreError};

/// Predicate over the current value of a key.
pub type ValuePredicate<V> = Box<dyn Fn(&V) -> bool + Send>;

/// Callback run under the leaf lock with the current value of a key. Returning
/// `Some(v)` stores `v`; `None` leaves the leaf unchanged.
pub type ComputeFn<V> = Box<dyn FnOnce(Option<&V>) -> Result<Option<V>> + Send>;

/// Completion callback of an asynchronous operation. Runs exactly once, on a
/// handler thread, when submission succeeded.
pub type OpCallback<T> = Box<dyn FnOnce(&HandlerContext, Result<T>) + Send>;

/// A mutation of one key.
pub enum WriteOp<K, V> {
    /// Inserts or overwrites.
    Put { key: K, value: V },
    /// Inserts only when the key is absent.
    PutIfAbsent { key: K, value: V },
    /// Overwrites when the key is present and its value passes `matches`.
    Replace {
        key: K,
        matches: ValuePredicate<V>,
        value: V,
    },
    /// Inserts under a key drawn from the map's sequence. Built by
    /// [`BTree::append`], which allocates the key.
    Append { key: K, value: V },
    /// Deletes the key when present and `condition` (if any) passes.
    /// `adjust_size == false` removes without changing the map size.
    Remove {
        key: K,
        condition: Option<ValuePredicate<V>>,
        adjust_size: bool,
    },
    /// Reads and optionally writes the key under the leaf lock.
    Compute { key: K, f: Option<ComputeFn<V>> },
}

/// Result of a completed [`WriteOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput<K, V> {
    /// Value present before the operation (`Put`, `PutIfAbsent`, `Remove`,
    /// `Compute`).
    Previous(Option<V>),
    /// Whether `Replace` stored its value.
    Replaced(bool),
    /// Key assigned by `Append`.
    Appended(K),
}

impl<K, V> OpOutput<K, V> {
    pub fn into_previous(self) -> Option<V> {
        match self {
            OpOutput::Previous(prev) => prev,
            OpOutput::Replaced(_) | OpOutput::Appended(_) => None,
        }
    }
}

pub(crate) struct Applied<K, V> {
    pub(crate) page: Option<Page<K, V>>,
    pub(crate) output: OpOutput<K, V>,
    pub(crate) size_delta: i64,
}

impl<K: KeyCodec, V: ValCodec> WriteOp<K, V> {
    pub fn key(&self) -> &K {
        match self {
            WriteOp::Put { key, .. }
            | WriteOp::PutIfAbsent { key, .. }
            | WriteOp::Replace { key, .. }
            | WriteOp::Append { key, .. }
            | WriteOp::Remove { key, .. }
            | WriteOp::Compute { key, .. } => key,
        }
    }

    /// Key plus value footprint checked against the payload limit.
    pub(crate) fn payload_size(&self) -> usize {
        let value = match self {
            WriteOp::Put { value, .. }
            | WriteOp::PutIfAbsent { value, .. }
            | WriteOp::Replace { value, .. }
            | WriteOp::Append { value, .. } => V::val_memory(value),
            WriteOp::Remove { .. } | WriteOp::Compute { .. } => 0,
        };
        K::key_memory(self.key()) + value
    }

    /// Computes the effect of the operation on `leaf`. Called once the leaf
    /// is locked and verified; the result is always installed.
    pub(crate) fn apply(&mut self, leaf: &Page<K, V>) -> Result<Applied<K, V>> {
        let found = leaf.binary_search(self.key());
        let unchanged = |output| Applied {
            page: None,
            output,
            size_delta: 0,
        };
        let applied = match (self, found) {
            (WriteOp::Put { value, .. }, Ok(idx)) => Applied {
                page: Some(leaf.leaf_with_value(idx, value.clone())),
                output: OpOutput::Previous(Some(leaf.values()[idx].clone())),
                size_delta: 0,
            },
            (WriteOp::Put { key, value } | WriteOp::PutIfAbsent { key, value }, Err(idx)) => {
                Applied {
                    page: Some(leaf.leaf_with_insert(idx, key.clone(), value.clone())),
                    output: OpOutput::Previous(None),
                    size_delta: 1,
                }
            }
            (WriteOp::PutIfAbsent { .. }, Ok(idx)) => {
                unchanged(OpOutput::Previous(Some(leaf.values()[idx].clone())))
            }
            (WriteOp::Replace { matches, value, .. }, Ok(idx)) => {
                if matches(&leaf.values()[idx]) {
                    Applied {
                        page: Some(leaf.leaf_with_value(idx, value.clone())),
                        output: OpOutput::Replaced(true),
                        size_delta: 0,
                    }
                } else {
                    unchanged(OpOutput::Replaced(false))
                }
            }
            (WriteOp::Replace { .. }, Err(_)) => unchanged(OpOutput::Replaced(false)),
            (WriteOp::Append { key, value }, Err(idx)) => Applied {
                page: Some(leaf.leaf_with_insert(idx, key.clone(), value.clone())),
                output: OpOutput::Appended(key.clone()),
                size_delta: 1,
            },
            (WriteOp::Append { .. }, Ok(_)) => {
                return Err(StoreError::Invalid("appended key already present"))
            }
            (
                WriteOp::Remove {
                    condition,
                    adjust_size,
                    ..
                },
                Ok(idx),
            ) => {
                let current = &leaf.values()[idx];
                if condition.as_ref().map_or(true, |pred| pred(current)) {
                    Applied {
                        page: Some(leaf.leaf_without(idx)),
                        output: OpOutput::Previous(Some(current.clone())),
                        size_delta: if *adjust_size { -1 } else { 0 },
                    }
                } else {
                    unchanged(OpOutput::Previous(Some(current.clone())))
                }
            }
            (WriteOp::Remove { .. }, Err(_)) => unchanged(OpOutput::Previous(None)),
            (WriteOp::Compute { key, f }, found) => {
                let f = f
                    .take()
                    .ok_or(StoreError::Invalid("compute operation already applied"))?;
                let current = found.ok().map(|idx| &leaf.values()[idx]);
                let previous = current.cloned();
                match (f(current)?, found) {
                    (None, _) => unchanged(OpOutput::Previous(previous)),
                    (Some(value), Ok(idx)) => Applied {
                        page: Some(leaf.leaf_with_value(idx, value)),
                        output: OpOutput::Previous(previous),
                        size_delta: 0,
                    },
                    (Some(value), Err(idx)) => Applied {
                        page: Some(leaf.leaf_with_insert(idx, key.clone(), value)),
                        output: OpOutput::Previous(previous),
                        size_delta: 1,
                    },
                }
            }
        };
        Ok(applied)
    }
}

pub(crate) enum Completion<T> {
    Listener(Arc<OpListener<T>>),
    Callback(OpCallback<T>),
}

impl<T> Completion<T> {
    fn complete(self, ctx: &HandlerContext, outcome: Result<T>) {
        match self {
            Completion::Listener(listener) => listener.finish(outcome),
            Completion::Callback(callback) => callback(ctx, outcome),
        }
    }
}

/// A write queued on the handler pool after its first attempt was contended
/// (or, for asynchronous calls, immediately).
pub(crate) struct WriteTask<K: KeyCodec, V: ValCodec> {
    pub(crate) tree: BTree<K, V>,
    pub(crate) op: WriteOp<K, V>,
    pub(crate) done: Option<Completion<OpOutput<K, V>>>,
}

impl<K: KeyCodec, V: ValCodec> WriteTask<K, V> {
    fn finish(&mut self, ctx: &HandlerContext, outcome: Result<OpOutput<K, V>>) {
        if let Some(done) = self.done.take() {
            done.complete(ctx, outcome);
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PageOperation for WriteTask<K, V> {
    fn run(&mut self, ctx: &HandlerContext) -> PageOperationResult {
        match self.tree.attempt(ctx, &mut self.op) {
            Ok(Attempt::Done(output)) => {
                self.finish(ctx, Ok(output));
                PageOperationResult::Succeeded
            }
            Ok(Attempt::Retry(holder)) => PageOperationResult::Retry { holder },
            Err(err) => {
                self.finish(ctx, Err(err));
                PageOperationResult::Succeeded
            }
        }
    }

    fn fail(mut self: Box<Self>, err: StoreError) {
        self.finish(&HandlerContext::current(), Err(err));
    }
}
