//! Versioned value cell stored in transactional maps.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::primitives::bytes::ReadBuffer;
use crate::storage::btree::ValCodec;
use crate::types::{Result, StoreError, TxId};

const TAG_ABSENT: u8 = 0;
const TAG_PRESENT: u8 = 1;

struct PendingWrite<T> {
    owner: TxId,
    value: Option<T>,
    /// Number of live undo records of `owner` on this cell.
    depth: u32,
}

struct CellState<T> {
    committed: Option<T>,
    pending: Option<PendingWrite<T>>,
}

/// A value plus at most one uncommitted write.
///
/// Clones share the cell, so a page copy made by a concurrent split still
/// sees the commit or rollback applied through the undo log. A cell whose
/// committed value is `None` and that has no pending write is a tombstone;
/// readers treat it as absent.
///
/// Only committed values are persisted: saves leave out cells without one,
/// so tombstones and uncommitted inserts never reach a chunk. A cell with a
/// pending write keeps its leaf resident until the write is resolved.
pub struct TransactionalValue<T> {
    cell: Arc<Mutex<CellState<T>>>,
}

impl<T> Clone for TransactionalValue<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> TransactionalValue<T> {
    fn from_state(committed: Option<T>, pending: Option<PendingWrite<T>>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(CellState { committed, pending })),
        }
    }

    /// A committed value, as produced by redo replay and page loads.
    pub fn committed(value: T) -> Self {
        Self::from_state(Some(value), None)
    }

    pub fn tombstone() -> Self {
        Self::from_state(None, None)
    }

    /// A fresh cell holding an uncommitted insert by `owner`.
    pub fn pending_insert(owner: TxId, value: T) -> Self {
        Self::from_state(
            None,
            Some(PendingWrite {
                owner,
                value: Some(value),
                depth: 1,
            }),
        )
    }

    /// The value `reader` sees: its own pending write if it owns one,
    /// otherwise the committed value.
    pub fn read(&self, reader: Option<TxId>) -> Option<T> {
        let state = self.cell.lock();
        match &state.pending {
            Some(pending) if Some(pending.owner) == reader => pending.value.clone(),
            _ => state.committed.clone(),
        }
    }

    pub fn committed_value(&self) -> Option<T> {
        self.cell.lock().committed.clone()
    }

    /// Most recent value including an uncommitted write.
    pub fn latest(&self) -> Option<T> {
        let state = self.cell.lock();
        match &state.pending {
            Some(pending) => pending.value.clone(),
            None => state.committed.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.cell.lock().pending.is_some()
    }

    pub fn pending_owner(&self) -> Option<TxId> {
        self.cell.lock().pending.as_ref().map(|p| p.owner)
    }

    pub fn is_tombstone(&self) -> bool {
        let state = self.cell.lock();
        state.committed.is_none() && state.pending.is_none()
    }

    /// Write depth of the pending write, zero when there is none.
    pub fn depth(&self) -> u32 {
        self.cell.lock().pending.as_ref().map_or(0, |p| p.depth)
    }

    /// Records `value` as `owner`'s pending write and returns the value
    /// `owner` saw before it. Fails with the current owner when another
    /// transaction holds the pending write.
    pub fn write(&self, owner: TxId, value: Option<T>) -> std::result::Result<Option<T>, TxId> {
        let mut state = self.cell.lock();
        match state.pending.as_mut() {
            Some(pending) if pending.owner != owner => Err(pending.owner),
            Some(pending) => {
                pending.depth += 1;
                Ok(std::mem::replace(&mut pending.value, value))
            }
            None => {
                let old = state.committed.clone();
                state.pending = Some(PendingWrite {
                    owner,
                    value,
                    depth: 1,
                });
                Ok(old)
            }
        }
    }

    /// Publishes the pending write. Later calls are no-ops.
    pub fn commit(&self, is_insert: bool) {
        let mut state = self.cell.lock();
        if let Some(pending) = state.pending.take() {
            trace!(owner = %pending.owner, is_insert, depth = pending.depth, "txn.value.commit");
            state.committed = pending.value;
        }
    }

    /// Undoes the most recent write of the pending owner, restoring `old`
    /// as its pending value when earlier writes of the same owner remain.
    /// A no-op once nothing is pending.
    pub fn rollback(&self, old: Option<T>) {
        let mut state = self.cell.lock();
        let Some(pending) = state.pending.as_mut() else {
            return;
        };
        if pending.depth > 1 {
            pending.depth -= 1;
            pending.value = old;
        } else {
            state.pending = None;
        }
    }

    pub fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: fmt::Debug> fmt::Debug for TransactionalValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.lock();
        let mut s = f.debug_struct("TransactionalValue");
        s.field("committed", &state.committed);
        if let Some(pending) = &state.pending {
            s.field("owner", &pending.owner)
                .field("pending", &pending.value)
                .field("depth", &pending.depth);
        }
        s.finish()
    }
}

impl<T: ValCodec> ValCodec for TransactionalValue<T> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        let state = value.cell.lock();
        match &state.committed {
            Some(v) => {
                out.push(TAG_PRESENT);
                T::encode_val(v, out);
            }
            None => out.push(TAG_ABSENT),
        }
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        match src.get_u8()? {
            TAG_ABSENT => Ok(Self::tombstone()),
            TAG_PRESENT => Ok(Self::committed(T::decode_val(src)?)),
            _ => Err(StoreError::Corruption("invalid transactional value tag")),
        }
    }

    fn val_memory(value: &Self) -> usize {
        let state = value.cell.lock();
        let pending = state
            .pending
            .as_ref()
            .and_then(|p| p.value.as_ref())
            .map_or(0, T::val_memory);
        std::mem::size_of::<Self>()
            + std::mem::size_of::<CellState<T>>()
            + state.committed.as_ref().map_or(0, T::val_memory)
            + pending
    }

    fn can_evict(value: &Self) -> bool {
        !value.is_pending()
    }

    fn is_persistent(value: &Self) -> bool {
        value.cell.lock().committed.is_some()
    }

    fn is_counted(value: &Self) -> bool {
        !value.is_tombstone()
    }
}
