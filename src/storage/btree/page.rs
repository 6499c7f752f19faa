//! In-memory pages and the reference cells that link them.
//!
//! A published [`Page`] is never mutated: every change builds a new page and
//! swaps it into the owning [`PageRef`]. Internal pages own the references of
//! their children; there are no parent back-pointers. Writers verify the
//! parent/child link after locking instead.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::codecs::{KeyCodec, ValCodec};
use crate::primitives::bytes::{var, ReadBuffer};
use crate::types::{HandlerId, PagePos, Result, StoreError};

/// Fixed overhead charged to every page in memory accounting.
pub(crate) const PAGE_MEMORY: usize = 128;
/// Overhead charged per child reference of an internal page.
pub(crate) const PAGE_REF_MEMORY: usize = 32;

const KIND_LEAF: u8 = 0;
const KIND_NODE: u8 = 1;
const REMOVED_BIT: u64 = 1 << 63;

pub(crate) enum PageBody<K, V> {
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
    },
    /// `children.len() == keys.len() + 1`; child `i + 1` holds keys `>= keys[i]`.
    Node {
        keys: Vec<K>,
        children: Vec<Arc<PageRef<K, V>>>,
    },
}

/// An immutable leaf or internal page.
pub struct Page<K, V> {
    body: PageBody<K, V>,
    memory: usize,
    /// Index + 1 of the last successful search; 0 when unset.
    cached_compare: AtomicUsize,
    /// Persisted position, with [`REMOVED_BIT`] once the page left the tree.
    pos_state: AtomicU64,
}

/// Result of recording the chunk position a page was just written to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PosAssignment {
    /// The page is live; `previous` is the record it supersedes, if any.
    Assigned { previous: Option<PagePos> },
    /// The page was replaced while being written; the new record is garbage.
    Obsolete,
}

impl<K: KeyCodec, V: ValCodec> Page<K, V> {
    pub(crate) fn leaf(keys: Vec<K>, values: Vec<V>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(K::key_memory).sum::<usize>()
            + values.iter().map(V::val_memory).sum::<usize>();
        Self::with_body(PageBody::Leaf { keys, values }, memory)
    }

    pub(crate) fn node(keys: Vec<K>, children: Vec<Arc<PageRef<K, V>>>) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let memory = PAGE_MEMORY
            + keys.iter().map(K::key_memory).sum::<usize>()
            + children.len() * PAGE_REF_MEMORY;
        Self::with_body(PageBody::Node { keys, children }, memory)
    }

    pub(crate) fn empty_leaf() -> Self {
        Self::leaf(Vec::new(), Vec::new())
    }

    fn with_body(body: PageBody<K, V>, memory: usize) -> Self {
        Self {
            body,
            memory,
            cached_compare: AtomicUsize::new(0),
            pos_state: AtomicU64::new(0),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, PageBody::Leaf { .. })
    }

    pub fn keys(&self) -> &[K] {
        match &self.body {
            PageBody::Leaf { keys, .. } | PageBody::Node { keys, .. } => keys,
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys().len()
    }

    /// Leaf values; empty for internal pages.
    pub fn values(&self) -> &[V] {
        match &self.body {
            PageBody::Leaf { values, .. } => values,
            PageBody::Node { .. } => &[],
        }
    }

    /// Child references; empty for leaves.
    pub(crate) fn children(&self) -> &[Arc<PageRef<K, V>>] {
        match &self.body {
            PageBody::Node { children, .. } => children,
            PageBody::Leaf { .. } => &[],
        }
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn pos(&self) -> PagePos {
        PagePos(self.pos_state.load(Ordering::Acquire) & !REMOVED_BIT)
    }

    pub fn is_removed(&self) -> bool {
        self.pos_state.load(Ordering::Acquire) & REMOVED_BIT != 0
    }

    /// Binary search seeded with the cached pivot of the previous hit.
    pub(crate) fn binary_search(&self, key: &K) -> std::result::Result<usize, usize> {
        let keys = self.keys();
        let mut low = 0usize;
        let mut high = keys.len();
        let hint = self.cached_compare.load(Ordering::Relaxed);
        let mut mid = if hint > 0 && hint <= high {
            hint - 1
        } else {
            high / 2
        };
        while low < high {
            match keys[mid].cmp(key) {
                std::cmp::Ordering::Equal => {
                    self.cached_compare.store(mid + 1, Ordering::Relaxed);
                    return Ok(mid);
                }
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
            mid = low + (high - low) / 2;
        }
        Err(low)
    }

    /// Index of the child that owns `key`.
    pub(crate) fn child_index(&self, key: &K) -> usize {
        match self.binary_search(key) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    pub(crate) fn needs_split(&self, split_size: usize) -> bool {
        self.memory > split_size && self.key_count() > 1
    }

    pub(crate) fn leaf_with_value(&self, idx: usize, value: V) -> Self {
        let mut values = self.values().to_vec();
        values[idx] = value;
        Self::leaf(self.keys().to_vec(), values)
    }

    pub(crate) fn leaf_with_insert(&self, idx: usize, key: K, value: V) -> Self {
        let mut keys = Vec::with_capacity(self.key_count() + 1);
        keys.extend_from_slice(&self.keys()[..idx]);
        keys.push(key);
        keys.extend_from_slice(&self.keys()[idx..]);
        let mut values = Vec::with_capacity(keys.len());
        values.extend_from_slice(&self.values()[..idx]);
        values.push(value);
        values.extend_from_slice(&self.values()[idx..]);
        Self::leaf(keys, values)
    }

    pub(crate) fn leaf_without(&self, idx: usize) -> Self {
        let mut keys = self.keys().to_vec();
        let mut values = self.values().to_vec();
        keys.remove(idx);
        values.remove(idx);
        Self::leaf(keys, values)
    }

    /// Splits a page in two and returns `(separator, left, right)`.
    pub(crate) fn split(&self) -> (K, Self, Self) {
        match &self.body {
            PageBody::Leaf { keys, values } => {
                let mid = keys.len() / 2;
                let left = Self::leaf(keys[..mid].to_vec(), values[..mid].to_vec());
                let right = Self::leaf(keys[mid..].to_vec(), values[mid..].to_vec());
                (keys[mid].clone(), left, right)
            }
            PageBody::Node { keys, children } => {
                let mid = keys.len() / 2;
                let left = Self::node(keys[..mid].to_vec(), children[..=mid].to_vec());
                let right = Self::node(keys[mid + 1..].to_vec(), children[mid + 1..].to_vec());
                (keys[mid].clone(), left, right)
            }
        }
    }

    /// Internal page with `right` inserted after child `idx`, separated by `sep`.
    pub(crate) fn node_with_split_child(
        &self,
        idx: usize,
        sep: K,
        right: Arc<PageRef<K, V>>,
    ) -> Self {
        let mut keys = self.keys().to_vec();
        let mut children = self.children().to_vec();
        keys.insert(idx, sep);
        children.insert(idx + 1, right);
        Self::node(keys, children)
    }

    /// Internal page with child `idx` unlinked. The caller guarantees at
    /// least two children.
    pub(crate) fn node_without_child(&self, idx: usize) -> Self {
        let mut keys = self.keys().to_vec();
        let mut children = self.children().to_vec();
        children.remove(idx);
        keys.remove(idx.saturating_sub(1));
        Self::node(keys, children)
    }

    /// Marks the page as no longer reachable.
    ///
    /// Returns the persisted position whose record just became garbage, or
    /// `None` when the page was never written (it is then flagged
    /// removed-in-memory so a concurrent writer reports its record instead).
    pub(crate) fn mark_removed(&self) -> Option<PagePos> {
        let mut cur = self.pos_state.load(Ordering::Acquire);
        loop {
            if cur & REMOVED_BIT != 0 {
                return None;
            }
            match self.pos_state.compare_exchange_weak(
                cur,
                cur | REMOVED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (cur != 0).then_some(PagePos(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Records that the page now lives at `pos`.
    pub(crate) fn assign_pos(&self, pos: PagePos) -> PosAssignment {
        let mut cur = self.pos_state.load(Ordering::Acquire);
        loop {
            if cur & REMOVED_BIT != 0 {
                return PosAssignment::Obsolete;
            }
            match self.pos_state.compare_exchange_weak(
                cur,
                pos.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return PosAssignment::Assigned {
                        previous: (cur != 0).then_some(PagePos(cur)),
                    }
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Serializes the page. `child_positions` must hold one entry per child
    /// for internal pages and be empty for leaves.
    pub(crate) fn encode(&self, child_positions: &[PagePos], out: &mut Vec<u8>) {
        match &self.body {
            PageBody::Leaf { keys, values } => {
                out.push(KIND_LEAF);
                let kept: Vec<usize> = (0..keys.len())
                    .filter(|&i| V::is_persistent(&values[i]))
                    .collect();
                var::encode_u64(kept.len() as u64, out);
                for &i in &kept {
                    K::encode_key(&keys[i], out);
                }
                for &i in &kept {
                    V::encode_val(&values[i], out);
                }
            }
            PageBody::Node { keys, .. } => {
                debug_assert_eq!(child_positions.len(), keys.len() + 1);
                out.push(KIND_NODE);
                var::encode_u64(keys.len() as u64, out);
                for key in keys {
                    K::encode_key(key, out);
                }
                for pos in child_positions {
                    out.extend_from_slice(&pos.0.to_be_bytes());
                }
            }
        }
    }

    /// Rebuilds a page read back from `pos`. Children come back unloaded.
    pub(crate) fn decode(body: &[u8], pos: PagePos) -> Result<Self> {
        let mut src = ReadBuffer::new(body);
        let kind = src.get_u8()?;
        let count = usize::try_from(src.get_var_u64()?)
            .map_err(|_| StoreError::Corruption("page key count overflow"))?;
        if count > body.len() {
            return Err(StoreError::Corruption("page key count exceeds record"));
        }
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(K::decode_key(&mut src)?);
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StoreError::Corruption("page keys out of order"));
        }
        let page = match kind {
            KIND_LEAF => {
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(V::decode_val(&mut src)?);
                }
                Self::leaf(keys, values)
            }
            KIND_NODE => {
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    let child = PagePos(src.get_u64()?);
                    if !child.is_persisted() {
                        return Err(StoreError::Corruption("internal page references unsaved child"));
                    }
                    children.push(PageRef::unloaded(child));
                }
                Self::node(keys, children)
            }
            _ => return Err(StoreError::Corruption("unknown page kind")),
        };
        if !src.is_empty() {
            return Err(StoreError::Corruption("trailing bytes after page"));
        }
        page.pos_state.store(pos.0, Ordering::Release);
        Ok(page)
    }
}

pub(crate) enum RefState<K, V> {
    Loaded(Arc<Page<K, V>>),
    Unloaded(PagePos),
}

/// Indirection cell through which a page is reached.
///
/// Replacing the page in a reference is the only way the tree changes. A
/// reference is locked by at most one handler at a time while a write is
/// applied through it.
pub struct PageRef<K, V> {
    state: RwLock<RefState<K, V>>,
    locker: AtomicU32,
    dirty: AtomicBool,
    root: bool,
}

impl<K, V> PageRef<K, V> {
    pub(crate) fn new(page: Arc<Page<K, V>>) -> Arc<Self> {
        Arc::new(Self::build(RefState::Loaded(page), false))
    }

    pub(crate) fn unloaded(pos: PagePos) -> Arc<Self> {
        Arc::new(Self::build(RefState::Unloaded(pos), false))
    }

    pub(crate) fn new_root(state: RefState<K, V>) -> Arc<Self> {
        Arc::new(Self::build(state, true))
    }

    fn build(state: RefState<K, V>, root: bool) -> Self {
        Self {
            state: RwLock::new(state),
            locker: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            root,
        }
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn loaded(&self) -> Option<Arc<Page<K, V>>> {
        match &*self.state.read() {
            RefState::Loaded(page) => Some(Arc::clone(page)),
            RefState::Unloaded(_) => None,
        }
    }

    /// Current target of the reference.
    pub(crate) fn snapshot(&self) -> RefState<K, V> {
        match &*self.state.read() {
            RefState::Loaded(page) => RefState::Loaded(Arc::clone(page)),
            RefState::Unloaded(pos) => RefState::Unloaded(*pos),
        }
    }

    pub(crate) fn unloaded_pos(&self) -> Option<PagePos> {
        match &*self.state.read() {
            RefState::Loaded(_) => None,
            RefState::Unloaded(pos) => Some(*pos),
        }
    }

    /// Installs a freshly loaded page if the reference still points at `pos`.
    ///
    /// Returns the page the reference holds afterwards and whether `page` was
    /// the one installed, or `None` when the reference moved on to another
    /// position and the load must be retried.
    pub(crate) fn install_loaded(
        &self,
        pos: PagePos,
        page: Arc<Page<K, V>>,
    ) -> Option<(Arc<Page<K, V>>, bool)> {
        let mut state = self.state.write();
        match &*state {
            RefState::Loaded(current) => Some((Arc::clone(current), false)),
            RefState::Unloaded(current) if *current == pos => {
                *state = RefState::Loaded(Arc::clone(&page));
                Some((page, true))
            }
            RefState::Unloaded(_) => None,
        }
    }

    /// Swaps in `page` and returns what the reference held before.
    pub(crate) fn replace(&self, page: Arc<Page<K, V>>) -> RefState<K, V> {
        std::mem::replace(&mut *self.state.write(), RefState::Loaded(page))
    }

    /// Drops the in-memory page if it is still `expected`, is persisted,
    /// passes `can_evict`, and nobody holds the reference lock.
    ///
    /// The lock word is checked under the state write lock. A writer locks
    /// first and reads the state second, so it either blocks eviction or
    /// observes the unloaded state and reloads.
    pub(crate) fn evict(
        &self,
        expected: &Arc<Page<K, V>>,
        can_evict: impl FnOnce(&Page<K, V>) -> bool,
    ) -> bool {
        let mut state = self.state.write();
        if self.locker.load(Ordering::SeqCst) != 0 || self.dirty.load(Ordering::SeqCst) {
            return false;
        }
        let pos = match &*state {
            RefState::Loaded(current) if Arc::ptr_eq(current, expected) => {
                if !can_evict(current) {
                    return false;
                }
                let pos = current.pos_state.load(Ordering::Acquire);
                if pos == 0 || pos & REMOVED_BIT != 0 {
                    return false;
                }
                PagePos(pos)
            }
            _ => return false,
        };
        *state = RefState::Unloaded(pos);
        true
    }

    /// Tries to take the reference lock for `owner`; on failure returns the
    /// current holder.
    pub(crate) fn try_lock(&self, owner: HandlerId) -> std::result::Result<(), HandlerId> {
        match self
            .locker
            .compare_exchange(0, owner.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(holder) => Err(HandlerId(holder)),
        }
    }

    pub(crate) fn unlock(&self, owner: HandlerId) {
        let _ = self
            .locker
            .compare_exchange(owner.0, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn holder(&self) -> Option<HandlerId> {
        match self.locker.load(Ordering::Acquire) {
            0 => None,
            id => Some(HandlerId(id)),
        }
    }

    /// Flags the page for rewrite at the next save even though it was not
    /// replaced (a value cell inside it changed in place).
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Lock on a [`PageRef`] released on drop.
pub(crate) struct RefLock<K, V> {
    target: Arc<PageRef<K, V>>,
    owner: HandlerId,
}

impl<K, V> RefLock<K, V> {
    pub(crate) fn acquire(
        target: &Arc<PageRef<K, V>>,
        owner: HandlerId,
    ) -> std::result::Result<Self, HandlerId> {
        target.try_lock(owner)?;
        Ok(Self {
            target: Arc::clone(target),
            owner,
        })
    }

    pub(crate) fn target(&self) -> &Arc<PageRef<K, V>> {
        &self.target
    }
}

impl<K, V> Drop for RefLock<K, V> {
    fn drop(&mut self) {
        self.target.unlock(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[u64]) -> Page<u64, u64> {
        Page::leaf(keys.to_vec(), keys.iter().map(|k| k * 10).collect())
    }

    #[test]
    fn binary_search_matches_std() {
        let page = leaf(&[1, 3, 5, 7, 9]);
        for needle in 0..11u64 {
            assert_eq!(
                page.binary_search(&needle),
                page.keys().binary_search(&needle),
                "needle {needle}"
            );
        }
        assert!(page.binary_search(&7).is_ok());
        assert_eq!(page.binary_search(&6), Err(3));
    }

    #[test]
    fn child_index_routes_equal_keys_right() {
        let children = (0..3)
            .map(|_| PageRef::new(Arc::new(Page::<u64, u64>::empty_leaf())))
            .collect();
        let node = Page::node(vec![10, 20], children);
        assert_eq!(node.child_index(&5), 0);
        assert_eq!(node.child_index(&10), 1);
        assert_eq!(node.child_index(&19), 1);
        assert_eq!(node.child_index(&20), 2);
    }

    #[test]
    fn split_preserves_order() {
        let page = leaf(&[1, 2, 3, 4, 5]);
        let (sep, left, right) = page.split();
        assert_eq!(sep, 3);
        assert_eq!(left.keys(), &[1, 2]);
        assert_eq!(right.keys(), &[3, 4, 5]);
        assert_eq!(right.values(), &[30, 40, 50]);
    }

    #[test]
    fn removed_in_memory_then_assigned_is_obsolete() {
        let page = leaf(&[1]);
        assert_eq!(page.mark_removed(), None);
        assert!(page.is_removed());
        assert_eq!(
            page.assign_pos(PagePos(42 << 32)),
            PosAssignment::Obsolete
        );
    }

    #[test]
    fn persisted_then_removed_reports_position_once() {
        let page = leaf(&[1]);
        let pos = PagePos((3 << 32) | 64);
        assert_eq!(
            page.assign_pos(pos),
            PosAssignment::Assigned { previous: None }
        );
        assert_eq!(page.mark_removed(), Some(pos));
        assert_eq!(page.mark_removed(), None);
        assert_eq!(page.pos(), pos);
    }

    #[test]
    fn encode_decode_leaf() -> Result<()> {
        let page = leaf(&[2, 4, 6]);
        let mut buf = Vec::new();
        page.encode(&[], &mut buf);
        let pos = PagePos((1 << 32) | 8);
        let decoded = Page::<u64, u64>::decode(&buf, pos)?;
        assert!(decoded.is_leaf());
        assert_eq!(decoded.keys(), page.keys());
        assert_eq!(decoded.values(), page.values());
        assert_eq!(decoded.pos(), pos);
        Ok(())
    }

    #[test]
    fn decode_rejects_unordered_keys() {
        let page = Page::<u64, u64>::leaf(vec![5, 1], vec![0, 0]);
        let mut buf = Vec::new();
        page.encode(&[], &mut buf);
        assert!(Page::<u64, u64>::decode(&buf, PagePos(1 << 32)).is_err());
    }

    #[test]
    fn ref_lock_is_exclusive() {
        let r = PageRef::new(Arc::new(Page::<u64, u64>::empty_leaf()));
        let guard = RefLock::acquire(&r, HandlerId(1)).unwrap();
        assert_eq!(RefLock::acquire(&r, HandlerId(2)).err(), Some(HandlerId(1)));
        assert_eq!(r.holder(), Some(HandlerId(1)));
        drop(guard);
        assert_eq!(r.holder(), None);
        assert!(RefLock::acquire(&r, HandlerId(2)).is_ok());
    }

    #[test]
    fn evict_requires_persisted_page() {
        let page = Arc::new(leaf(&[1]));
        let r = PageRef::new(Arc::clone(&page));
        assert!(!r.evict(&page, |_| true));
        page.assign_pos(PagePos(1 << 32));
        assert!(!r.evict(&page, |_| false));
        assert!(r.evict(&page, |_| true));
        assert_eq!(r.unloaded_pos(), Some(PagePos(1 << 32)));
    }
}
