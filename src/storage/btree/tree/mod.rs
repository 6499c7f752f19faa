//! The tree handle, its shared state, and the read paths.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::codecs::{KeyCodec, ValCodec};
use super::cursor::Cursor;
use super::gc::BTreeGc;
use super::page::{Page, PageRef, RefState};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use super::storage::BTreeStorage;
use crate::config::MapOptions;
use crate::storage::handler::PageOperationHandlerPool;
use crate::types::{HandlerId, Result, StoreError};

mod maintenance;
mod persist;
mod write;

/// Outcome of one write attempt.
pub(crate) enum Attempt<T> {
    Done(T),
    /// Contended; `Some` names the handler holding the page reference.
    Retry(Option<HandlerId>),
}

/// Concurrent copy-on-write B-tree persisted as append-only chunks.
///
/// `BTree` is a cheap handle; clones share the same tree.
pub struct BTree<K: KeyCodec, V: ValCodec> {
    pub(crate) inner: Arc<TreeInner<K, V>>,
}

impl<K: KeyCodec, V: ValCodec> Clone for BTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct TreeInner<K, V> {
    pub(crate) name: String,
    /// Stable root reference; root changes replace its page.
    pub(crate) root: Arc<PageRef<K, V>>,
    /// Shared by point writes, exclusive for save snapshots, clear and close.
    pub(crate) map_lock: RwLock<()>,
    pub(crate) size: AtomicU64,
    /// Largest sequence key seen, for `append`.
    pub(crate) max_seq: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) options: MapOptions,
    pub(crate) storage: BTreeStorage,
    pub(crate) gc: BTreeGc,
    pub(crate) stats: BTreeStats,
    pub(crate) pool: Arc<PageOperationHandlerPool>,
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// Opens the map stored under `dir`, or creates an empty one.
    pub fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        options: MapOptions,
        pool: Arc<PageOperationHandlerPool>,
    ) -> Result<Self> {
        let name = name.into();
        let storage = if options.in_memory {
            BTreeStorage::in_memory()
        } else {
            BTreeStorage::open(dir.into(), options.read_only)?
        };
        let gc = BTreeGc::new(options.cache_size);
        let (root, size, max_seq) = match storage.last_chunk() {
            Some(last) if last.root_pos.is_persisted() => (
                PageRef::new_root(RefState::Unloaded(last.root_pos)),
                last.map_size,
                last.max_seq,
            ),
            _ => {
                let page = Arc::new(Page::empty_leaf());
                gc.on_create(page.memory());
                (PageRef::new_root(RefState::Loaded(page)), 0, 0)
            }
        };
        debug!(map = %name, size, max_seq, in_memory = options.in_memory, "btree.open");
        Ok(Self {
            inner: Arc::new(TreeInner {
                name,
                root,
                map_lock: RwLock::new(()),
                size: AtomicU64::new(size),
                max_seq: AtomicU64::new(max_seq),
                closed: AtomicBool::new(false),
                options,
                storage,
                gc,
                stats: BTreeStats::default(),
                pool,
            }),
        })
    }

    /// Creates a map that is never persisted.
    pub fn in_memory(
        name: impl Into<String>,
        options: MapOptions,
        pool: Arc<PageOperationHandlerPool>,
    ) -> Result<Self> {
        Self::open(name, PathBuf::new(), options.in_memory(true), pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &MapOptions {
        &self.inner.options
    }

    /// Number of entries, adjusted once per structural insert or delete.
    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Returns the value stored under `key`. Never blocks on writers.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.stats.add_gets(1);
        let (_, leaf) = self.inner.find_leaf(key)?;
        Ok(leaf
            .binary_search(key)
            .ok()
            .map(|idx| leaf.values()[idx].clone()))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let (_, leaf) = self.inner.find_leaf(key)?;
        Ok(leaf.binary_search(key).is_ok())
    }

    /// Smallest key, skipping empty leaves.
    pub fn first_key(&self) -> Result<Option<K>> {
        let root = self.inner.page_of(&self.inner.root)?;
        self.inner.edge_key(&root, true)
    }

    /// Largest key, skipping empty leaves.
    pub fn last_key(&self) -> Result<Option<K>> {
        let root = self.inner.page_of(&self.inner.root)?;
        self.inner.edge_key(&root, false)
    }

    /// Largest key strictly below `key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.inner.min_max(key, true, true)
    }

    /// Largest key at or below `key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.inner.min_max(key, true, false)
    }

    /// Smallest key strictly above `key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.inner.min_max(key, false, true)
    }

    /// Smallest key at or above `key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.inner.min_max(key, false, false)
    }

    /// Ordered iteration from `from` (inclusive) or from the first key.
    pub fn cursor(&self, from: Option<K>) -> Result<Cursor<'_, K, V>> {
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        Cursor::new(self, lower, Bound::Unbounded)
    }

    /// Ordered iteration over `lower..upper`.
    ///
    /// Each leaf is read as an immutable snapshot; moving to the next leaf
    /// re-descends from the root, so keys present for the whole scan are
    /// never skipped.
    pub fn range(&self, lower: Bound<K>, upper: Bound<K>) -> Result<Cursor<'_, K, V>> {
        Cursor::new(self, lower, upper)
    }

    /// Estimated memory of loaded pages.
    pub fn memory_used(&self) -> usize {
        self.inner.gc.used()
    }

    /// Estimated memory of pages changed since the last save.
    pub fn dirty_memory_used(&self) -> usize {
        self.inner.gc.dirty()
    }

    pub fn disk_space_used(&self) -> u64 {
        self.inner.storage.disk_space_used()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.inner.storage.is_in_memory()
            && (self.inner.gc.dirty() > 0 || self.inner.storage.has_pending_removals())
    }

    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Emits the statistics counters through `tracing`.
    pub fn emit_stats(&self) {
        self.inner.stats.emit_tracing(&self.inner.name);
    }
}

impl<K: KeyCodec, V: ValCodec> TreeInner<K, V> {
    pub(crate) fn check_write(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.name.clone()));
        }
        if self.options.read_only {
            return Err(StoreError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    /// Loaded page of `r`, reading it from its chunk if needed.
    pub(crate) fn page_of(&self, r: &Arc<PageRef<K, V>>) -> Result<Arc<Page<K, V>>> {
        loop {
            let pos = match r.snapshot() {
                RefState::Loaded(page) => return Ok(page),
                RefState::Unloaded(pos) => pos,
            };
            let body = self.storage.read_page(pos)?;
            let page = Arc::new(Page::decode(&body, pos)?);
            if let Some((page, installed)) = r.install_loaded(pos, page) {
                if installed {
                    self.gc.on_load(page.memory());
                    self.stats.add_pages_loaded(1);
                }
                return Ok(page);
            }
        }
    }

    /// Reference and page of the leaf owning `key`.
    pub(crate) fn find_leaf(&self, key: &K) -> Result<(Arc<PageRef<K, V>>, Arc<Page<K, V>>)> {
        let mut current = Arc::clone(&self.root);
        loop {
            let page = self.page_of(&current)?;
            if page.is_leaf() {
                return Ok((current, page));
            }
            let next = Arc::clone(&page.children()[page.child_index(key)]);
            current = next;
        }
    }

    /// Parent of `child` on the path of `key`, with the child's index.
    pub(crate) fn find_parent(
        &self,
        child: &Arc<PageRef<K, V>>,
        key: &K,
    ) -> Result<Option<(Arc<PageRef<K, V>>, Arc<Page<K, V>>, usize)>> {
        let mut current = Arc::clone(&self.root);
        loop {
            let page = self.page_of(&current)?;
            if page.is_leaf() {
                return Ok(None);
            }
            let idx = page.child_index(key);
            let next = &page.children()[idx];
            if Arc::ptr_eq(next, child) {
                return Ok(Some((current, page, idx)));
            }
            let next = Arc::clone(next);
            current = next;
        }
    }

    fn edge_key(&self, page: &Page<K, V>, first: bool) -> Result<Option<K>> {
        if page.is_leaf() {
            let keys = page.keys();
            return Ok(if first { keys.first() } else { keys.last() }.cloned());
        }
        let children = page.children();
        let order: Box<dyn Iterator<Item = &Arc<PageRef<K, V>>>> = if first {
            Box::new(children.iter())
        } else {
            Box::new(children.iter().rev())
        };
        for child in order {
            let child = self.page_of(child)?;
            if let Some(key) = self.edge_key(&child, first)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    fn min_max(&self, key: &K, min: bool, excluding: bool) -> Result<Option<K>> {
        let root = self.page_of(&self.root)?;
        self.min_max_in(&root, key, min, excluding)
    }

    /// Neighbour search: the leaf adjusts the binary-search slot, internal
    /// pages fall back to the adjacent subtree when a child has no answer.
    fn min_max_in(&self, page: &Page<K, V>, key: &K, min: bool, excluding: bool) -> Result<Option<K>> {
        if page.is_leaf() {
            let idx: isize = match page.binary_search(key) {
                Ok(idx) if excluding => idx as isize + if min { -1 } else { 1 },
                Ok(idx) => idx as isize,
                Err(ins) if min => ins as isize - 1,
                Err(ins) => ins as isize,
            };
            if idx < 0 || idx as usize >= page.key_count() {
                return Ok(None);
            }
            return Ok(Some(page.keys()[idx as usize].clone()));
        }
        let children = page.children();
        let mut idx = page.child_index(key) as isize;
        while idx >= 0 && (idx as usize) < children.len() {
            let child = self.page_of(&children[idx as usize])?;
            if let Some(found) = self.min_max_in(&child, key, min, excluding)? {
                return Ok(Some(found));
            }
            idx += if min { -1 } else { 1 };
        }
        Ok(None)
    }

    /// First leaf position at or after `lower`, skipping empty leaves.
    pub(crate) fn seek(&self, lower: Bound<&K>) -> Result<Option<(Arc<Page<K, V>>, usize)>> {
        let root = self.page_of(&self.root)?;
        self.seek_in(root, lower)
    }

    fn seek_in(
        &self,
        page: Arc<Page<K, V>>,
        lower: Bound<&K>,
    ) -> Result<Option<(Arc<Page<K, V>>, usize)>> {
        if page.is_leaf() {
            let idx = match lower {
                Bound::Unbounded => 0,
                Bound::Included(key) => page.binary_search(key).unwrap_or_else(|ins| ins),
                Bound::Excluded(key) => match page.binary_search(key) {
                    Ok(idx) => idx + 1,
                    Err(ins) => ins,
                },
            };
            return Ok((idx < page.key_count()).then_some((page, idx)));
        }
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(key) | Bound::Excluded(key) => page.child_index(key),
        };
        for child in &page.children()[start..] {
            let child = self.page_of(child)?;
            if let Some(hit) = self.seek_in(child, lower)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    pub(crate) fn adjust_size(&self, delta: i64) {
        if delta > 0 {
            self.size.fetch_add(delta as u64, Ordering::AcqRel);
        } else if delta < 0 {
            let by = delta.unsigned_abs();
            let _ = self
                .size
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    Some(cur.saturating_sub(by))
                });
        }
    }

    /// Swaps `page` into `target` and retires what it replaced.
    pub(crate) fn install(&self, target: &Arc<PageRef<K, V>>, page: Arc<Page<K, V>>) {
        let memory = page.memory();
        match target.replace(page) {
            RefState::Loaded(old) => {
                self.gc.on_replace(Some(old.memory()), memory);
                self.retire(&old);
            }
            RefState::Unloaded(pos) => {
                self.gc.on_replace(None, memory);
                self.storage.register_removal(pos);
            }
        }
    }

    /// Marks `page` as out of the tree and frees its chunk record, if any.
    pub(crate) fn retire(&self, page: &Page<K, V>) {
        if let Some(pos) = page.mark_removed() {
            self.storage.register_removal(pos);
        }
    }
}
