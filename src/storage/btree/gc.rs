//! Memory accounting and eviction for one tree.
//!
//! `used` tracks the footprint of every loaded page; `dirty` the footprint of
//! pages changed since the last save. Eviction only drops clean, persisted,
//! unlocked leaves; internal pages stay resident.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::codecs::{KeyCodec, ValCodec};
use super::page::{PageRef, RefState};

pub(crate) struct BTreeGc {
    used: AtomicUsize,
    dirty: AtomicUsize,
    cache_size: usize,
    evicting: AtomicBool,
}

fn saturating_sub(counter: &AtomicUsize, n: usize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(n))
    });
}

impl BTreeGc {
    pub(crate) fn new(cache_size: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            dirty: AtomicUsize::new(0),
            cache_size,
            evicting: AtomicBool::new(false),
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn dirty(&self) -> usize {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn on_load(&self, memory: usize) {
        self.used.fetch_add(memory, Ordering::AcqRel);
    }

    /// A page of `new` bytes replaced a loaded page of `old` bytes (or an
    /// unloaded one when `old` is `None`).
    pub(crate) fn on_replace(&self, old: Option<usize>, new: usize) {
        self.used.fetch_add(new, Ordering::AcqRel);
        if let Some(old) = old {
            saturating_sub(&self.used, old);
        }
        self.dirty.fetch_add(new, Ordering::AcqRel);
    }

    /// A new page entered the tree without replacing another.
    pub(crate) fn on_create(&self, memory: usize) {
        self.on_replace(None, memory);
    }

    /// A loaded page left memory.
    pub(crate) fn on_unload(&self, memory: usize) {
        saturating_sub(&self.used, memory);
    }

    pub(crate) fn on_mark_dirty(&self, memory: usize) {
        self.dirty.fetch_add(memory, Ordering::AcqRel);
    }

    /// Takes the dirty counter for a save; `restore_dirty` undoes it when the
    /// save fails.
    pub(crate) fn take_dirty(&self) -> usize {
        self.dirty.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn restore_dirty(&self, memory: usize) {
        self.dirty.fetch_add(memory, Ordering::AcqRel);
    }

    pub(crate) fn reset(&self, used: usize) {
        self.used.store(used, Ordering::Release);
        self.dirty.store(used, Ordering::Release);
    }

    pub(crate) fn needs_eviction(&self) -> bool {
        self.used() > self.cache_size
    }

    /// Walks the tree from `root` and unloads clean leaves until usage drops
    /// to three quarters of the cache budget. Returns the number of leaves
    /// evicted. Only one eviction pass runs at a time.
    pub(crate) fn evict<K: KeyCodec, V: ValCodec>(&self, root: &Arc<PageRef<K, V>>) -> usize {
        if !self.needs_eviction() {
            return 0;
        }
        if self.evicting.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let target = self.cache_size / 4 * 3;
        let mut evicted = 0usize;
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            if self.used() <= target {
                break;
            }
            let RefState::Loaded(page) = node.snapshot() else {
                continue;
            };
            if !page.is_leaf() {
                stack.extend(page.children().iter().rev().cloned());
                continue;
            }
            if node.is_root() {
                continue;
            }
            let memory = page.memory();
            if node.evict(&page, |p| p.values().iter().all(V::can_evict)) {
                self.on_unload(memory);
                evicted += 1;
            }
        }
        self.evicting.store(false, Ordering::Release);
        debug!(evicted, used = self.used(), cache_size = self.cache_size, "btree.gc.evicted");
        evicted
    }
}
