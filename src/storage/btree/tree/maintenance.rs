//! Structural maintenance run by a writer that holds the leaf lock: splits,
//! empty-leaf unlinking and root collapse.
//!
//! Every step locks the page reference it replaces. Parents are found by
//! re-descending from the root and are verified after locking; if the parent
//! is contended the step is skipped and retried by a later write.

use std::sync::Arc;

use tracing::debug;

use super::TreeInner;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::{Page, PageRef, RefLock, RefState};
use crate::storage::handler::HandlerContext;
use crate::types::Result;

type Parent<K, V> = (RefLock<K, V>, Arc<Page<K, V>>, usize);

impl<K: KeyCodec, V: ValCodec> TreeInner<K, V> {
    /// Locks the parent of `child` on the path of `key`.
    fn lock_parent(
        &self,
        ctx: &HandlerContext,
        child: &Arc<PageRef<K, V>>,
        key: &K,
    ) -> Result<Option<Parent<K, V>>> {
        let Some((parent, _, _)) = self.find_parent(child, key)? else {
            return Ok(None);
        };
        let Ok(lock) = RefLock::acquire(&parent, ctx.id()) else {
            return Ok(None);
        };
        match self.find_parent(child, key)? {
            Some((current, page, idx)) if Arc::ptr_eq(&current, &parent) => {
                Ok(Some((lock, page, idx)))
            }
            _ => Ok(None),
        }
    }

    /// Splits `page`, the content of the locked reference `target`, while it
    /// exceeds the split size. Non-root splits insert the new right sibling
    /// into the parent before the shrunk left half is installed, so a
    /// concurrent reader finds every key through one of the two versions.
    pub(crate) fn split(
        &self,
        ctx: &HandlerContext,
        target: &Arc<PageRef<K, V>>,
        page: Arc<Page<K, V>>,
        key: &K,
    ) -> Result<()> {
        if !page.needs_split(self.options.page_split_size) {
            return Ok(());
        }
        let leaf = page.is_leaf();
        if target.is_root() {
            let (sep, left, right) = page.split();
            let left = PageRef::new(Arc::new(left));
            let right = PageRef::new(Arc::new(right));
            for half in [&left, &right] {
                if let Some(p) = half.loaded() {
                    self.gc.on_create(p.memory());
                }
            }
            self.install(target, Arc::new(Page::node(vec![sep], vec![left, right])));
            self.count_split(leaf);
            debug!(map = %self.name, leaf, "btree.split.root");
            return Ok(());
        }
        let Some((parent_lock, parent_page, idx)) = self.lock_parent(ctx, target, key)? else {
            self.stats.add_deferred_splits(1);
            return Ok(());
        };
        let (sep, left, right) = page.split();
        let right = Arc::new(right);
        self.gc.on_create(right.memory());
        let parent = Arc::new(parent_page.node_with_split_child(idx, sep, PageRef::new(right)));
        self.install(parent_lock.target(), Arc::clone(&parent));
        self.install(target, Arc::new(left));
        self.count_split(leaf);
        debug!(map = %self.name, leaf, parent_keys = parent.key_count(), "btree.split");
        self.split(ctx, parent_lock.target(), parent, key)
    }

    fn count_split(&self, leaf: bool) {
        if leaf {
            self.stats.add_leaf_splits(1);
        } else {
            self.stats.add_node_splits(1);
        }
    }

    /// Removes the locked, empty, non-root leaf `leaf` from its parent when
    /// the parent keeps at least one other child.
    pub(crate) fn unlink_empty_leaf(
        &self,
        ctx: &HandlerContext,
        leaf: &Arc<PageRef<K, V>>,
        key: &K,
    ) -> Result<()> {
        let Some((parent_lock, parent_page, idx)) = self.lock_parent(ctx, leaf, key)? else {
            return Ok(());
        };
        if parent_page.children().len() < 2 {
            return Ok(());
        }
        let parent = Arc::new(parent_page.node_without_child(idx));
        self.install(parent_lock.target(), Arc::clone(&parent));
        if let RefState::Loaded(old) = leaf.snapshot() {
            self.gc.on_unload(old.memory());
            self.retire(&old);
        }
        self.stats.add_leaf_unlinks(1);
        debug!(map = %self.name, "btree.unlink.empty_leaf");
        if parent_lock.target().is_root() && parent.children().len() == 1 {
            self.collapse_root(ctx, &parent)?;
        }
        Ok(())
    }

    /// Replaces a locked root holding a single child with that child's page.
    fn collapse_root(&self, ctx: &HandlerContext, root_page: &Page<K, V>) -> Result<()> {
        let child = Arc::clone(&root_page.children()[0]);
        let Ok(_child_lock) = RefLock::acquire(&child, ctx.id()) else {
            return Ok(());
        };
        let child_page = self.page_of(&child)?;
        if let RefState::Loaded(old) = self.root.replace(child_page) {
            self.gc.on_unload(old.memory());
            self.retire(&old);
        }
        if child.take_dirty() {
            self.root.mark_dirty();
        }
        self.stats.add_root_collapses(1);
        debug!(map = %self.name, "btree.collapse.root");
        Ok(())
    }
}
