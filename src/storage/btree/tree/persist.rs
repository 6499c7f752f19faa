//! Saving dirty pages into a new chunk, and the whole-map operations that
//! take the exclusive map lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use super::{BTree, TreeInner};
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::{Page, PageRef, PosAssignment, RefState};
use crate::storage::chunk::{ChunkCommit, ChunkManager, ChunkWriter};
use crate::types::{PagePos, Result};

/// Pages serialized by one save, with the positions they will occupy.
struct SaveSnapshot<K, V> {
    written: Vec<(Arc<Page<K, V>>, PagePos)>,
    /// References whose dirty flag was consumed.
    flagged: Vec<Arc<PageRef<K, V>>>,
    /// Entries counted by the size that resident leaves keep out of their
    /// encoding.
    unsaved: u64,
}

impl<K, V> SaveSnapshot<K, V> {
    fn new() -> Self {
        Self {
            written: Vec::new(),
            flagged: Vec::new(),
            unsaved: 0,
        }
    }

    fn restore_flags(&self) {
        for r in &self.flagged {
            r.mark_dirty();
        }
    }
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// Writes every page changed since the last save into a new chunk.
    ///
    /// The tree is frozen only while dirty pages are serialized; the chunk
    /// file is written and synced after the map lock is released. A no-op for
    /// in-memory, read-only and closed maps.
    pub fn save(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.options.read_only || inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(chunks) = inner.storage.chunks() else {
            return Ok(());
        };
        let _save = inner.storage.save_lock.lock();
        inner.save_locked(chunks)
    }

    /// Saves and closes the map. Later writes fail with
    /// [`crate::types::StoreError::Closed`]; reads keep working.
    pub fn close(&self) -> Result<()> {
        let inner = &*self.inner;
        let _save = inner.storage.save_lock.lock();
        {
            let _exclusive = inner.map_lock.write();
            if inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        if !inner.options.read_only {
            if let Some(chunks) = inner.storage.chunks() {
                inner.save_locked(chunks)?;
            }
        }
        inner.stats.emit_tracing(&inner.name);
        info!(map = %inner.name, size = self.size(), "btree.close");
        Ok(())
    }

    /// Removes every entry. Existing chunks become garbage once the next save
    /// commits.
    pub fn clear(&self) -> Result<()> {
        let inner = &*self.inner;
        let _save = inner.storage.save_lock.lock();
        let _exclusive = inner.map_lock.write();
        inner.check_write()?;
        let empty = Arc::new(Page::empty_leaf());
        let memory = empty.memory();
        if let RefState::Loaded(old) = inner.root.replace(empty) {
            inner.retire(&old);
        }
        if let Some(chunks) = inner.storage.chunks() {
            chunks.drop_all_on_next_commit();
        }
        inner.gc.reset(memory);
        inner.size.store(0, Ordering::Release);
        debug!(map = %inner.name, "btree.clear");
        Ok(())
    }

    /// Closes the map and deletes its chunk files and directory.
    pub fn remove_map(&self) -> Result<()> {
        let inner = &*self.inner;
        let _save = inner.storage.save_lock.lock();
        let _exclusive = inner.map_lock.write();
        inner.closed.store(true, Ordering::Release);
        let empty = Arc::new(Page::empty_leaf());
        let memory = empty.memory();
        inner.root.replace(empty);
        inner.size.store(0, Ordering::Release);
        inner.gc.reset(memory);
        inner.gc.take_dirty();
        if !inner.options.read_only {
            if let Some(chunks) = inner.storage.chunks() {
                chunks.remove_all()?;
            }
        }
        info!(map = %inner.name, "btree.remove");
        Ok(())
    }
}

impl<K: KeyCodec, V: ValCodec> TreeInner<K, V> {
    /// Save body; the caller holds `save_lock`.
    pub(crate) fn save_locked(&self, chunks: &ChunkManager) -> Result<()> {
        let mut writer = chunks.begin_chunk()?;
        let mut snapshot = SaveSnapshot::new();
        let (meta, removals, dirty) = {
            let _exclusive = self.map_lock.write();
            let root_pos = match self.write_dirty(&self.root, &mut writer, &mut snapshot) {
                Ok((pos, _)) => pos,
                Err(err) => {
                    snapshot.restore_flags();
                    return Err(err);
                }
            };
            let meta = ChunkCommit {
                root_pos,
                map_size: self
                    .size
                    .load(Ordering::Acquire)
                    .saturating_sub(snapshot.unsaved),
                max_seq: self.max_seq.load(Ordering::Acquire),
            };
            (meta, chunks.take_removals(), self.gc.take_dirty())
        };

        let unchanged = writer.is_empty()
            && removals.is_empty()
            && chunks.last_chunk().is_some_and(|last| {
                last.root_pos == meta.root_pos
                    && last.map_size == meta.map_size
                    && last.max_seq == meta.max_seq
            });
        if unchanged {
            return Ok(());
        }

        let pages = writer.page_count();
        let footer = match chunks.commit(writer, meta, removals.clone()) {
            Ok(footer) => footer,
            Err(err) => {
                snapshot.restore_flags();
                for pos in removals {
                    chunks.register_removal(pos);
                }
                self.gc.restore_dirty(dirty);
                return Err(err);
            }
        };
        for (page, pos) in snapshot.written {
            match page.assign_pos(pos) {
                PosAssignment::Obsolete => chunks.register_removal(pos),
                PosAssignment::Assigned {
                    previous: Some(previous),
                } => chunks.register_removal(previous),
                PosAssignment::Assigned { previous: None } => {}
            }
        }
        self.stats.add_pages_written(u64::from(pages));
        self.stats.add_chunks_written(1);
        debug!(
            map = %self.name,
            chunk = footer.id.0,
            pages,
            root = %footer.root_pos,
            size = footer.map_size,
            "btree.save.committed"
        );
        let evicted = self.gc.evict(&self.root);
        self.stats.add_pages_evicted(evicted as u64);
        Ok(())
    }

    /// Serializes the changed part of the subtree under `r` bottom-up and
    /// returns the subtree root position plus whether it was rewritten.
    ///
    /// A page is rewritten when it was never persisted, when its reference
    /// was flagged dirty, or when any child was rewritten. Every resident
    /// leaf is visited so that counted entries its encoding leaves out are
    /// kept out of the saved size.
    fn write_dirty(
        &self,
        r: &Arc<PageRef<K, V>>,
        writer: &mut ChunkWriter,
        snapshot: &mut SaveSnapshot<K, V>,
    ) -> Result<(PagePos, bool)> {
        let page = match r.snapshot() {
            RefState::Unloaded(pos) => return Ok((pos, false)),
            RefState::Loaded(page) => page,
        };
        if page.is_leaf() {
            snapshot.unsaved += page
                .values()
                .iter()
                .filter(|v| V::is_counted(v) && !V::is_persistent(v))
                .count() as u64;
        }
        let flagged = r.take_dirty();
        if flagged {
            snapshot.flagged.push(Arc::clone(r));
        }
        let mut child_positions = Vec::with_capacity(page.children().len());
        let mut child_rewritten = false;
        for child in page.children() {
            let (pos, rewritten) = self.write_dirty(child, writer, snapshot)?;
            child_positions.push(pos);
            child_rewritten |= rewritten;
        }
        let pos = page.pos();
        if pos.is_persisted() && !flagged && !child_rewritten {
            return Ok((pos, false));
        }
        let mut body = Vec::new();
        page.encode(&child_positions, &mut body);
        let new_pos = writer.push_page(&body)?;
        snapshot.written.push((page, new_pos));
        Ok((new_pos, true))
    }
}
