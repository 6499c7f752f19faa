//! Binding between a tree and its chunk files.

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::storage::chunk::{ChunkFooter, ChunkManager};
use crate::types::{PagePos, Result, StoreError};

pub(crate) struct BTreeStorage {
    /// `None` for in-memory maps.
    chunks: Option<ChunkManager>,
    /// Serializes `save`, `close`, `clear` and `remove`.
    pub(crate) save_lock: Mutex<()>,
}

impl BTreeStorage {
    pub(crate) fn open(dir: PathBuf, read_only: bool) -> Result<Self> {
        Ok(Self {
            chunks: Some(ChunkManager::open(dir, read_only)?),
            save_lock: Mutex::new(()),
        })
    }

    pub(crate) fn in_memory() -> Self {
        Self {
            chunks: None,
            save_lock: Mutex::new(()),
        }
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        self.chunks.is_none()
    }

    pub(crate) fn chunks(&self) -> Option<&ChunkManager> {
        self.chunks.as_ref()
    }

    pub(crate) fn last_chunk(&self) -> Option<ChunkFooter> {
        self.chunks.as_ref().and_then(ChunkManager::last_chunk)
    }

    pub(crate) fn read_page(&self, pos: PagePos) -> Result<Vec<u8>> {
        match &self.chunks {
            Some(chunks) => chunks.read_page(pos),
            None => Err(StoreError::Invalid("in-memory map has no persisted pages")),
        }
    }

    pub(crate) fn register_removal(&self, pos: PagePos) {
        if let Some(chunks) = &self.chunks {
            chunks.register_removal(pos);
        }
    }

    pub(crate) fn has_pending_removals(&self) -> bool {
        self.chunks
            .as_ref()
            .is_some_and(|chunks| chunks.pending_removals() > 0)
    }

    pub(crate) fn disk_space_used(&self) -> u64 {
        self.chunks.as_ref().map_or(0, ChunkManager::disk_space_used)
    }
}
