//! Object-safe view of an open map, used by registries that hold maps of
//! different key and value types.

use std::any::Any;

use crate::storage::btree::{BTree, KeyCodec, ValCodec};
use crate::types::Result;

/// Type-erased map handle. Downcast through [`StorageMap::as_any`] to reach
/// the typed [`BTree`].
pub trait StorageMap: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn is_closed(&self) -> bool;
    fn save(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    /// Closes the map and deletes its files.
    fn remove(&self) -> Result<()>;
    fn has_unsaved_changes(&self) -> bool;
    fn memory_used(&self) -> usize;
    fn dirty_memory_used(&self) -> usize;
    fn disk_space_used(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

impl<K: KeyCodec, V: ValCodec> StorageMap for BTree<K, V> {
    fn name(&self) -> &str {
        BTree::name(self)
    }

    fn size(&self) -> u64 {
        BTree::size(self)
    }

    fn is_closed(&self) -> bool {
        BTree::is_closed(self)
    }

    fn save(&self) -> Result<()> {
        BTree::save(self)
    }

    fn close(&self) -> Result<()> {
        BTree::close(self)
    }

    fn remove(&self) -> Result<()> {
        self.remove_map()
    }

    fn has_unsaved_changes(&self) -> bool {
        BTree::has_unsaved_changes(self)
    }

    fn memory_used(&self) -> usize {
        BTree::memory_used(self)
    }

    fn dirty_memory_used(&self) -> usize {
        BTree::dirty_memory_used(self)
    }

    fn disk_space_used(&self) -> u64 {
        BTree::disk_space_used(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
