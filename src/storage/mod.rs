//! Page storage: the copy-on-write B-tree, its chunk files and the handler
//! pool that executes page operations.

/// Concurrent copy-on-write B-tree.
pub mod btree;

/// Append-only page chunk files.
pub mod chunk;

/// Page-operation handler threads.
pub mod handler;

mod map;

pub use btree::{BTree, Cursor, KeyCodec, ValCodec};
pub use chunk::{inspect_chunks, ChunkFooter, ChunkManager, ChunkSummary};
pub use handler::{HandlerContext, PageOperation, PageOperationHandlerPool, PageOperationResult};
pub use map::StorageMap;
