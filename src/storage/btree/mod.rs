#![forbid(unsafe_code)]

//! Concurrent copy-on-write B-tree persisted as append-only page chunks.

/// Key and value codecs.
pub mod codecs;
mod cursor;
mod gc;
mod ops;
mod page;
mod stats;
mod storage;
mod tree;

pub use codecs::{KeyCodec, ValCodec};
pub use cursor::Cursor;
pub use ops::{ComputeFn, OpCallback, OpOutput, ValuePredicate, WriteOp};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::BTree;
