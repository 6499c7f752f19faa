//! Embedded transactional key-value store.
//!
//! Maps are copy-on-write B-trees persisted as append-only chunk files.
//! Transactions write versioned cells, commit through a redo log, and
//! checkpoints fold the redo log back into the map chunks.

pub mod config;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;

pub use config::{MapOptions, RedoSyncMode, StoreConfig};
pub use logging::init_logging;
pub use storage::{BTree, StorageMap};
pub use txn::{IsolationLevel, Transaction, TransactionEngine, TransactionalMap, TransactionalValue};
pub use types::{ChunkId, Result, StoreError, TxId};
