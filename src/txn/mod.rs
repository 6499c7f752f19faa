//! Transactions over B-tree maps: versioned cells, undo chains, the redo
//! log and checkpoints.

pub mod checkpoint;
pub mod engine;
pub mod redo;
pub mod undo;
pub mod value;

pub use checkpoint::{CheckpointPolicy, CheckpointService, Checkpointer};
pub use engine::{EngineContext, IsolationLevel, Transaction, TransactionEngine, TransactionalMap};
pub use redo::{inspect_redo_log, RedoChunkSummary, RedoLog};
pub use undo::{PendingPurge, UndoLog, UndoLogRecord, UndoRecord};
pub use value::TransactionalValue;
