use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Point lookups served
    pub gets: u64,
    /// Writes completed on the calling thread without queuing
    pub fast_path_writes: u64,
    /// Writes that were queued on a handler after a failed attempt
    pub retried_writes: u64,
    /// Attempts that found the target page reference locked
    pub lock_conflicts: u64,
    /// Number of leaf page splits performed
    pub leaf_splits: u64,
    /// Number of internal page splits performed
    pub node_splits: u64,
    /// Splits skipped because the parent was locked
    pub deferred_splits: u64,
    /// Empty leaves unlinked from their parent
    pub leaf_unlinks: u64,
    /// Single-child roots replaced by their child
    pub root_collapses: u64,
    /// Splits, unlinks or collapses abandoned on a page load error after
    /// the write itself was applied
    pub maintenance_failures: u64,
    pub pages_loaded: u64,
    pub pages_evicted: u64,
    pub pages_written: u64,
    pub chunks_written: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct BTreeStats {
    gets: AtomicU64,
    fast_path_writes: AtomicU64,
    retried_writes: AtomicU64,
    lock_conflicts: AtomicU64,
    leaf_splits: AtomicU64,
    node_splits: AtomicU64,
    deferred_splits: AtomicU64,
    leaf_unlinks: AtomicU64,
    root_collapses: AtomicU64,
    maintenance_failures: AtomicU64,
    pages_loaded: AtomicU64,
    pages_evicted: AtomicU64,
    pages_written: AtomicU64,
    chunks_written: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl BTreeStats {
            $(
                pub fn $field(&self) -> u64 {
                    self.$field.load(AtomicOrdering::Relaxed)
                }

                pub(crate) fn $inc(&self, n: u64) {
                    self.$field.fetch_add(n, AtomicOrdering::Relaxed);
                }
            )*

            /// Creates a snapshot of all current statistics.
            pub fn snapshot(&self) -> BTreeStatsSnapshot {
                BTreeStatsSnapshot {
                    $($field: self.$field(),)*
                }
            }
        }
    };
}

counters! {
    gets => add_gets,
    fast_path_writes => add_fast_path_writes,
    retried_writes => add_retried_writes,
    lock_conflicts => add_lock_conflicts,
    leaf_splits => add_leaf_splits,
    node_splits => add_node_splits,
    deferred_splits => add_deferred_splits,
    leaf_unlinks => add_leaf_unlinks,
    root_collapses => add_root_collapses,
    maintenance_failures => add_maintenance_failures,
    pages_loaded => add_pages_loaded,
    pages_evicted => add_pages_evicted,
    pages_written => add_pages_written,
    chunks_written => add_chunks_written,
}

impl BTreeStats {
    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, map: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "aostore::btree::stats",
            map,
            gets = snapshot.gets,
            fast_path_writes = snapshot.fast_path_writes,
            retried_writes = snapshot.retried_writes,
            lock_conflicts = snapshot.lock_conflicts,
            leaf_splits = snapshot.leaf_splits,
            node_splits = snapshot.node_splits,
            deferred_splits = snapshot.deferred_splits,
            leaf_unlinks = snapshot.leaf_unlinks,
            root_collapses = snapshot.root_collapses,
            maintenance_failures = snapshot.maintenance_failures,
            pages_loaded = snapshot.pages_loaded,
            pages_evicted = snapshot.pages_evicted,
            pages_written = snapshot.pages_written,
            chunks_written = snapshot.chunks_written,
            "btree stats snapshot"
        );
    }
}
