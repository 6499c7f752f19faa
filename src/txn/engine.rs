//! Transaction engine: map registry, transactions, commit gate and the
//! open / checkpoint / close lifecycle.
//!
//! Startup order is config validation, redo-log init, handler pool, then the
//! optional checkpoint worker. Maps are opened on demand and replay their
//! pending redo records before they become visible. Shutdown stops the
//! worker, checkpoints, closes every map, closes the redo log and finally
//! stops the handler pool.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{validate_dir_name, MapOptions, StoreConfig};
use crate::storage::btree::{BTree, ComputeFn, KeyCodec, ValCodec, WriteOp};
use crate::storage::handler::{HandlerContext, PageOperationHandlerPool};
use crate::storage::StorageMap;
use crate::txn::checkpoint::{CheckpointPolicy, Checkpointer};
use crate::txn::redo::RedoLog;
use crate::txn::undo::{PendingPurge, UndoLog, UndoLogRecord};
use crate::txn::value::TransactionalValue;
use crate::types::{Result, StoreError, TxId};

const ENGINE_NAME: &str = "engine";

/// What the undo and redo layers need from the engine.
pub trait EngineContext: Send + Sync {
    /// The open map called `name`, if any.
    fn storage_map(&self, name: &str) -> Option<Arc<dyn StorageMap>>;
    fn contains_repeatable_read_transactions(&self) -> bool;
}

/// A map whose values are versioned cells.
pub type TransactionalMap<K, T> = BTree<K, TransactionalValue<T>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

#[derive(Default)]
struct ActiveSet {
    transactions: HashMap<TxId, IsolationLevel>,
    repeatable_read: usize,
}

pub(crate) struct EngineInner {
    config: StoreConfig,
    pool: Arc<PageOperationHandlerPool>,
    redo: RedoLog,
    checkpointer: Arc<Checkpointer>,
    maps: RwLock<HashMap<String, Arc<dyn StorageMap>>>,
    /// Shared by commits across redo append and apply; exclusive while a
    /// checkpoint seals the live redo chunk.
    commit_gate: RwLock<()>,
    /// Serializes checkpoints with map open and drop.
    checkpoint_lock: Mutex<()>,
    next_tx: AtomicU64,
    active: Mutex<ActiveSet>,
    purges: Mutex<Vec<PendingPurge>>,
    closed: AtomicBool,
}

/// Embedded transactional key-value engine.
pub struct TransactionEngine {
    inner: Arc<EngineInner>,
}

impl TransactionEngine {
    /// Validates `config`, replays nothing yet and readies the engine.
    /// Redo records are applied per map by [`TransactionEngine::open_map`].
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if !config.read_only {
            fs::create_dir_all(&config.base_dir)?;
        }
        let checkpointer = Checkpointer::new(CheckpointPolicy::from_config(&config));
        let redo = RedoLog::init(&config, checkpointer.clone())?;
        let pool = PageOperationHandlerPool::new(config.handler_threads)?;
        let inner = Arc::new(EngineInner {
            pool,
            redo,
            checkpointer,
            maps: RwLock::new(HashMap::new()),
            commit_gate: RwLock::new(()),
            checkpoint_lock: Mutex::new(()),
            next_tx: AtomicU64::new(1),
            active: Mutex::new(ActiveSet::default()),
            purges: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        });
        if let Some(period) = inner.checkpointer.policy().period {
            if !inner.config.read_only {
                let weak = Arc::downgrade(&inner);
                inner.checkpointer.start_worker(period, move || match weak.upgrade() {
                    Some(engine) => engine.checkpoint_if_due(),
                    None => Ok(()),
                })?;
            }
        }
        info!(
            base_dir = %inner.config.base_dir.display(),
            handlers = inner.config.handler_threads,
            read_only = inner.config.read_only,
            "engine.open"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.inner.checkpointer
    }

    /// Maps that still have redo records waiting for their first open.
    pub fn pending_redo_maps(&self) -> Vec<String> {
        self.inner.redo.pending_maps()
    }

    /// Names of the open maps, sorted.
    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.maps.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Opens `name`, replaying its pending redo records on first open, and
    /// registers it. Opening an already open map returns the same map.
    pub fn open_map<K: KeyCodec, T: ValCodec>(
        &self,
        name: &str,
        options: MapOptions,
    ) -> Result<TransactionalMap<K, T>> {
        let inner = &*self.inner;
        inner.check_open()?;
        validate_dir_name("map name", name)?;
        if name == inner.config.redo_log_dir {
            return Err(StoreError::Config(format!(
                "map name {name:?} collides with the redo log directory"
            )));
        }
        let _checkpoint = inner.checkpoint_lock.lock();
        if let Some(existing) = inner.maps.read().get(name) {
            return existing
                .as_any()
                .downcast_ref::<TransactionalMap<K, T>>()
                .cloned()
                .ok_or_else(|| {
                    StoreError::InvalidOwned(format!("map {name} is open with other types"))
                });
        }
        let map = BTree::open(
            name,
            inner.config.map_path(name),
            options,
            Arc::clone(&inner.pool),
        )?;
        if map.is_read_only() {
            if inner.redo.pending_maps().iter().any(|m| m == name) {
                warn!(map = name, "engine.open_map.redo_skipped_read_only");
            }
        } else {
            inner.redo.redo(&map)?;
        }
        inner
            .maps
            .write()
            .insert(name.to_string(), Arc::new(map.clone()));
        info!(map = name, size = map.size(), "engine.open_map");
        Ok(map)
    }

    /// Opens `name` with the engine's default map options.
    pub fn open_default_map<K: KeyCodec, T: ValCodec>(
        &self,
        name: &str,
    ) -> Result<TransactionalMap<K, T>> {
        self.open_map(name, self.inner.config.map_options())
    }

    /// Closes and deletes map `name` with its files and pending redo
    /// records. Returns whether anything was removed.
    pub fn drop_map(&self, name: &str) -> Result<bool> {
        let inner = &*self.inner;
        inner.check_open()?;
        validate_dir_name("map name", name)?;
        let _checkpoint = inner.checkpoint_lock.lock();
        inner.redo.discard_pending(name);
        let removed = inner.maps.write().remove(name);
        let dropped = match removed {
            Some(map) => {
                map.remove()?;
                true
            }
            None => {
                let dir = inner.config.map_path(name);
                let exists = dir.is_dir();
                if exists {
                    fs::remove_dir_all(&dir)?;
                }
                exists
            }
        };
        info!(map = name, dropped, "engine.drop_map");
        Ok(dropped)
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Transaction> {
        self.inner.check_open()?;
        let id = TxId(self.inner.next_tx.fetch_add(1, Ordering::AcqRel));
        {
            let mut active = self.inner.active.lock();
            active.transactions.insert(id, isolation);
            if isolation == IsolationLevel::RepeatableRead {
                active.repeatable_read += 1;
            }
        }
        debug!(tx = %id, ?isolation, "txn.begin");
        Ok(Transaction {
            id,
            isolation,
            engine: Arc::clone(&self.inner),
            undo: UndoLog::new(),
            state: TxState::Active,
        })
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.active.lock().transactions.len()
    }

    /// Tombstones waiting for the last repeatable-read transaction to end.
    pub fn pending_purges(&self) -> usize {
        self.inner.purges.lock().len()
    }

    /// Seals the live redo chunk, saves every open map and deletes the
    /// sealed redo chunks.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.checkpoint()
    }

    /// Estimated dirty memory over all open maps.
    pub fn dirty_memory(&self) -> usize {
        self.inner.dirty_memory()
    }

    /// Checkpoints and releases every resource. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.checkpointer.stop_worker();
        let active = self.active_transactions();
        if active > 0 {
            warn!(active, "engine.close.active_transactions");
        }
        let result = inner.shutdown();
        inner.pool.shutdown();
        info!(ok = result.is_ok(), "engine.close");
        result
    }
}

impl EngineContext for TransactionEngine {
    fn storage_map(&self, name: &str) -> Option<Arc<dyn StorageMap>> {
        self.inner.storage_map(name)
    }

    fn contains_repeatable_read_transactions(&self) -> bool {
        self.inner.contains_repeatable_read_transactions()
    }
}

impl EngineContext for EngineInner {
    fn storage_map(&self, name: &str) -> Option<Arc<dyn StorageMap>> {
        self.maps.read().get(name).cloned()
    }

    fn contains_repeatable_read_transactions(&self) -> bool {
        self.active.lock().repeatable_read > 0
    }
}

impl EngineInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(ENGINE_NAME.into()));
        }
        Ok(())
    }

    fn open_maps(&self) -> Vec<Arc<dyn StorageMap>> {
        self.maps.read().values().cloned().collect()
    }

    fn dirty_memory(&self) -> usize {
        self.open_maps()
            .iter()
            .map(|map| map.dirty_memory_used())
            .sum()
    }

    fn checkpoint_if_due(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.checkpointer.should_run(self.dirty_memory()) {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.config.read_only {
            return Ok(());
        }
        let _checkpoint = self.checkpoint_lock.lock();
        if !self.contains_repeatable_read_transactions() {
            self.run_purges();
        }
        let (sealed, appended) = {
            let _gate = self.commit_gate.write();
            let appended = self.checkpointer.redo_bytes_since_checkpoint();
            (self.redo.save()?, appended)
        };
        let maps = self.open_maps();
        for map in &maps {
            map.save()?;
        }
        let deleted = self.redo.delete_chunks_through(sealed)?;
        self.checkpointer.record_checkpoint(appended);
        info!(
            sealed = sealed.0,
            maps = maps.len(),
            redo_chunks_deleted = deleted,
            "engine.checkpoint"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.checkpoint()?;
        for map in self.open_maps() {
            map.close()?;
        }
        self.redo.close()
    }

    /// Writes `undo` to the redo log and applies it. The returned purges
    /// belong to repeatable-read deletes.
    fn commit_undo(&self, undo: &mut UndoLog) -> Result<Vec<PendingPurge>> {
        if undo.is_empty() {
            return Ok(Vec::new());
        }
        let _gate = self.commit_gate.read();
        let mut buffer = Vec::new();
        undo.write_for_redo(&mut buffer, self)?;
        self.redo.commit(buffer)?;
        Ok(undo.commit(self))
    }

    fn end_transaction(&self, id: TxId, isolation: IsolationLevel, purges: Vec<PendingPurge>) {
        let purge_now = {
            let mut active = self.active.lock();
            if active.transactions.remove(&id).is_some()
                && isolation == IsolationLevel::RepeatableRead
            {
                active.repeatable_read = active.repeatable_read.saturating_sub(1);
            }
            let mut pending = self.purges.lock();
            pending.extend(purges);
            active.repeatable_read == 0 && !pending.is_empty()
        };
        if purge_now {
            self.run_purges();
        }
    }

    fn run_purges(&self) {
        let purges = std::mem::take(&mut *self.purges.lock());
        if purges.is_empty() {
            return;
        }
        let count = purges.len();
        for purge in purges {
            let map = purge.map_name().to_string();
            if let Err(err) = purge.run() {
                warn!(map = %map, error = %err, "txn.purge_failed");
            }
        }
        debug!(count, "txn.tombstones_purged");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.checkpointer.stop_worker();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// A unit of work over one or more transactional maps.
///
/// Writes are private to the transaction until [`Transaction::commit`].
/// Dropping an active transaction rolls it back.
pub struct Transaction {
    id: TxId,
    isolation: IsolationLevel,
    engine: Arc<EngineInner>,
    undo: UndoLog,
    state: TxState,
}

/// What a write callback saw and did under the leaf lock.
struct Written<T> {
    cell: TransactionalValue<T>,
    old: Option<T>,
}

type WriteSlot<T> = Arc<Mutex<Option<Written<T>>>>;

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(StoreError::Invalid("transaction is no longer active"));
        }
        self.engine.check_open()
    }

    fn check_payload<K: KeyCodec, T: ValCodec>(
        map: &TransactionalMap<K, T>,
        key: &K,
        value: &T,
    ) -> Result<()> {
        let size = K::key_memory(key) + T::val_memory(value);
        let limit = map.options().max_payload_size;
        if size > limit {
            return Err(StoreError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    /// Runs `f` under the lock of the leaf owning `key` and returns what it
    /// recorded in the slot.
    fn compute<K: KeyCodec, T: ValCodec>(
        map: &TransactionalMap<K, T>,
        key: K,
        slot: &WriteSlot<T>,
        f: ComputeFn<TransactionalValue<T>>,
    ) -> Result<Written<T>> {
        map.execute(&HandlerContext::current(), WriteOp::Compute { key, f: Some(f) })?;
        slot.lock()
            .take()
            .ok_or(StoreError::Invalid("write callback did not run"))
    }

    /// Inserts `key`. Fails with [`StoreError::DuplicateKey`] when the key
    /// is visible to this transaction and with [`StoreError::WriteConflict`]
    /// when another transaction has an uncommitted write on it.
    pub fn insert<K: KeyCodec, T: ValCodec>(
        &mut self,
        map: &TransactionalMap<K, T>,
        key: K,
        value: T,
    ) -> Result<()> {
        self.check_active()?;
        Self::check_payload(map, &key, &value)?;
        let owner = self.id;
        let name = map.name().to_string();
        let new = value.clone();
        let slot: WriteSlot<T> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let sized = map.clone();
        let f: ComputeFn<TransactionalValue<T>> = Box::new(move |current: Option<&TransactionalValue<T>>| {
            let (written, store) = match current {
                None => {
                    let cell = TransactionalValue::pending_insert(owner, value);
                    let written = Written {
                        cell: cell.clone(),
                        old: None,
                    };
                    (written, Some(cell))
                }
                Some(existing) if existing.is_tombstone() => {
                    // replacing the tombstone is not a structural insert
                    sized.increment_size();
                    let cell = TransactionalValue::pending_insert(owner, value);
                    let written = Written {
                        cell: cell.clone(),
                        old: None,
                    };
                    (written, Some(cell))
                }
                Some(existing) => match existing.pending_owner() {
                    Some(holder) if holder != owner => return Err(StoreError::WriteConflict(name)),
                    Some(_) if existing.read(Some(owner)).is_none() => {
                        let old = existing
                            .write(owner, Some(value))
                            .map_err(|_| StoreError::WriteConflict(name.clone()))?;
                        let written = Written {
                            cell: existing.clone(),
                            old,
                        };
                        (written, None)
                    }
                    _ => return Err(StoreError::DuplicateKey(name)),
                },
            };
            *out.lock() = Some(written);
            Ok(store)
        });
        let written = Self::compute(map, key.clone(), &slot, f)?;
        self.undo.add(Box::new(UndoLogRecord::new(
            map.name(),
            key,
            written.old,
            Some(new),
            written.cell,
        )));
        Ok(())
    }

    /// Replaces the value of a key visible to this transaction and returns
    /// the previous value.
    pub fn update<K: KeyCodec, T: ValCodec>(
        &mut self,
        map: &TransactionalMap<K, T>,
        key: K,
        value: T,
    ) -> Result<T> {
        self.check_active()?;
        Self::check_payload(map, &key, &value)?;
        self.rewrite(map, key, Some(value))
    }

    /// Deletes a key visible to this transaction and returns its value.
    pub fn delete<K: KeyCodec, T: ValCodec>(
        &mut self,
        map: &TransactionalMap<K, T>,
        key: K,
    ) -> Result<T> {
        self.check_active()?;
        self.rewrite(map, key, None)
    }

    fn rewrite<K: KeyCodec, T: ValCodec>(
        &mut self,
        map: &TransactionalMap<K, T>,
        key: K,
        value: Option<T>,
    ) -> Result<T> {
        let owner = self.id;
        let name = map.name().to_string();
        let new = value.clone();
        let slot: WriteSlot<T> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let f: ComputeFn<TransactionalValue<T>> = Box::new(move |current: Option<&TransactionalValue<T>>| {
            let Some(existing) = current else {
                return Err(StoreError::NotFound);
            };
            if existing.pending_owner().is_some_and(|holder| holder != owner) {
                return Err(StoreError::WriteConflict(name));
            }
            if existing.read(Some(owner)).is_none() {
                return Err(StoreError::NotFound);
            }
            let old = existing
                .write(owner, value)
                .map_err(|_| StoreError::WriteConflict(name))?;
            *out.lock() = Some(Written {
                cell: existing.clone(),
                old,
            });
            Ok(None)
        });
        let written = Self::compute(map, key.clone(), &slot, f)?;
        let previous = written.old.clone().ok_or(StoreError::NotFound)?;
        self.undo.add(Box::new(UndoLogRecord::new(
            map.name(),
            key,
            written.old,
            new,
            written.cell,
        )));
        Ok(previous)
    }

    /// The value of `key` as this transaction sees it.
    pub fn get<K: KeyCodec, T: ValCodec>(
        &self,
        map: &TransactionalMap<K, T>,
        key: &K,
    ) -> Result<Option<T>> {
        Ok(map.get(key)?.and_then(|cell| cell.read(Some(self.id))))
    }

    /// Marks the current position of the undo chain.
    pub fn savepoint(&self) -> usize {
        self.undo.len()
    }

    /// Reverts every write made after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: usize) -> Result<()> {
        self.check_active()?;
        if savepoint > self.undo.len() {
            return Err(StoreError::Invalid("savepoint is beyond the undo chain"));
        }
        self.undo.rollback_to(savepoint, &*self.engine)
    }

    /// Makes every write durable through the redo log, then visible.
    /// A failed redo append rolls the transaction back.
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        let engine = Arc::clone(&self.engine);
        match engine.commit_undo(&mut self.undo) {
            Ok(purges) => {
                self.state = TxState::Committed;
                engine.end_transaction(self.id, self.isolation, purges);
                debug!(tx = %self.id, "txn.commit");
                Ok(())
            }
            Err(err) => {
                warn!(tx = %self.id, error = %err, "txn.commit_failed");
                if let Err(rollback_err) = self.finish_rollback() {
                    warn!(tx = %self.id, error = %rollback_err, "txn.commit_failed.rollback_failed");
                }
                Err(err)
            }
        }
    }

    /// Reverts every write of the transaction.
    pub fn rollback(mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(StoreError::Invalid("transaction is no longer active"));
        }
        self.finish_rollback()
    }

    fn finish_rollback(&mut self) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let result = self.undo.rollback(&*engine);
        self.state = TxState::RolledBack;
        engine.end_transaction(self.id, self.isolation, Vec::new());
        debug!(tx = %self.id, ok = result.is_ok(), "txn.rollback");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            if let Err(err) = self.finish_rollback() {
                warn!(tx = %self.id, error = %err, "txn.drop.rollback_failed");
            }
        }
    }
}
