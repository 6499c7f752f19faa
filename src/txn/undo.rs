//! Per-transaction undo chain.
//!
//! Each write a transaction makes leaves one record holding the value the
//! transaction saw before the write, the value it wrote and the cell it
//! wrote into. Commit walks the chain forward, rollback walks it backwards.
//! Records of maps that were dropped in the meantime are skipped.

use tracing::{trace, warn};

use crate::storage::btree::{BTree, KeyCodec, ValCodec};
use crate::txn::engine::EngineContext;
use crate::txn::redo::encode_record;
use crate::txn::value::TransactionalValue;
use crate::types::Result;

/// Tombstone left by a repeatable-read delete, removed once no
/// repeatable-read transaction is active.
pub struct PendingPurge {
    map: String,
    purge: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl PendingPurge {
    pub fn map_name(&self) -> &str {
        &self.map
    }

    /// Removes the tombstone if it is still there. The size was already
    /// adjusted when the delete committed.
    pub fn run(self) -> Result<()> {
        (self.purge)()
    }
}

/// Object-safe face of [`UndoLogRecord`], so one chain can hold records of
/// maps with different key and value types.
pub trait UndoRecord: Send {
    fn map_name(&self) -> &str;
    fn is_undone(&self) -> bool;
    fn set_undone(&mut self, undone: bool);
    /// Applies the record's effect in memory after the redo append.
    fn commit(&mut self, engine: &dyn EngineContext) -> Result<Option<PendingPurge>>;
    /// Reverts the record's effect.
    fn rollback(&mut self, engine: &dyn EngineContext) -> Result<()>;
    /// Appends the redo record of this write to `out`.
    fn write_for_redo(&self, out: &mut Vec<u8>, engine: &dyn EngineContext) -> Result<()>;
}

/// One write of one transaction.
pub struct UndoLogRecord<K, T> {
    map: String,
    key: K,
    /// Value the transaction saw before the write; `None` marks an insert.
    old: Option<T>,
    /// Value written; `None` marks a delete.
    new: Option<T>,
    cell: TransactionalValue<T>,
    undone: bool,
}

impl<K: KeyCodec, T: ValCodec> UndoLogRecord<K, T> {
    pub fn new(
        map: impl Into<String>,
        key: K,
        old: Option<T>,
        new: Option<T>,
        cell: TransactionalValue<T>,
    ) -> Self {
        Self {
            map: map.into(),
            key,
            old,
            new,
            cell,
            undone: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_insert(&self) -> bool {
        self.old.is_none()
    }

    /// The open map this record belongs to, or `None` once it was dropped.
    fn map(&self, engine: &dyn EngineContext) -> Option<BTree<K, TransactionalValue<T>>> {
        let erased = engine.storage_map(&self.map)?;
        if erased.is_closed() {
            return None;
        }
        match erased.as_any().downcast_ref::<BTree<K, TransactionalValue<T>>>() {
            Some(map) => Some(map.clone()),
            None => {
                warn!(map = %self.map, "txn.undo.map_type_mismatch");
                None
            }
        }
    }

    fn same_cell_predicate(&self) -> Box<dyn Fn(&TransactionalValue<T>) -> bool + Send> {
        let cell = self.cell.clone();
        Box::new(move |current: &TransactionalValue<T>| current.same_cell(&cell))
    }
}

impl<K: KeyCodec, T: ValCodec> UndoRecord for UndoLogRecord<K, T> {
    fn map_name(&self) -> &str {
        &self.map
    }

    fn is_undone(&self) -> bool {
        self.undone
    }

    fn set_undone(&mut self, undone: bool) {
        self.undone = undone;
    }

    /// Several records of one transaction may share a cell; the first one
    /// still finding the cell pending publishes the net effect and the rest
    /// are no-ops. Publishing and its size change happen while saves of the
    /// map are held off, and a physical delete removes the entry before the
    /// cell is published.
    fn commit(&mut self, engine: &dyn EngineContext) -> Result<Option<PendingPurge>> {
        if self.undone {
            return Ok(None);
        }
        let Some(map) = self.map(engine) else {
            return Ok(None);
        };
        if !self.cell.is_pending() {
            return Ok(None);
        }
        let is_insert = self.cell.committed_value().is_none();
        let cell = &self.cell;
        if cell.latest().is_some() {
            map.mutate_in_place(&self.key, || cell.commit(is_insert))?;
            return Ok(None);
        }
        // delete
        if !engine.contains_repeatable_read_transactions() {
            map.remove_if(self.key.clone(), Some(self.same_cell_predicate()), true)?;
            cell.commit(false);
            trace!(map = %self.map, "txn.undo.commit.removed");
            return Ok(None);
        }
        map.mutate_in_place(&self.key, || {
            map.decrement_size();
            cell.commit(false);
        })?;
        let key = self.key.clone();
        let purge_map = map.clone();
        trace!(map = %self.map, "txn.undo.commit.tombstone");
        Ok(Some(PendingPurge {
            map: self.map.clone(),
            purge: Box::new(move || {
                if purge_map.is_closed() {
                    return Ok(());
                }
                purge_map
                    .remove_if(
                        key,
                        Some(Box::new(|current: &TransactionalValue<T>| {
                            current.is_tombstone()
                        })),
                        false,
                    )
                    .map(|_| ())
            }),
        }))
    }

    fn rollback(&mut self, engine: &dyn EngineContext) -> Result<()> {
        if self.undone {
            return Ok(());
        }
        self.undone = true;
        let Some(map) = self.map(engine) else {
            return Ok(());
        };
        if self.old.is_none() && self.cell.depth() <= 1 {
            map.remove_if(self.key.clone(), Some(self.same_cell_predicate()), true)?;
            self.cell.rollback(None);
        } else {
            self.cell.rollback(self.old.clone());
        }
        Ok(())
    }

    fn write_for_redo(&self, out: &mut Vec<u8>, engine: &dyn EngineContext) -> Result<()> {
        if self.undone {
            return Ok(());
        }
        let Some(map) = self.map(engine) else {
            return Ok(());
        };
        if self.old.is_some() {
            map.mark_dirty(&self.key)?;
        }
        encode_record::<K, T>(out, &self.map, &self.key, self.new.as_ref())
    }
}

/// The undo chain of one transaction, in write order.
#[derive(Default)]
pub struct UndoLog {
    records: Vec<Box<dyn UndoRecord>>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: Box<dyn UndoRecord>) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes every live record into one redo buffer.
    pub fn write_for_redo(&self, out: &mut Vec<u8>, engine: &dyn EngineContext) -> Result<()> {
        for record in &self.records {
            record.write_for_redo(out, engine)?;
        }
        Ok(())
    }

    /// Commits every record in order and empties the chain.
    ///
    /// Runs after the redo append, so a record that fails to apply is logged
    /// and skipped: recovery replays it from the redo log.
    pub fn commit(&mut self, engine: &dyn EngineContext) -> Vec<PendingPurge> {
        let mut purges = Vec::new();
        for mut record in self.records.drain(..) {
            match record.commit(engine) {
                Ok(Some(purge)) => purges.push(purge),
                Ok(None) => {}
                Err(err) => {
                    warn!(map = %record.map_name(), error = %err, "txn.undo.commit_failed");
                }
            }
        }
        purges
    }

    /// Rolls back every record, newest first, and empties the chain.
    /// Returns the first error after attempting every record.
    pub fn rollback(&mut self, engine: &dyn EngineContext) -> Result<()> {
        self.rollback_to(0, engine)
    }

    /// Rolls back the records added after `savepoint`, newest first.
    pub fn rollback_to(&mut self, savepoint: usize, engine: &dyn EngineContext) -> Result<()> {
        let mut first_err = None;
        while self.records.len() > savepoint {
            let Some(mut record) = self.records.pop() else {
                break;
            };
            if let Err(err) = record.rollback(engine) {
                warn!(map = %record.map_name(), error = %err, "txn.undo.rollback_failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapOptions;
    use crate::storage::handler::PageOperationHandlerPool;
    use crate::storage::StorageMap;
    use crate::txn::redo::{decode_body, read_records};
    use crate::types::TxId;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    type Map = BTree<u64, TransactionalValue<u64>>;

    const TX: TxId = TxId(9);

    #[derive(Default)]
    struct TestEngine {
        maps: RwLock<HashMap<String, Arc<dyn StorageMap>>>,
        repeatable_read: AtomicBool,
    }

    impl EngineContext for TestEngine {
        fn storage_map(&self, name: &str) -> Option<Arc<dyn StorageMap>> {
            self.maps.read().get(name).cloned()
        }

        fn contains_repeatable_read_transactions(&self) -> bool {
            self.repeatable_read.load(Ordering::SeqCst)
        }
    }

    fn setup() -> Result<(TestEngine, Map)> {
        let map: Map = BTree::in_memory("m", MapOptions::default(), PageOperationHandlerPool::new(1)?)?;
        let engine = TestEngine::default();
        engine
            .maps
            .write()
            .insert("m".into(), Arc::new(map.clone()) as Arc<dyn StorageMap>);
        Ok((engine, map))
    }

    fn insert(map: &Map, key: u64, value: u64) -> Result<UndoLogRecord<u64, u64>> {
        let cell = TransactionalValue::pending_insert(TX, value);
        map.put(key, cell.clone())?;
        Ok(UndoLogRecord::new("m", key, None, Some(value), cell))
    }

    fn write(map: &Map, key: u64, value: Option<u64>) -> Result<UndoLogRecord<u64, u64>> {
        let cell = map.get(&key)?.expect("key present");
        let old = cell.write(TX, value).expect("no conflict");
        Ok(UndoLogRecord::new("m", key, old, value, cell))
    }

    fn visible(map: &Map, key: u64) -> Result<Option<u64>> {
        Ok(map.get(&key)?.and_then(|cell| cell.read(None)))
    }

    #[test]
    fn insert_commit_and_rollback() -> Result<()> {
        let (engine, map) = setup()?;
        let mut log = UndoLog::new();
        log.add(Box::new(insert(&map, 1, 10)?));
        assert!(log.commit(&engine).is_empty());
        assert_eq!(visible(&map, 1)?, Some(10));

        let mut log = UndoLog::new();
        log.add(Box::new(insert(&map, 2, 20)?));
        assert_eq!(map.size(), 2);
        log.rollback(&engine)?;
        assert!(map.get(&2)?.is_none());
        assert_eq!(map.size(), 1);
        assert!(log.is_empty());
        Ok(())
    }

    #[test]
    fn update_rollback_restores_old_value() -> Result<()> {
        let (engine, map) = setup()?;
        map.put(1, TransactionalValue::committed(10))?;
        let mut log = UndoLog::new();
        log.add(Box::new(write(&map, 1, Some(11))?));
        log.add(Box::new(write(&map, 1, Some(12))?));
        assert_eq!(map.get(&1)?.and_then(|c| c.read(Some(TX))), Some(12));
        log.rollback_to(1, &engine)?;
        assert_eq!(map.get(&1)?.and_then(|c| c.read(Some(TX))), Some(11));
        log.rollback(&engine)?;
        assert_eq!(visible(&map, 1)?, Some(10));
        assert!(!map.get(&1)?.expect("present").is_pending());
        Ok(())
    }

    #[test]
    fn delete_without_repeatable_read_removes_physically() -> Result<()> {
        let (engine, map) = setup()?;
        map.put(1, TransactionalValue::committed(10))?;
        let mut log = UndoLog::new();
        log.add(Box::new(write(&map, 1, None)?));
        assert_eq!(map.size(), 1, "size changes at commit");
        assert!(log.commit(&engine).is_empty());
        assert!(map.get(&1)?.is_none());
        assert_eq!(map.size(), 0);
        Ok(())
    }

    #[test]
    fn delete_under_repeatable_read_leaves_tombstone() -> Result<()> {
        let (engine, map) = setup()?;
        engine.repeatable_read.store(true, Ordering::SeqCst);
        map.put(1, TransactionalValue::committed(10))?;
        let mut log = UndoLog::new();
        log.add(Box::new(write(&map, 1, None)?));
        let purges = log.commit(&engine);
        assert_eq!(purges.len(), 1);
        assert_eq!(map.size(), 0);
        assert!(map.get(&1)?.expect("tombstone").is_tombstone());
        assert_eq!(visible(&map, 1)?, None);
        for purge in purges {
            assert_eq!(purge.map_name(), "m");
            purge.run()?;
        }
        assert!(map.get(&1)?.is_none());
        assert_eq!(map.size(), 0, "purge does not change the size again");
        Ok(())
    }

    #[test]
    fn insert_then_delete_in_one_transaction_nets_out() -> Result<()> {
        let (engine, map) = setup()?;
        let mut log = UndoLog::new();
        log.add(Box::new(insert(&map, 1, 10)?));
        log.add(Box::new(write(&map, 1, None)?));
        log.commit(&engine);
        assert!(map.get(&1)?.is_none());
        assert_eq!(map.size(), 0);
        Ok(())
    }

    #[test]
    fn reinsert_after_own_delete_rolls_back_to_original() -> Result<()> {
        let (engine, map) = setup()?;
        map.put(1, TransactionalValue::committed(10))?;
        let mut log = UndoLog::new();
        log.add(Box::new(write(&map, 1, None)?));
        log.add(Box::new(write(&map, 1, Some(11))?));
        log.rollback(&engine)?;
        assert_eq!(visible(&map, 1)?, Some(10));
        assert_eq!(map.size(), 1);
        Ok(())
    }

    #[test]
    fn redo_buffer_holds_every_write() -> Result<()> {
        let (engine, map) = setup()?;
        map.put(1, TransactionalValue::committed(10))?;
        let mut log = UndoLog::new();
        log.add(Box::new(insert(&map, 2, 20)?));
        log.add(Box::new(write(&map, 1, None)?));
        let mut buf = Vec::new();
        log.write_for_redo(&mut buf, &engine)?;
        let (records, _) = read_records(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(decode_body::<u64, u64>(&records[0].body)?, (2, Some(20)));
        assert_eq!(decode_body::<u64, u64>(&records[1].body)?, (1, None));
        assert!(map.dirty_memory_used() > 0);
        Ok(())
    }

    #[test]
    fn dropped_map_records_are_no_ops() -> Result<()> {
        let (engine, map) = setup()?;
        let mut log = UndoLog::new();
        log.add(Box::new(insert(&map, 1, 10)?));
        engine.maps.write().clear();
        let mut buf = Vec::new();
        log.write_for_redo(&mut buf, &engine)?;
        assert!(buf.is_empty());
        log.rollback(&engine)?;
        assert!(map.get(&1)?.is_some(), "untouched once the map is gone");
        Ok(())
    }

    #[test]
    fn undone_records_are_skipped() -> Result<()> {
        let (engine, map) = setup()?;
        let mut record = insert(&map, 1, 10)?;
        record.set_undone(true);
        assert!(record.is_undone());
        assert!(record.commit(&engine)?.is_none());
        assert!(map.get(&1)?.expect("present").is_pending());
        let mut buf = Vec::new();
        record.write_for_redo(&mut buf, &engine)?;
        assert!(buf.is_empty());
        Ok(())
    }
}
