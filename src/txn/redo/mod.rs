//! Write-ahead redo log.
//!
//! Committed changes are appended to the live `redoLog_<id>` chunk before
//! they are applied in memory. On startup every chunk is read in ascending
//! id order into a per-map pending list that the map consumes once, when it
//! is first opened. A checkpoint seals the live chunk, saves the maps and
//! then deletes the sealed chunks.

mod chunk;
mod committer;
mod record;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

pub use chunk::{list_redo_chunks, redo_chunk_path, RedoLogChunk};
pub use committer::{RedoCommitConfig, RedoCommitTicket, RedoCommitter};
pub use record::{decode_body, encode_record, read_records, RedoRecord};

use crate::config::StoreConfig;
use crate::storage::btree::{BTree, KeyCodec, ValCodec};
use crate::txn::checkpoint::CheckpointService;
use crate::txn::value::TransactionalValue;
use crate::types::{ChunkId, Result, StoreError};

const REDO_LOG_NAME: &str = "redo log";

/// Replayable records of one map that has not been opened yet.
#[derive(Default)]
struct PendingRedo {
    bodies: Vec<Vec<u8>>,
    /// Chunks holding these records; kept until the map consumes them.
    chunks: BTreeSet<ChunkId>,
}

/// The redo log of one engine.
pub struct RedoLog {
    dir: PathBuf,
    read_only: bool,
    pending: Mutex<HashMap<String, PendingRedo>>,
    live: Arc<Mutex<RedoLogChunk>>,
    committer: RedoCommitter,
    service: Arc<dyn CheckpointService>,
    closed: AtomicBool,
}

impl RedoLog {
    /// Opens the redo directory of `config`, loads every chunk into the
    /// pending lists and makes the newest chunk live, cut back to its last
    /// well-formed record. Starts chunk 0 when the directory is empty.
    pub fn init(config: &StoreConfig, service: Arc<dyn CheckpointService>) -> Result<Self> {
        let dir = config.redo_log_path();
        if !config.read_only {
            fs::create_dir_all(&dir)?;
        }
        let ids = list_redo_chunks(&dir)?;
        let mut pending: HashMap<String, PendingRedo> = HashMap::new();
        let mut live = None;
        for (n, &id) in ids.iter().enumerate() {
            let is_last = n + 1 == ids.len();
            let mut chunk = if config.read_only {
                RedoLogChunk::open_read_only(&dir, id)?
            } else {
                RedoLogChunk::open(&dir, id)?
            };
            let (records, valid) = chunk.read_records()?;
            let count = records.len();
            for record in records {
                let entry = pending.entry(record.map).or_default();
                entry.bodies.push(record.body);
                entry.chunks.insert(id);
            }
            debug!(chunk = id.0, records = count, "redo.init.chunk_loaded");
            if is_last {
                if !config.read_only {
                    chunk.truncate(valid)?;
                }
                live = Some(chunk);
            }
        }
        let live = match live {
            Some(chunk) => chunk,
            None if config.read_only => {
                return Err(StoreError::Config(format!(
                    "redo log {} has no chunks to open read-only",
                    dir.display()
                )))
            }
            None => RedoLogChunk::open(&dir, ChunkId(0))?,
        };
        service.on_new_chunk(live.id());
        info!(
            dir = %dir.display(),
            chunks = ids.len(),
            live = live.id().0,
            pending_maps = pending.len(),
            "redo.init"
        );
        let live = Arc::new(Mutex::new(live));
        let committer = RedoCommitter::new(
            Arc::clone(&live),
            Arc::clone(&service),
            RedoCommitConfig::from_config(config),
        );
        Ok(Self {
            dir,
            read_only: config.read_only,
            pending: Mutex::new(pending),
            live,
            committer,
            service,
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn live_chunk_id(&self) -> ChunkId {
        self.live.lock().id()
    }

    /// Maps with records waiting for [`RedoLog::redo`], sorted by name.
    pub fn pending_maps(&self) -> Vec<String> {
        let mut maps: Vec<_> = self.pending.lock().keys().cloned().collect();
        maps.sort();
        maps
    }

    /// Replays the pending records of `map` into it, once. Returns the number
    /// of records applied.
    ///
    /// Deletes remove the key; puts store the value as committed. Replaying
    /// over state that already contains a record's effect is harmless.
    /// Replay ends at the first record whose body does not decode; the
    /// records before it stay applied. When applying a record fails the
    /// pending records are kept, so a later open of the map replays them.
    pub fn redo<K: KeyCodec, T: ValCodec>(
        &self,
        map: &BTree<K, TransactionalValue<T>>,
    ) -> Result<usize> {
        let Some(entry) = self.pending.lock().remove(map.name()) else {
            return Ok(0);
        };
        match replay_bodies(map, &entry.bodies) {
            Ok(applied) => {
                info!(map = %map.name(), records = applied, "redo.replayed");
                Ok(applied)
            }
            Err(err) => {
                self.pending.lock().insert(map.name().to_string(), entry);
                Err(err)
            }
        }
    }

    /// Appends a commit buffer and waits until it is durable per the sync
    /// mode. This is the durability point of a transaction.
    pub fn commit(&self, buffer: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(REDO_LOG_NAME.into()));
        }
        if self.read_only {
            return Err(StoreError::ReadOnly(REDO_LOG_NAME.into()));
        }
        self.committer.commit(buffer)
    }

    /// Seals the live chunk and starts the next one. Returns the sealed id.
    pub fn save(&self) -> Result<ChunkId> {
        if self.read_only {
            return Err(StoreError::ReadOnly(REDO_LOG_NAME.into()));
        }
        let mut live = self.live.lock();
        live.sync()?;
        let sealed = live.id();
        let next = RedoLogChunk::open(&self.dir, sealed.next())?;
        *live = next;
        drop(live);
        self.service.on_new_chunk(sealed.next());
        debug!(sealed = sealed.0, live = sealed.next().0, "redo.save");
        Ok(sealed)
    }

    /// Asks the checkpoint service to skip its next checkpoint.
    pub fn ignore_checkpoint(&self) {
        self.service.skip_next_checkpoint();
    }

    /// Deletes sealed chunks with id `<= through`. Chunks that still hold
    /// records of maps not opened yet are kept, cut down to those records.
    /// Returns the number deleted.
    pub fn delete_chunks_through(&self, through: ChunkId) -> Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        let live = self.live_chunk_id();
        let pending = self.pending.lock();
        let retained: BTreeSet<ChunkId> = pending
            .values()
            .flat_map(|entry| entry.chunks.iter().copied())
            .collect();
        let mut deleted = 0;
        let mut compacted = 0;
        for id in list_redo_chunks(&self.dir)? {
            if id > through || id >= live {
                continue;
            }
            if retained.contains(&id) {
                if self.retain_pending_records(id, |map| pending.contains_key(map))? {
                    compacted += 1;
                }
                continue;
            }
            match fs::remove_file(redo_chunk_path(&self.dir, id)) {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if deleted > 0 || compacted > 0 {
            debug!(
                through = through.0,
                deleted,
                compacted,
                retained = retained.len(),
                "redo.chunks_deleted"
            );
        }
        Ok(deleted)
    }

    /// Rewrites sealed chunk `id` keeping only the records of maps accepted
    /// by `keep`. Records of maps that were already replayed and saved must
    /// not be replayed over newer saved state after the next restart.
    fn retain_pending_records(&self, id: ChunkId, keep: impl Fn(&str) -> bool) -> Result<bool> {
        let chunk = RedoLogChunk::open_read_only(&self.dir, id)?;
        let (records, _) = chunk.read_records()?;
        drop(chunk);
        let total = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| keep(&r.map)).collect();
        if kept.len() == total {
            return Ok(false);
        }
        let mut bytes = Vec::new();
        for record in &kept {
            record.encode(&mut bytes)?;
        }
        let path = redo_chunk_path(&self.dir, id);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(chunk = id.0, kept = kept.len(), dropped = total - kept.len(), "redo.chunk_compacted");
        Ok(true)
    }

    /// Forgets the pending records of a dropped map.
    pub fn discard_pending(&self, map: &str) {
        if let Some(entry) = self.pending.lock().remove(map) {
            debug!(map, records = entry.bodies.len(), "redo.pending_discarded");
        }
    }

    /// Syncs the live chunk. Later commits fail.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.read_only {
            self.live.lock().sync()?;
        }
        let pending = self.pending.lock().len();
        if pending > 0 {
            warn!(maps = pending, "redo.close.unreplayed_maps");
        }
        info!(dir = %self.dir.display(), "redo.close");
        Ok(())
    }
}

/// Applies `bodies` in order and stops at the first one that does not decode.
fn replay_bodies<K: KeyCodec, T: ValCodec>(
    map: &BTree<K, TransactionalValue<T>>,
    bodies: &[Vec<u8>],
) -> Result<usize> {
    for (n, body) in bodies.iter().enumerate() {
        let (key, value) = match decode_body::<K, T>(body) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    map = %map.name(),
                    record = n,
                    dropped = bodies.len() - n,
                    error = %err,
                    "redo.replay.undecodable_record"
                );
                return Ok(n);
            }
        };
        apply_committed(map, key, value)?;
    }
    Ok(bodies.len())
}

/// Stores a committed put or delete, keeping the size consistent with
/// tombstones left by repeatable-read deletes.
fn apply_committed<K: KeyCodec, T: ValCodec>(
    map: &BTree<K, TransactionalValue<T>>,
    key: K,
    value: Option<T>,
) -> Result<()> {
    let tombstone = map.get(&key)?.is_some_and(|cell| cell.is_tombstone());
    match value {
        Some(value) => {
            map.put(key, TransactionalValue::committed(value))?;
            if tombstone {
                map.increment_size();
            }
        }
        None if tombstone => {
            map.remove_if(key, None, false)?;
        }
        None => {
            map.remove(key)?;
        }
    }
    Ok(())
}

/// Summary of one redo chunk, for inspection tools.
#[derive(Clone, Debug, Serialize)]
pub struct RedoChunkSummary {
    pub id: ChunkId,
    pub bytes: u64,
    pub valid_bytes: u64,
    pub records: usize,
    /// Record count per map name.
    pub maps: Vec<(String, usize)>,
}

/// Reads every redo chunk in `dir` without modifying anything.
pub fn inspect_redo_log(dir: &Path) -> Result<Vec<RedoChunkSummary>> {
    let mut out = Vec::new();
    for id in list_redo_chunks(dir)? {
        let chunk = RedoLogChunk::open_read_only(dir, id)?;
        let (records, valid) = chunk.read_records()?;
        let mut per_map: HashMap<String, usize> = HashMap::new();
        for record in &records {
            *per_map.entry(record.map.clone()).or_default() += 1;
        }
        let mut maps: Vec<_> = per_map.into_iter().collect();
        maps.sort();
        out.push(RedoChunkSummary {
            id,
            bytes: chunk.len(),
            valid_bytes: valid,
            records: records.len(),
            maps,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MapOptions, RedoSyncMode};
    use crate::storage::handler::PageOperationHandlerPool;
    use crate::txn::checkpoint::{CheckpointPolicy, Checkpointer};
    use tempfile::tempdir;

    fn service() -> Arc<Checkpointer> {
        Checkpointer::new(CheckpointPolicy {
            redo_bytes: u64::MAX,
            dirty_memory: usize::MAX,
            period: None,
        })
    }

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir).redo_sync(RedoSyncMode::Instant)
    }

    fn put(out: &mut Vec<u8>, map: &str, key: u64, value: Option<u64>) -> Result<()> {
        encode_record::<u64, u64>(out, map, &key, value.as_ref())
    }

    fn open_map(name: &str) -> Result<BTree<u64, TransactionalValue<u64>>> {
        BTree::in_memory(name, MapOptions::default(), PageOperationHandlerPool::new(1)?)
    }

    #[test]
    fn empty_directory_starts_chunk_zero() -> Result<()> {
        let dir = tempdir().unwrap();
        let cp = service();
        let log = RedoLog::init(&config(dir.path()), cp.clone())?;
        assert_eq!(log.live_chunk_id(), ChunkId(0));
        assert_eq!(cp.live_chunk(), ChunkId(0));
        assert!(log.dir().join("redoLog_0").exists());
        Ok(())
    }

    #[test]
    fn replays_chunks_in_id_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(10))?;
            put(&mut buf, "m", 2, Some(20))?;
            log.commit(buf)?;
            log.save()?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(11))?;
            put(&mut buf, "m", 2, None)?;
            put(&mut buf, "other", 5, Some(50))?;
            log.commit(buf)?;
            log.close()?;
        }
        let log = RedoLog::init(&cfg, service())?;
        assert_eq!(log.live_chunk_id(), ChunkId(1));
        assert_eq!(log.pending_maps(), vec!["m".to_string(), "other".to_string()]);
        let map = open_map("m")?;
        assert_eq!(log.redo(&map)?, 4);
        assert_eq!(map.get(&1)?.and_then(|c| c.read(None)), Some(11));
        assert!(map.get(&2)?.is_none());
        assert_eq!(map.size(), 1);
        assert_eq!(log.redo(&map)?, 0, "pending entries are consumed once");
        Ok(())
    }

    #[test]
    fn replay_is_idempotent() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(10))?;
            put(&mut buf, "m", 2, Some(20))?;
            put(&mut buf, "m", 2, None)?;
            log.commit(buf)?;
        }
        let map = open_map("m")?;
        for _ in 0..2 {
            let log = RedoLog::init(&cfg, service())?;
            log.redo(&map)?;
        }
        assert_eq!(map.size(), 1);
        assert_eq!(map.get(&1)?.and_then(|c| c.read(None)), Some(10));
        Ok(())
    }

    #[test]
    fn replay_stops_at_an_undecodable_record() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            for key in 1..=3u64 {
                let mut buf = Vec::new();
                put(&mut buf, "m", key, Some(key * 10))?;
                log.commit(buf)?;
            }
            log.close()?;
        }
        let mut value = Vec::new();
        u64::encode_val(&30, &mut value);
        let path = cfg.redo_log_path().join("redoLog_0");
        let mut bytes = fs::read(&path)?;
        let tag = bytes.len() - value.len() - 1;
        assert_eq!(bytes[tag], 1);
        bytes[tag] = 7;
        fs::write(&path, &bytes)?;

        let log = RedoLog::init(&cfg, service())?;
        let map = open_map("m")?;
        assert_eq!(log.redo(&map)?, 2);
        assert_eq!(map.size(), 2);
        assert_eq!(map.get(&2)?.and_then(|c| c.read(None)), Some(20));
        assert!(map.get(&3)?.is_none());
        assert!(log.pending_maps().is_empty());
        Ok(())
    }

    #[test]
    fn failed_replay_keeps_the_pending_records() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(10))?;
            put(&mut buf, "m", 2, Some(20))?;
            log.commit(buf)?;
        }
        let log = RedoLog::init(&cfg, service())?;
        let closed = open_map("m")?;
        closed.close()?;
        assert!(matches!(log.redo(&closed), Err(StoreError::Closed(_))));
        assert_eq!(log.pending_maps(), vec!["m".to_string()]);

        let sealed = log.save()?;
        assert_eq!(log.delete_chunks_through(sealed)?, 0, "chunk still pending");

        let map = open_map("m")?;
        assert_eq!(log.redo(&map)?, 2);
        assert_eq!(map.size(), 2);
        Ok(())
    }

    #[test]
    fn torn_tail_of_live_chunk_is_truncated() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut buf = Vec::new();
        put(&mut buf, "m", 1, Some(10))?;
        let valid = buf.len() as u64;
        {
            let log = RedoLog::init(&cfg, service())?;
            log.commit(buf.clone())?;
        }
        let path = cfg.redo_log_path().join("redoLog_0");
        let mut file = fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&buf[..buf.len() - 2])?;
        drop(file);

        let log = RedoLog::init(&cfg, service())?;
        assert_eq!(fs::metadata(&path)?.len(), valid);
        let mut more = Vec::new();
        put(&mut more, "m", 2, Some(20))?;
        log.commit(more)?;
        drop(log);

        let log = RedoLog::init(&cfg, service())?;
        let map = open_map("m")?;
        assert_eq!(log.redo(&map)?, 2);
        assert_eq!(map.size(), 2);
        Ok(())
    }

    #[test]
    fn sealed_chunks_are_deleted_unless_pending() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            let mut buf = Vec::new();
            put(&mut buf, "unopened", 1, Some(1))?;
            log.commit(buf)?;
            log.save()?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(1))?;
            log.commit(buf)?;
        }
        let log = RedoLog::init(&cfg, service())?;
        let map = open_map("m")?;
        log.redo(&map)?;
        let sealed = log.save()?;
        assert_eq!(sealed, ChunkId(1));
        assert_eq!(log.delete_chunks_through(sealed)?, 1);
        assert_eq!(list_redo_chunks(log.dir())?, vec![ChunkId(0), ChunkId(2)]);

        log.discard_pending("unopened");
        assert_eq!(log.delete_chunks_through(sealed)?, 1);
        assert_eq!(list_redo_chunks(log.dir())?, vec![ChunkId(2)]);
        Ok(())
    }

    #[test]
    fn retained_chunks_drop_records_of_replayed_maps() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = RedoLog::init(&cfg, service())?;
            let mut buf = Vec::new();
            put(&mut buf, "m", 1, Some(1))?;
            put(&mut buf, "unopened", 1, Some(1))?;
            log.commit(buf)?;
        }
        let log = RedoLog::init(&cfg, service())?;
        let map = open_map("m")?;
        log.redo(&map)?;
        let sealed = log.save()?;
        assert_eq!(log.delete_chunks_through(sealed)?, 0);
        drop(log);

        let summary = inspect_redo_log(&cfg.redo_log_path())?;
        assert_eq!(summary[0].id, ChunkId(0));
        assert_eq!(summary[0].maps, vec![("unopened".to_string(), 1)]);
        let log = RedoLog::init(&cfg, service())?;
        assert_eq!(log.pending_maps(), vec!["unopened".to_string()]);
        Ok(())
    }

    #[test]
    fn ignore_checkpoint_reaches_the_service() -> Result<()> {
        let dir = tempdir().unwrap();
        let cp = Checkpointer::new(CheckpointPolicy {
            redo_bytes: 1,
            dirty_memory: usize::MAX,
            period: None,
        });
        let log = RedoLog::init(&config(dir.path()), cp.clone())?;
        let mut buf = Vec::new();
        put(&mut buf, "m", 1, Some(1))?;
        log.commit(buf)?;
        assert!(cp.is_due(0));
        log.ignore_checkpoint();
        assert!(!cp.should_run(0));
        Ok(())
    }

    #[test]
    fn commit_after_close_fails() -> Result<()> {
        let dir = tempdir().unwrap();
        let log = RedoLog::init(&config(dir.path()), service())?;
        log.close()?;
        let err = log.commit(vec![1]).unwrap_err();
        assert!(matches!(err, StoreError::Closed(_)));
        Ok(())
    }

    #[test]
    fn inspection_reports_per_map_counts() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let log = RedoLog::init(&cfg, service())?;
        let mut buf = Vec::new();
        put(&mut buf, "a", 1, Some(1))?;
        put(&mut buf, "b", 1, None)?;
        put(&mut buf, "a", 2, Some(1))?;
        log.commit(buf)?;
        let summary = inspect_redo_log(log.dir())?;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].records, 3);
        assert_eq!(summary[0].maps, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
        assert_eq!(summary[0].bytes, summary[0].valid_bytes);
        Ok(())
    }
}
