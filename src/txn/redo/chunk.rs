#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::record::{read_records, RedoRecord};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::chunk::list_chunk_ids;
use crate::types::{ChunkId, Result, StoreError};

pub(crate) const REDO_CHUNK_PREFIX: &str = "redoLog_";

/// Path of redo chunk `id` under `dir`.
pub fn redo_chunk_path(dir: &Path, id: ChunkId) -> PathBuf {
    dir.join(format!("{REDO_CHUNK_PREFIX}{}", id.0))
}

/// Redo chunk ids present in `dir`, ascending.
pub fn list_redo_chunks(dir: &Path) -> Result<Vec<ChunkId>> {
    list_chunk_ids(dir, REDO_CHUNK_PREFIX, "")
}

/// One `redoLog_<id>` file. Records are appended at the tracked end offset.
pub struct RedoLogChunk {
    id: ChunkId,
    path: PathBuf,
    io: Arc<dyn FileIo>,
    len: u64,
    unsynced: bool,
    /// Set when the bytes of a failed append could not be cut off again.
    poisoned: bool,
}

impl RedoLogChunk {
    /// Opens chunk `id`, creating the file if needed.
    pub fn open(dir: &Path, id: ChunkId) -> Result<Self> {
        let path = redo_chunk_path(dir, id);
        let io = Arc::new(StdFileIo::open(&path)?);
        Self::with_io(id, path, io)
    }

    /// Opens an existing chunk without write access.
    pub fn open_read_only(dir: &Path, id: ChunkId) -> Result<Self> {
        let path = redo_chunk_path(dir, id);
        let io = Arc::new(StdFileIo::open_read_only(&path)?);
        Self::with_io(id, path, io)
    }

    pub(crate) fn with_io(id: ChunkId, path: PathBuf, io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        Ok(Self {
            id,
            path,
            io,
            len,
            unsynced: false,
            poisoned: false,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads every well-formed record and returns them with the length of
    /// the valid prefix. Reading stops at the first torn record.
    pub fn read_records(&self) -> Result<(Vec<RedoRecord>, u64)> {
        let mut bytes = vec![0u8; self.len as usize];
        self.io.read_at(0, &mut bytes)?;
        let (records, valid) = read_records(&bytes);
        if valid < bytes.len() {
            warn!(
                chunk = self.id.0,
                valid,
                len = bytes.len(),
                "redo.chunk.torn_tail"
            );
        }
        Ok((records, valid as u64))
    }

    /// Cuts the file back to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len >= self.len {
            return Ok(());
        }
        self.io.truncate(len)?;
        self.io.sync_all()?;
        debug!(chunk = self.id.0, from = self.len, to = len, "redo.chunk.truncated");
        self.len = len;
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::Corruption("redo chunk holds a failed append"));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.io.write_at(self.len, bytes)?;
        self.len += bytes.len() as u64;
        self.unsynced = true;
        Ok(())
    }

    /// Cuts the file back to `len` after a failed append or sync, including
    /// bytes a partial write left past the tracked end. When that fails the
    /// chunk refuses further appends.
    pub fn discard_from(&mut self, len: u64) -> Result<()> {
        let cut = self.io.truncate(len).and_then(|()| self.io.sync_all());
        if let Err(err) = cut {
            self.poisoned = true;
            return Err(err);
        }
        debug!(chunk = self.id.0, from = self.len, to = len, "redo.chunk.discarded");
        self.len = len;
        self.unsynced = false;
        Ok(())
    }

    /// Forces appended records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        if self.unsynced {
            self.io.sync_all()?;
            self.unsynced = false;
        }
        Ok(())
    }

    pub fn has_unsynced(&self) -> bool {
        self.unsynced
    }
}
