#![forbid(unsafe_code)]
//! Append-only page chunks of a single map.
//!
//! A chunk file `c_<id>.db` holds framed page records followed by a footer
//! and the footer length:
//!
//! ```text
//! [len u32][crc u32][page body] ... [footer][footer_len u32]
//! ```
//!
//! The footer names the root page, the map size, the largest sequence key and
//! the live-page count of every chunk still referenced by the tree. On open
//! the newest chunk with a valid footer wins; newer torn chunks and chunks
//! absent from its live table are deleted.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::bytes::{var, ReadBuffer};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::{compute_crc32, page_record_crc32};
use crate::types::{ChunkId, PagePos, Result, StoreError};

const CHUNK_PREFIX: &str = "c_";
const CHUNK_SUFFIX: &str = ".db";
const FOOTER_MAGIC: [u8; 4] = *b"AOCK";
const FOOTER_VERSION: u16 = 1;
const RECORD_HEADER_LEN: usize = 8;
const MAX_CHUNK_ID: u32 = (1 << 31) - 1;

/// Lists `<prefix><id><suffix>` files in `dir`, sorted by ascending id.
/// Names that do not parse are ignored.
pub(crate) fn list_chunk_ids(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<ChunkId>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(prefix) else { continue };
        let Some(digits) = rest.strip_suffix(suffix) else { continue };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(id) = digits.parse::<u32>() {
            ids.push(ChunkId(id));
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Path of page chunk `id` under `dir`.
pub fn chunk_file_path(dir: &Path, id: ChunkId) -> PathBuf {
    dir.join(format!("{CHUNK_PREFIX}{}{CHUNK_SUFFIX}", id.0))
}

/// Metadata stored at the tail of every chunk.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ChunkFooter {
    pub id: ChunkId,
    pub root_pos: PagePos,
    pub map_size: u64,
    /// Largest sequence key written to the map, 0 when none.
    pub max_seq: u64,
    pub page_count: u32,
    /// Bytes of page records preceding the footer.
    pub body_len: u64,
    /// Live page count of every chunk referenced by this chunk's tree,
    /// including this chunk.
    pub live: Vec<(ChunkId, u32)>,
}

impl ChunkFooter {
    fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&FOOTER_MAGIC);
        out.extend_from_slice(&FOOTER_VERSION.to_be_bytes());
        out.extend_from_slice(&self.id.0.to_be_bytes());
        out.extend_from_slice(&self.root_pos.0.to_be_bytes());
        out.extend_from_slice(&self.map_size.to_be_bytes());
        out.extend_from_slice(&self.max_seq.to_be_bytes());
        out.extend_from_slice(&self.page_count.to_be_bytes());
        out.extend_from_slice(&self.body_len.to_be_bytes());
        var::encode_u64(self.live.len() as u64, out);
        for (id, count) in &self.live {
            out.extend_from_slice(&id.0.to_be_bytes());
            out.extend_from_slice(&count.to_be_bytes());
        }
        let crc = compute_crc32(&[&out[start..]]);
        out.extend_from_slice(&crc.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 4 {
            return Err(StoreError::Corruption("chunk footer truncated"));
        }
        let (body, crc) = src.split_at(src.len() - 4);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(crc);
        if compute_crc32(&[body]) != u32::from_be_bytes(raw) {
            return Err(StoreError::Corruption("chunk footer crc mismatch"));
        }
        let mut cur = ReadBuffer::new(body);
        if cur.get_slice(4)? != FOOTER_MAGIC {
            return Err(StoreError::Corruption("chunk footer magic mismatch"));
        }
        let mut version = [0u8; 2];
        version.copy_from_slice(cur.get_slice(2)?);
        if u16::from_be_bytes(version) != FOOTER_VERSION {
            return Err(StoreError::Corruption("chunk format version mismatch"));
        }
        let id = ChunkId(cur.get_u32()?);
        let root_pos = PagePos(cur.get_u64()?);
        let map_size = cur.get_u64()?;
        let max_seq = cur.get_u64()?;
        let page_count = cur.get_u32()?;
        let body_len = cur.get_u64()?;
        let live_len = cur.get_var_u64()?;
        if live_len > body.len() as u64 {
            return Err(StoreError::Corruption("chunk live table length"));
        }
        let mut live = Vec::with_capacity(live_len as usize);
        for _ in 0..live_len {
            live.push((ChunkId(cur.get_u32()?), cur.get_u32()?));
        }
        if !cur.is_empty() {
            return Err(StoreError::Corruption("trailing bytes in chunk footer"));
        }
        Ok(Self {
            id,
            root_pos,
            map_size,
            max_seq,
            page_count,
            body_len,
            live,
        })
    }
}

/// Page records of a chunk that has not been written yet.
///
/// Positions handed out by [`ChunkWriter::push_page`] are final: the record
/// lands at exactly that offset once the chunk is committed.
pub struct ChunkWriter {
    id: ChunkId,
    body: Vec<u8>,
    page_count: u32,
}

impl ChunkWriter {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Frames `page_body` and returns its position.
    pub fn push_page(&mut self, page_body: &[u8]) -> Result<PagePos> {
        let offset = u32::try_from(self.body.len())
            .map_err(|_| StoreError::Invalid("chunk exceeds 4 GiB"))?;
        let len = u32::try_from(page_body.len())
            .map_err(|_| StoreError::Invalid("page record exceeds 4 GiB"))?;
        self.body.extend_from_slice(&len.to_be_bytes());
        self.body
            .extend_from_slice(&page_record_crc32(self.id.0, page_body).to_be_bytes());
        self.body.extend_from_slice(page_body);
        self.page_count += 1;
        Ok(PagePos::new(self.id, offset))
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }
}

/// Map-level values recorded in the footer of a new chunk.
#[derive(Clone, Copy, Debug)]
pub struct ChunkCommit {
    pub root_pos: PagePos,
    pub map_size: u64,
    pub max_seq: u64,
}

#[derive(Default)]
struct ChunkState {
    /// Live page count per chunk on disk.
    live: BTreeMap<ChunkId, u32>,
    file_len: HashMap<ChunkId, u64>,
    last: Option<ChunkFooter>,
    next_id: ChunkId,
    /// Set by `clear`: every existing chunk is garbage after the next commit.
    drop_all: bool,
}

/// Owns the chunk files of one map and their live-page accounting.
pub struct ChunkManager {
    dir: PathBuf,
    read_only: bool,
    state: Mutex<ChunkState>,
    removals: Mutex<Vec<PagePos>>,
    readers: Mutex<HashMap<ChunkId, Arc<StdFileIo>>>,
}

impl ChunkManager {
    /// Opens (creating if needed) the chunk directory and recovers the last
    /// committed chunk.
    pub fn open(dir: impl Into<PathBuf>, read_only: bool) -> Result<Self> {
        let dir = dir.into();
        if !read_only {
            fs::create_dir_all(&dir)?;
        }
        let ids = list_chunk_ids(&dir, CHUNK_PREFIX, CHUNK_SUFFIX)?;
        let mut state = ChunkState {
            next_id: ChunkId(1),
            ..ChunkState::default()
        };
        let mut torn = Vec::new();
        for id in ids.iter().rev().copied() {
            match read_footer(&dir, id) {
                Ok(footer) => {
                    state.last = Some(footer);
                    break;
                }
                Err(err) => {
                    warn!(chunk = id.0, error = %err, "chunk.open.torn_chunk");
                    torn.push(id);
                }
            }
        }
        if let Some(last) = &state.last {
            state.next_id = last.id.next();
            state.live = last.live.iter().copied().collect();
            if !state.live.contains_key(&last.id) {
                state.live.insert(last.id, last.page_count);
            }
        } else if let Some(newest) = ids.last() {
            state.next_id = newest.next();
        }
        let mut stale = torn;
        for id in &ids {
            let referenced = state.live.contains_key(id);
            let newer_than_last = state.last.as_ref().map_or(true, |l| *id > l.id);
            if !referenced && !newer_than_last {
                stale.push(*id);
            }
        }
        for id in ids.iter().copied() {
            if state.live.contains_key(&id) {
                let len = fs::metadata(chunk_file_path(&dir, id))?.len();
                state.file_len.insert(id, len);
            }
        }
        if !read_only {
            for id in stale {
                fs::remove_file(chunk_file_path(&dir, id))?;
                debug!(chunk = id.0, "chunk.open.removed_stale");
            }
        }
        debug!(
            dir = %dir.display(),
            last = state.last.as_ref().map(|l| l.id.0),
            chunks = state.live.len(),
            "chunk.open"
        );
        Ok(Self {
            dir,
            read_only,
            state: Mutex::new(state),
            removals: Mutex::new(Vec::new()),
            readers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Footer of the newest committed chunk.
    pub fn last_chunk(&self) -> Option<ChunkFooter> {
        self.state.lock().last.clone()
    }

    /// Ids of chunk files currently kept on disk, ascending.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.state.lock().live.keys().copied().collect()
    }

    /// Live page count of `id`, if the chunk is tracked.
    pub fn live_pages(&self, id: ChunkId) -> Option<u32> {
        self.state.lock().live.get(&id).copied()
    }

    pub fn disk_space_used(&self) -> u64 {
        self.state.lock().file_len.values().sum()
    }

    /// Reads and verifies the page record at `pos`, returning its body.
    pub fn read_page(&self, pos: PagePos) -> Result<Vec<u8>> {
        let chunk = pos.chunk();
        let reader = self.reader(chunk)?;
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader.read_at(u64::from(pos.offset()), &mut header)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&header[..4]);
        let len = u32::from_be_bytes(raw) as usize;
        raw.copy_from_slice(&header[4..]);
        let crc = u32::from_be_bytes(raw);
        let mut body = vec![0u8; len];
        reader.read_at(u64::from(pos.offset()) + RECORD_HEADER_LEN as u64, &mut body)?;
        if page_record_crc32(chunk.0, &body) != crc {
            return Err(StoreError::CorruptionOwned(format!(
                "page record crc mismatch at {pos}"
            )));
        }
        Ok(body)
    }

    fn reader(&self, id: ChunkId) -> Result<Arc<StdFileIo>> {
        let mut readers = self.readers.lock();
        if let Some(io) = readers.get(&id) {
            return Ok(Arc::clone(io));
        }
        let io = Arc::new(StdFileIo::open_read_only(chunk_file_path(&self.dir, id))?);
        readers.insert(id, Arc::clone(&io));
        Ok(io)
    }

    /// Records that the page stored at `pos` is no longer reachable.
    /// Applied to the live table at the next commit.
    pub fn register_removal(&self, pos: PagePos) {
        if pos.is_persisted() {
            self.removals.lock().push(pos);
        }
    }

    /// Removals registered since the last commit.
    pub fn pending_removals(&self) -> usize {
        self.removals.lock().len()
    }

    /// Takes the removals registered so far. Called while the tree is
    /// frozen so the drained set matches the snapshot being written.
    pub fn take_removals(&self) -> Vec<PagePos> {
        std::mem::take(&mut *self.removals.lock())
    }

    /// Marks every existing chunk as garbage once the next chunk commits.
    pub fn drop_all_on_next_commit(&self) {
        self.state.lock().drop_all = true;
        self.removals.lock().clear();
    }

    /// Starts a new chunk with the next id.
    pub fn begin_chunk(&self) -> Result<ChunkWriter> {
        let id = self.state.lock().next_id;
        if id.0 > MAX_CHUNK_ID {
            return Err(StoreError::Invalid("chunk id space exhausted"));
        }
        Ok(ChunkWriter {
            id,
            body: Vec::new(),
            page_count: 0,
        })
    }

    /// Writes `writer` as a new chunk, applies `removals` and deletes chunks
    /// left without live pages.
    pub fn commit(
        &self,
        writer: ChunkWriter,
        meta: ChunkCommit,
        removals: Vec<PagePos>,
    ) -> Result<ChunkFooter> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.dir.display().to_string()));
        }
        let ChunkWriter {
            id,
            body,
            page_count,
        } = writer;
        let mut state = self.state.lock();
        if id != state.next_id {
            return Err(StoreError::Invalid("chunk committed out of order"));
        }
        let mut live = state.live.clone();
        if state.drop_all {
            for count in live.values_mut() {
                *count = 0;
            }
        } else {
            for pos in &removals {
                if let Some(count) = live.get_mut(&pos.chunk()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        live.insert(id, page_count);
        let last_id = id;
        let footer = ChunkFooter {
            id,
            root_pos: meta.root_pos,
            map_size: meta.map_size,
            max_seq: meta.max_seq,
            page_count,
            body_len: body.len() as u64,
            live: live
                .iter()
                .filter(|(cid, count)| **count > 0 || **cid == last_id)
                .map(|(cid, count)| (*cid, *count))
                .collect(),
        };
        let mut file_bytes = body;
        let footer_start = file_bytes.len();
        footer.encode(&mut file_bytes);
        let footer_len = u32::try_from(file_bytes.len() - footer_start)
            .map_err(|_| StoreError::Invalid("chunk footer exceeds 4 GiB"))?;
        file_bytes.extend_from_slice(&footer_len.to_be_bytes());

        let path = chunk_file_path(&self.dir, id);
        let io = StdFileIo::open(&path)?;
        io.truncate(0)?;
        io.write_at(0, &file_bytes)?;
        io.sync_all()?;
        sync_dir(&self.dir)?;

        let dead: Vec<ChunkId> = live
            .iter()
            .filter(|(cid, count)| **count == 0 && **cid != last_id)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in &dead {
            live.remove(cid);
        }
        state.live = live;
        state.file_len.insert(id, file_bytes.len() as u64);
        state.last = Some(footer.clone());
        state.next_id = id.next();
        state.drop_all = false;
        for cid in &dead {
            state.file_len.remove(cid);
        }
        drop(state);

        {
            let mut readers = self.readers.lock();
            for cid in &dead {
                readers.remove(cid);
            }
        }
        for cid in &dead {
            match fs::remove_file(chunk_file_path(&self.dir, *cid)) {
                Ok(()) => debug!(chunk = cid.0, "chunk.reclaim.deleted"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(
            chunk = id.0,
            pages = page_count,
            bytes = file_bytes.len(),
            reclaimed = dead.len(),
            "chunk.commit.written"
        );
        Ok(footer)
    }

    /// Deletes every chunk file and the map directory.
    pub fn remove_all(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.dir.display().to_string()));
        }
        self.readers.lock().clear();
        self.removals.lock().clear();
        let mut state = self.state.lock();
        state.live.clear();
        state.file_len.clear();
        state.last = None;
        drop(state);
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_footer(dir: &Path, id: ChunkId) -> Result<ChunkFooter> {
    let io = StdFileIo::open_read_only(chunk_file_path(dir, id))?;
    let len = io.len()?;
    if len < 4 {
        return Err(StoreError::Corruption("chunk file shorter than footer"));
    }
    let mut raw = [0u8; 4];
    io.read_at(len - 4, &mut raw)?;
    let footer_len = u64::from(u32::from_be_bytes(raw));
    if footer_len + 4 > len {
        return Err(StoreError::Corruption("chunk footer length out of range"));
    }
    let mut buf = vec![0u8; footer_len as usize];
    io.read_at(len - 4 - footer_len, &mut buf)?;
    let footer = ChunkFooter::decode(&buf)?;
    if footer.id != id {
        return Err(StoreError::Corruption("chunk footer id does not match file"));
    }
    if footer.body_len + footer_len + 4 != len {
        return Err(StoreError::Corruption("chunk body length mismatch"));
    }
    Ok(footer)
}

/// Summary of one chunk file, as reported by the inspection CLI.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChunkSummary {
    pub id: ChunkId,
    pub file_len: u64,
    /// `None` when the footer is torn or corrupt.
    pub footer: Option<ChunkFooter>,
    pub error: Option<String>,
}

/// Reads the footer of every chunk file in `dir` without modifying anything.
pub fn inspect_chunks(dir: &Path) -> Result<Vec<ChunkSummary>> {
    let mut out = Vec::new();
    for id in list_chunk_ids(dir, CHUNK_PREFIX, CHUNK_SUFFIX)? {
        let file_len = fs::metadata(chunk_file_path(dir, id))?.len();
        let (footer, error) = match read_footer(dir, id) {
            Ok(footer) => (Some(footer), None),
            Err(err) => (None, Some(err.to_string())),
        };
        out.push(ChunkSummary {
            id,
            file_len,
            footer,
            error,
        });
    }
    Ok(out)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
