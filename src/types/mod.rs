#![forbid(unsafe_code)]
//! Identifiers, the crate-wide error type, and checksum helpers.

use std::fmt;
use std::io;

use serde::Serialize;

pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Identifier of a page chunk or a redo-log chunk.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Returns the id that follows this one.
    pub fn next(self) -> Self {
        ChunkId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a persisted page: the owning chunk id in the high 32 bits and
/// the byte offset within that chunk file in the low 32 bits.
///
/// `PagePos(0)` means "never persisted". Chunk ids start at 1, so every real
/// position is non-zero.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct PagePos(pub u64);

impl PagePos {
    /// Position of a page that has not been written to any chunk.
    pub const NONE: PagePos = PagePos(0);

    /// Builds a position from its chunk and offset.
    pub fn new(chunk: ChunkId, offset: u32) -> Self {
        PagePos((u64::from(chunk.0) << 32) | u64::from(offset))
    }

    /// Chunk holding the page.
    pub fn chunk(self) -> ChunkId {
        ChunkId((self.0 >> 32) as u32)
    }

    /// Byte offset of the page record inside its chunk file.
    pub fn offset(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Returns true once the page has been written to a chunk.
    pub fn is_persisted(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PagePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk().0, self.offset())
    }
}

/// Transaction identifier handed out by the engine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a page-operation handler (a pool thread or a calling thread).
///
/// Zero is reserved for "no owner".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HandlerId(pub u32);

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("map {0} is closed")]
    Closed(String),
    #[error("map {0} is read-only")]
    ReadOnly(String),
    #[error("operation payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("write conflict on map {0}")]
    WriteConflict(String),
    #[error("duplicate key in map {0}")]
    DuplicateKey(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("handler pool is shut down")]
    Shutdown,
    #[error("not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Duplicates an error so one failure can be delivered to several waiters.
pub fn clone_error(err: &StoreError) -> StoreError {
    match err {
        StoreError::Io(io_err) => StoreError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        StoreError::Corruption(msg) => StoreError::Corruption(msg),
        StoreError::CorruptionOwned(msg) => StoreError::CorruptionOwned(msg.clone()),
        StoreError::Invalid(msg) => StoreError::Invalid(msg),
        StoreError::InvalidOwned(msg) => StoreError::InvalidOwned(msg.clone()),
        StoreError::Config(msg) => StoreError::Config(msg.clone()),
        StoreError::Closed(map) => StoreError::Closed(map.clone()),
        StoreError::ReadOnly(map) => StoreError::ReadOnly(map.clone()),
        StoreError::PayloadTooLarge { size, limit } => StoreError::PayloadTooLarge {
            size: *size,
            limit: *limit,
        },
        StoreError::WriteConflict(map) => StoreError::WriteConflict(map.clone()),
        StoreError::DuplicateKey(map) => StoreError::DuplicateKey(map.clone()),
        StoreError::Unsupported(msg) => StoreError::Unsupported(msg),
        StoreError::Shutdown => StoreError::Shutdown,
        StoreError::NotFound => StoreError::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_pos_packs_chunk_and_offset() {
        let pos = PagePos::new(ChunkId(7), 4096);
        assert_eq!(pos.chunk(), ChunkId(7));
        assert_eq!(pos.offset(), 4096);
        assert!(pos.is_persisted());
        assert!(!PagePos::NONE.is_persisted());
        assert_eq!(pos.to_string(), "7:4096");
    }

    #[test]
    fn clone_error_keeps_variant() {
        let err = StoreError::PayloadTooLarge { size: 10, limit: 4 };
        assert!(matches!(
            clone_error(&err),
            StoreError::PayloadTooLarge { size: 10, limit: 4 }
        ));
        let io_err = StoreError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        match clone_error(&io_err) {
            StoreError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
