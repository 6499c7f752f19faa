#![forbid(unsafe_code)]
//! Engine and per-map configuration.
//!
//! [`StoreConfig`] is plain serde data so it can be embedded in a larger TOML
//! document or loaded from a file with [`StoreConfig::from_toml_file`].
//! Validation runs before any chunk or redo file is touched.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Result, StoreError};

/// Default name of the redo-log directory under `base_dir`.
pub const DEFAULT_REDO_LOG_DIR: &str = "redo_log";

const MIN_PAGE_SPLIT_SIZE: usize = 256;

/// When the redo committer forces appended records to stable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedoSyncMode {
    /// fsync every commit batch before acknowledging it.
    #[default]
    Instant,
    /// fsync at most once per `redo_sync_period_ms`.
    Periodic,
    /// Never fsync; durability is left to the OS.
    NoSync,
}

/// Engine-wide settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding one sub-directory per map plus the redo log.
    pub base_dir: PathBuf,
    /// Redo-log directory name, relative to `base_dir`.
    pub redo_log_dir: String,
    /// Estimated in-memory page size above which a page is split.
    pub page_split_size: usize,
    /// Per-map memory budget before clean leaf pages are evicted.
    pub cache_size: usize,
    /// Dirty memory across all maps that makes a checkpoint due.
    pub dirty_memory_threshold: usize,
    /// Redo bytes appended since the last checkpoint that make one due.
    pub redo_checkpoint_bytes: u64,
    /// Period of the background checkpoint worker; `None` disables it.
    pub checkpoint_period_ms: Option<u64>,
    pub redo_sync: RedoSyncMode,
    pub redo_sync_period_ms: u64,
    /// Upper bound on commits coalesced into one redo append.
    pub redo_batch_max_commits: usize,
    /// How long the redo committer waits for more commits to join a batch.
    pub redo_batch_max_wait_us: u64,
    /// Number of page-operation handler threads.
    pub handler_threads: usize,
    /// Largest key plus value footprint accepted by a single page operation.
    pub max_payload_size: usize,
    pub read_only: bool,
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::new(),
            redo_log_dir: DEFAULT_REDO_LOG_DIR.to_string(),
            page_split_size: 16 * 1024,
            cache_size: 32 * 1024 * 1024,
            dirty_memory_threshold: 8 * 1024 * 1024,
            redo_checkpoint_bytes: 32 * 1024 * 1024,
            checkpoint_period_ms: None,
            redo_sync: RedoSyncMode::Instant,
            redo_sync_period_ms: 50,
            redo_batch_max_commits: 32,
            redo_batch_max_wait_us: 200,
            handler_threads: default_handler_threads(),
            max_payload_size: 16 * 1024 * 1024,
            read_only: false,
            in_memory: false,
        }
    }
}

fn default_handler_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

impl StoreConfig {
    /// Creates a configuration rooted at `base_dir` with default settings.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| StoreError::Config(err.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| StoreError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn redo_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.redo_log_dir = dir.into();
        self
    }

    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn redo_sync(mut self, mode: RedoSyncMode) -> Self {
        self.redo_sync = mode;
        self
    }

    pub fn handler_threads(mut self, threads: usize) -> Self {
        self.handler_threads = threads;
        self
    }

    pub fn checkpoint_period(mut self, period: Option<Duration>) -> Self {
        self.checkpoint_period_ms = period.map(|p| p.as_millis() as u64);
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Checks every setting that would otherwise fail later, mid-startup.
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("base_dir is not set".into()));
        }
        if self.base_dir.exists() && !self.base_dir.is_dir() {
            return Err(StoreError::Config(format!(
                "base_dir {} is not a directory",
                self.base_dir.display()
            )));
        }
        validate_dir_name("redo_log_dir", &self.redo_log_dir)?;
        if self.page_split_size < MIN_PAGE_SPLIT_SIZE {
            return Err(StoreError::Config(format!(
                "page_split_size must be at least {MIN_PAGE_SPLIT_SIZE} bytes"
            )));
        }
        if self.handler_threads == 0 {
            return Err(StoreError::Config("handler_threads must be positive".into()));
        }
        if self.max_payload_size == 0 {
            return Err(StoreError::Config("max_payload_size must be positive".into()));
        }
        if self.redo_batch_max_commits == 0 {
            return Err(StoreError::Config(
                "redo_batch_max_commits must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the redo-log chunks.
    pub fn redo_log_path(&self) -> PathBuf {
        self.base_dir.join(&self.redo_log_dir)
    }

    /// Directory holding the page chunks of `map_name`.
    pub fn map_path(&self, map_name: &str) -> PathBuf {
        self.base_dir.join(map_name)
    }

    /// Default per-map options derived from the engine settings.
    pub fn map_options(&self) -> MapOptions {
        MapOptions {
            read_only: self.read_only,
            in_memory: self.in_memory,
            page_split_size: self.page_split_size,
            cache_size: self.cache_size,
            max_payload_size: self.max_payload_size,
        }
    }
}

/// Rejects names that would escape `base_dir` or collide with path syntax.
pub(crate) fn validate_dir_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::Config(format!("{what} is empty")));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::Config(format!(
            "{what} {name:?} must be a single relative path component"
        ))),
    }
}

/// Settings of a single map.
#[derive(Clone, Debug)]
pub struct MapOptions {
    pub read_only: bool,
    /// Keep the map purely in memory; `save` becomes a no-op.
    pub in_memory: bool,
    pub page_split_size: usize,
    pub cache_size: usize,
    pub max_payload_size: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        StoreConfig::default().map_options()
    }
}

impl MapOptions {
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_base_dir_is_a_config_error() {
        let err = StoreConfig::default().validate().unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn base_dir_pointing_at_file_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        fs::write(&file, b"x")?;
        let err = StoreConfig::new(&file).validate().unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        Ok(())
    }

    #[test]
    fn redo_dir_must_stay_under_base_dir() {
        let cfg = StoreConfig::new("/tmp/aostore").redo_log_dir("../escape");
        assert!(cfg.validate().is_err());
        let cfg = StoreConfig::new("/tmp/aostore").redo_log_dir("");
        assert!(cfg.validate().is_err());
        let cfg = StoreConfig::new("/tmp/aostore");
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.redo_log_path(),
            PathBuf::from("/tmp/aostore").join(DEFAULT_REDO_LOG_DIR)
        );
    }

    #[test]
    fn toml_overrides_defaults() -> Result<()> {
        let cfg = StoreConfig::from_toml_str(
            r#"
            base_dir = "/var/lib/aostore"
            redo_log_dir = "wal"
            page_split_size = 4096
            redo_sync = "no_sync"
            checkpoint_period_ms = 1000
            "#,
        )?;
        assert_eq!(cfg.base_dir, PathBuf::from("/var/lib/aostore"));
        assert_eq!(cfg.redo_log_dir, "wal");
        assert_eq!(cfg.page_split_size, 4096);
        assert_eq!(cfg.redo_sync, RedoSyncMode::NoSync);
        assert_eq!(cfg.checkpoint_period_ms, Some(1000));
        assert_eq!(cfg.cache_size, StoreConfig::default().cache_size);
        Ok(())
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = StoreConfig::from_toml_str("page_split_size = \"big\"").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
