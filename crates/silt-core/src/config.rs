//! Engine configuration
//!
//! All tunables live on one struct with plain public fields. Paths default
//! to the working directory; `Config::in_dir` rebases them for callers that
//! keep a store under a dedicated directory (tests, mostly).

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SiltError, SiltResult};

/// Silt engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data log path
    pub db_path: PathBuf,
    /// Base index file path
    pub index_path: PathBuf,
    /// WAL path; `None` derives `<index_path>.wal`
    pub wal_path: Option<PathBuf>,
    /// Cadence of the deferred data/index flush; `None` disables the
    /// periodic flush task (explicit `flush()` and `sync_on_write` still work)
    pub flush_interval: Option<Duration>,
    /// Fsync the data log and WAL on every write
    pub sync_on_write: bool,
    /// TTL applied when a write does not specify one
    pub default_ttl: Option<Duration>,
    /// Load all live values into the cache at open
    pub preload: bool,
    /// LRU cap on cached values; `None` is unbounded
    pub max_memory_keys: Option<NonZeroUsize>,
    /// Cadence of the automatic compaction check
    pub compact_interval: Duration,
    /// Minimum wasted-space ratio that triggers automatic compaction
    pub compact_threshold: f64,
    /// Cadence of the periodic checkpoint
    pub checkpoint_interval: Duration,
    /// WAL size that triggers a checkpoint after a flush
    pub wal_size_threshold: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value payload size in bytes
    pub max_value_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("kv.db"),
            index_path: PathBuf::from("kv.index"),
            wal_path: None,
            flush_interval: Some(Duration::from_millis(100)),
            sync_on_write: false,
            default_ttl: None,
            preload: true,
            max_memory_keys: None,
            compact_interval: Duration::from_secs(3600),
            compact_threshold: 0.5,
            checkpoint_interval: Duration::from_secs(600),
            wal_size_threshold: 5 * 1024 * 1024,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Default configuration with all three files placed under `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            db_path: dir.join("kv.db"),
            index_path: dir.join("kv.index"),
            ..Self::default()
        }
    }

    /// The effective WAL path: explicit, or `<index_path>.wal`.
    pub fn wal_path(&self) -> PathBuf {
        match &self.wal_path {
            Some(path) => path.clone(),
            None => {
                let mut name = OsString::from(self.index_path.as_os_str());
                name.push(".wal");
                PathBuf::from(name)
            }
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> SiltResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(SiltError::Config { message: "db_path must not be empty".into() });
        }
        if self.index_path.as_os_str().is_empty() {
            return Err(SiltError::Config { message: "index_path must not be empty".into() });
        }
        if self.db_path == self.index_path
            || self.db_path == self.wal_path()
            || self.index_path == self.wal_path()
        {
            return Err(SiltError::Config {
                message: "db_path, index_path, and wal_path must be distinct files".into(),
            });
        }
        if matches!(self.flush_interval, Some(d) if d.is_zero()) {
            return Err(SiltError::Config {
                message: "flush_interval must be > 0 when set".into(),
            });
        }
        if !(self.compact_threshold > 0.0 && self.compact_threshold <= 1.0) {
            return Err(SiltError::Config {
                message: "compact_threshold must be in (0.0, 1.0]".into(),
            });
        }
        if self.compact_interval.is_zero() || self.checkpoint_interval.is_zero() {
            return Err(SiltError::Config {
                message: "compact_interval and checkpoint_interval must be > 0".into(),
            });
        }
        if self.wal_size_threshold == 0 {
            return Err(SiltError::Config {
                message: "wal_size_threshold must be > 0".into(),
            });
        }
        if self.max_key_size == 0 || self.max_key_size > 64 * 1024 {
            return Err(SiltError::Config {
                message: "max_key_size must be in [1, 64KiB]".into(),
            });
        }
        if self.max_value_size == 0 || self.max_value_size > 256 * 1024 * 1024 {
            return Err(SiltError::Config {
                message: "max_value_size must be in [1, 256MiB]".into(),
            });
        }
        Ok(())
    }
}
