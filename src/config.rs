use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errinput;
use crate::error::Result;
use crate::sstable::block::ENTRY_HEADER_SIZE;
use crate::sstable::filter::FilterPolicy;

/// Read-path mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every lookup goes through the block-index path.
    Conventional,
    /// Lookups use the learned path whenever a trained model covers the file.
    Learned,
    /// Learned path, with models retrained by the compaction path as files
    /// are rewritten.
    Adaptive,
}

impl Mode {
    /// Whether this mode consults the model registry at all.
    pub fn uses_model(&self) -> bool {
        matches!(self, Mode::Learned | Mode::Adaptive)
    }
}

/// Configuration for the table-cache read path.
#[derive(Clone)]
pub struct Config {
    /// Directory containing the table files.
    pub dir: PathBuf,

    /// Handle-cache capacity, in open tables (default: 1024).
    pub cache_entries: usize,

    /// File+filter-cache capacity, sized against the process FD limit
    /// (default: 512).
    pub fd_limit: usize,

    /// Whether to load and consult per-block filters (default: true).
    pub use_filter: bool,

    /// Filter policy; its name keys the metaindex entry. No policy means
    /// tables are written and read without filter blocks.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Entries per data block (default: 64).
    pub block_num_entries: usize,

    /// Byte stride between data block starts (default: 4096).
    pub block_size: usize,

    /// Fixed encoded size of one entry, header included (default: 32).
    pub entry_size: usize,

    /// Read-path mode (default: Conventional).
    pub mode: Mode,

    /// PLR training tolerance, in entry positions (default: 8.0).
    pub gamma: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            cache_entries: 1024,
            fd_limit: 512,
            use_filter: true,
            filter_policy: None,
            block_num_entries: 64,
            block_size: 4096,
            entry_size: 32,
            mode: Mode::Conventional,
            gamma: 8.0,
        }
    }
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set handle-cache capacity in entries.
    pub fn cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries = entries;
        self
    }

    /// Set file+filter-cache capacity.
    pub fn fd_limit(mut self, limit: usize) -> Self {
        self.fd_limit = limit;
        self
    }

    /// Enable or disable filter consultation.
    pub fn use_filter(mut self, enabled: bool) -> Self {
        self.use_filter = enabled;
        self
    }

    /// Set the filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Set the block geometry used by the learned path.
    pub fn block_geometry(mut self, num_entries: usize, block_size: usize, entry_size: usize) -> Self {
        self.block_num_entries = num_entries;
        self.block_size = block_size;
        self.entry_size = entry_size;
        self
    }

    /// Set the read-path mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the PLR training tolerance.
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Checks that the configuration is internally consistent. The block
    /// geometry must fit a full block (entries, one restart offset per
    /// entry, restart count, checksum) inside `block_size`.
    pub fn validate(&self) -> Result<()> {
        if self.cache_entries == 0 {
            return errinput!("cache_entries must be at least 1");
        }
        if self.fd_limit == 0 {
            return errinput!("fd_limit must be at least 1");
        }
        if self.block_num_entries == 0 {
            return errinput!("block_num_entries must be at least 1");
        }
        if self.entry_size <= ENTRY_HEADER_SIZE {
            return errinput!(
                "entry_size {} does not fit the {}-byte entry header",
                self.entry_size,
                ENTRY_HEADER_SIZE
            );
        }
        let full_block = self.block_num_entries * self.entry_size // entries
            + 4 * self.block_num_entries // restart offsets
            + 4 // restart count
            + 4; // checksum
        if full_block > self.block_size {
            return errinput!(
                "block geometry needs {full_block} bytes, block_size is {}",
                self.block_size
            );
        }
        if !(self.gamma > 0.0) {
            return errinput!("gamma must be positive, got {}", self.gamma);
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dir", &self.dir)
            .field("cache_entries", &self.cache_entries)
            .field("fd_limit", &self.fd_limit)
            .field("use_filter", &self.use_filter)
            .field("filter_policy", &self.filter_policy.as_ref().map(|p| p.name()))
            .field("block_num_entries", &self.block_num_entries)
            .field("block_size", &self.block_size)
            .field("entry_size", &self.entry_size)
            .field("mode", &self.mode)
            .field("gamma", &self.gamma)
            .finish()
    }
}
