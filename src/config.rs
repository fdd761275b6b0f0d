//! Cache configuration.

use std::path::PathBuf;

/// Default number of bytes written between frontier publications.
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Default hard limit for the sum of declared sizes of admitted entries.
pub const DEFAULT_TOTAL_BYTES_LIMIT: u64 = 16 * 1024 * 1024 * 1024;

/// Configuration for a [`RemoteFileCache`](crate::cache::RemoteFileCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory under which entry directories live.
    pub root: PathBuf,
    /// Hard budget for the sum of declared sizes of admitted entries.
    pub total_bytes_limit: u64,
    /// Per-entry bytes written to disk between frontier publications.
    pub flush_threshold: u64,
}

impl CacheConfig {
    /// Creates a configuration rooted at `root` with default limits.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            total_bytes_limit: DEFAULT_TOTAL_BYTES_LIMIT,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_total_bytes_limit(mut self, limit: u64) -> Self {
        self.total_bytes_limit = limit;
        self
    }

    /// The threshold must be positive; zero is raised to one byte.
    pub fn with_flush_threshold(mut self, threshold: u64) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }
}
