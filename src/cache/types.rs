//! Core types for the two-tier image cache.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fixed prefix for namespace directories under the cache root.
pub const DIRECTORY_PREFIX: &str = "com.webimage.cache";

/// Default namespace label.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error during disk tier operations
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding failed while preparing bytes to persist
    #[error("image encoding error: {0}")]
    Encode(#[from] image::ImageError),
}

/// Which tier satisfied a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSource {
    /// Not served from cache (miss, or error path).
    #[default]
    None,
    /// Served synchronously from the memory tier.
    Memory,
    /// Served from the disk tier via the IO executor.
    Disk,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Options for a store operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Re-encode from the decoded image even when raw data was supplied.
    pub recalculate: bool,
    /// Persist to the disk tier in addition to the memory tier.
    pub to_disk: bool,
}

/// Snapshot of memory tier counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub total_cost: u64,
}

/// Snapshot of disk tier counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
}

/// Image cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory for the disk tier. `None` uses the platform's
    /// per-user caches directory.
    pub root_dir: Option<PathBuf>,
    /// Namespace label isolating this cache from others under the root.
    pub namespace: String,
    /// Disk entries older than this are removed by the sweeper
    /// (default: one week).
    pub max_cache_age: Duration,
    /// Disk size ceiling in bytes for the sweeper's second pass
    /// (default: 0, unlimited).
    pub max_cache_size: u64,
    /// Eagerly convert disk-tier decodes for display (default: true).
    pub should_decompress_images: bool,
    /// Keep decoded images in the memory tier (default: true).
    pub should_cache_images_in_memory: bool,
    /// Mark written files as excluded from system backups (default: true).
    pub should_disable_backup: bool,
    /// Memory tier total-cost ceiling (default: 0, unlimited).
    pub max_memory_cost: u64,
    /// Memory tier entry-count ceiling (default: 0, unlimited).
    pub max_memory_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_cache_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_cache_size: 0,
            should_decompress_images: true,
            should_cache_images_in_memory: true,
            should_disable_backup: true,
            max_memory_cost: 0,
            max_memory_count: 0,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for the given namespace label.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Set the disk tier root directory.
    pub fn with_root_dir(mut self, dir: PathBuf) -> Self {
        self.root_dir = Some(dir);
        self
    }

    /// Set the maximum disk entry age.
    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    /// Set the disk size ceiling in bytes (0 = unlimited).
    pub fn with_max_cache_size(mut self, size: u64) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Set the memory total-cost ceiling (0 = unlimited).
    pub fn with_max_memory_cost(mut self, cost: u64) -> Self {
        self.max_memory_cost = cost;
        self
    }

    /// Set the memory entry-count ceiling (0 = unlimited).
    pub fn with_max_memory_count(mut self, count: usize) -> Self {
        self.max_memory_count = count;
        self
    }

    /// Enable or disable the memory tier.
    pub fn with_memory_caching(mut self, enabled: bool) -> Self {
        self.should_cache_images_in_memory = enabled;
        self
    }

    /// Enable or disable eager decompression of disk-tier decodes.
    pub fn with_decompression(mut self, enabled: bool) -> Self {
        self.should_decompress_images = enabled;
        self
    }
}
