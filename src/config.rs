use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Widest accepted chunk, keeping a full chunk image well inside one WAL entry.
pub const MAX_CHUNK_BITS: u32 = 1 << 20;

/// When buffered WAL records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every write is fsynced before it is acknowledged.
    Sync,
    /// Writes are acknowledged once buffered; a background task fsyncs on
    /// `interval`. A crash may lose up to one interval of writes.
    Batched { interval: Duration },
}

/// Optional capacity limits. Writes that would exceed them fail with
/// `ResourceExhausted` before anything is logged or applied.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub max_keys: Option<usize>,
    pub max_chunks: Option<usize>,
}

/// Configuration for the bitbox engine
#[derive(Debug, Clone)]
pub struct BitboxConfig {
    /// Directory path for the data files
    pub dir: PathBuf,

    /// Width of one chunk in bits (default: 4096)
    pub chunk_bits: u32,

    /// Maximum key length in bytes (default: 1024)
    pub max_key_len: usize,

    /// Largest accepted bit offset (default: u64::MAX)
    pub max_offset: u64,

    /// WAL flush policy (default: Sync)
    pub flush_policy: FlushPolicy,

    /// WAL buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// WAL bytes since the last snapshot that trigger a new one (default: 64MB)
    pub snapshot_wal_bytes: u64,

    /// How often to check whether a snapshot is due (default: 10s)
    pub snapshot_interval: Duration,

    /// How often to log engine metrics (default: 60s)
    pub metrics_interval: Duration,

    /// Capacity limits
    pub limits: ResourceLimits,

    /// Keys kept in memory before the least recently used are paged out to
    /// disk (default: unlimited)
    pub max_resident_keys: Option<usize>,
}

impl Default for BitboxConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./bitbox"),
            chunk_bits: 4096,
            max_key_len: 1024,
            max_offset: u64::MAX,
            flush_policy: FlushPolicy::Sync,
            wal_buffer_size: 64 * 1024,            // 64KB
            snapshot_wal_bytes: 64 * 1024 * 1024, // 64MB
            snapshot_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            limits: ResourceLimits::default(),
            max_resident_keys: None,
        }
    }
}

impl BitboxConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the chunk width in bits
    pub fn chunk_bits(mut self, bits: u32) -> Self {
        self.chunk_bits = bits;
        self
    }

    /// Set the maximum key length in bytes
    pub fn max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Set the largest accepted offset
    pub fn max_offset(mut self, offset: u64) -> Self {
        self.max_offset = offset;
        self
    }

    /// Set the WAL flush policy
    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    /// Set WAL buffer size
    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    /// Set the WAL size that triggers a snapshot
    pub fn snapshot_wal_bytes(mut self, bytes: u64) -> Self {
        self.snapshot_wal_bytes = bytes;
        self
    }

    /// Set snapshot check interval
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Set metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Configure capacity limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Page cold keys out once more than `max` are in memory
    pub fn max_resident_keys(mut self, max: usize) -> Self {
        self.max_resident_keys = Some(max);
        self
    }

    /// Directory holding the WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.dir.join("wal")
    }

    /// Directory holding the pages of evicted keys
    pub fn pages_dir(&self) -> PathBuf {
        self.dir.join("pages")
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_bits == 0 || self.chunk_bits % 64 != 0 || self.chunk_bits > MAX_CHUNK_BITS {
            return Err(Error::InvalidArgument(format!(
                "chunk_bits must be a non-zero multiple of 64 up to {}, got {}",
                MAX_CHUNK_BITS, self.chunk_bits
            )));
        }
        if self.max_key_len == 0 || self.max_key_len > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "max_key_len must be in 1..={}, got {}",
                u16::MAX,
                self.max_key_len
            )));
        }
        if self.max_resident_keys == Some(0) {
            return Err(Error::InvalidArgument(
                "max_resident_keys must be non-zero".to_string(),
            ));
        }
        if self.wal_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "wal_buffer_size must be non-zero".to_string(),
            ));
        }
        if let FlushPolicy::Batched { interval } = self.flush_policy {
            if interval.is_zero() {
                return Err(Error::InvalidArgument(
                    "batched flush interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl ResourceLimits {
    /// Cap the number of distinct keys
    pub fn max_keys(mut self, max: usize) -> Self {
        self.max_keys = Some(max);
        self
    }

    /// Cap the number of allocated chunks across all keys
    pub fn max_chunks(mut self, max: usize) -> Self {
        self.max_chunks = Some(max);
        self
    }
}
