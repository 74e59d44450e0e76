//! The bit-vector engine: key index, WAL and snapshots behind one handle.
//!
//! ```text
//!   set_bit / set_bits                      get_bit
//!          │                                   │
//!          ▼                                   ▼
//!   ┌──────────────┐  append   ┌─────────┐   ┌──────────────┐
//!   │  per-key     ├──────────►│ WAL     │   │  KeyIndex    │
//!   │  writer lock │           │ segment │   │  (lock-free) │
//!   └──────┬───────┘           └────┬────┘   └──────────────┘
//!          │ apply                  │ rotate + snapshot
//!          ▼                        ▼
//!   ┌──────────────┐           ┌──────────┐
//!   │ ChunkStore   │           │ snapshot │
//!   └──────────────┘           └──────────┘
//! ```
//!
//! # Write Path
//! 1. **Validate**: key and offsets are checked before anything is touched
//! 2. **Reserve**: capacity for chunks the write would allocate is reserved
//! 3. **Log**: one `SetBits` record per touched chunk is appended to the
//!    active segment while holding the key's writer lock
//! 4. **Apply**: the chunk is updated in memory, still under that lock
//! 5. **Sync**: under `FlushPolicy::Sync` the segment is fsynced before the
//!    call returns
//!
//! A failed append or fsync fails the call and marks the key unreconciled.
//! The next sync settles it with a snapshot, which also retires the segment
//! that may hold a partial entry.
//!
//! # Durability
//! - **File Locking**: `bitbox.lock` keeps other processes out of the directory
//! - **Recovery**: the snapshot is loaded, then newer segments are replayed
//! - **Snapshots**: the WAL is rotated, state written out, and the segments
//!   before the cut deleted
//! - **Eviction**: with `max_resident_keys` set, cold keys are paged out to
//!   `pages/` and read back on next access; pages never outlive the process

pub mod compaction;
pub mod metrics;
pub mod recovery;
pub mod state;
pub mod tasks;
pub mod wal_cleanup;

pub use metrics::EngineStats;
pub use state::EngineState;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk::{group_by_chunk, locate, ChunkUpdate};
use crate::config::{BitboxConfig, FlushPolicy};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::Reservation;
use crate::scheduler::Scheduler;
use crate::wal::{Record, Wal};
use tasks::{MetricsTask, SnapshotTask, WalSyncTask};

const LOCK_FILE: &str = "bitbox.lock";

/// Engine with interior mutability
pub struct Engine {
    pub(crate) config: BitboxConfig,
    lock: Option<FileLock>,
    pub(crate) state: Arc<EngineState>,
}

impl Engine {
    /// Open engine with default configuration
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(BitboxConfig::new(dir))
    }

    /// Open engine with custom configuration
    pub fn open_with_config(config: BitboxConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let state = Arc::new(recovery::recover_state(&config)?);

        Ok(Self {
            config,
            lock: Some(lock),
            state,
        })
    }

    pub fn config(&self) -> &BitboxConfig {
        &self.config
    }

    pub fn set_bit(&self, key: &str, offset: u64) -> Result<()> {
        self.check_key(key)?;
        self.check_offset(offset)?;

        let (index, bit) = locate(offset, self.config.chunk_bits);
        self.write(
            key,
            &[ChunkUpdate {
                index,
                bits: vec![bit],
            }],
        )
    }

    /// Sets every offset in `offsets`, which may be unsorted and repeat.
    /// Each touched chunk is updated atomically; the batch as a whole is not.
    pub fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<()> {
        self.check_key(key)?;
        for &offset in offsets {
            self.check_offset(offset)?;
        }
        if offsets.is_empty() {
            return Ok(());
        }

        self.write(key, &group_by_chunk(offsets, self.config.chunk_bits))
    }

    /// Reads one bit. Never-written keys and unallocated ranges read 0.
    pub fn get_bit(&self, key: &str, offset: u64) -> Result<u8> {
        self.check_key(key)?;
        self.check_offset(offset)?;

        Ok(self
            .state
            .index
            .lookup(key)?
            .map_or(0, |store| store.get_bit(offset)))
    }

    /// Forces buffered WAL records to disk and settles any writes whose
    /// persistence failed earlier.
    ///
    /// If the flush itself fails, the segment is retired by a snapshot at a
    /// fresh cut; the call only fails when that snapshot fails too.
    pub fn sync(&self) -> Result<()> {
        let wal = self.state.active_wal()?;
        if let Err(e) = wal.flush() {
            self.state.mark_segment_damaged();
            tracing::error!(wal_id = wal.id(), error = %e, "Failed to sync WAL");
            if let Err(snapshot_err) = compaction::reconcile(&self.state, &self.config) {
                tracing::error!(error = %snapshot_err, "Failed to settle WAL failure with a snapshot");
                return Err(e);
            }
            return Ok(());
        }
        self.reconcile_if_needed()
    }

    /// Snapshots the full state and deletes the WAL segments it covers.
    pub fn snapshot(&self) -> Result<()> {
        compaction::snapshot(&self.state, &self.config)
    }

    /// Like `snapshot`, but returns `false` instead of waiting when another
    /// snapshot is in progress.
    pub fn try_snapshot(&self) -> Result<bool> {
        compaction::try_snapshot(&self.state, &self.config)
    }

    /// Check if the WAL has grown enough to warrant a snapshot
    pub fn needs_snapshot(&self) -> bool {
        self.state.needs_snapshot(self.config.snapshot_wal_bytes)
    }

    /// Rejects further writes, then persists everything with a final
    /// snapshot. Reads keep working. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if !self.state.close() {
            return Ok(());
        }
        tracing::info!(dir = ?self.config.dir, "Shutting down");
        self.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.is_closed()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        metrics::stats(&self.state)
    }

    /// Collect and log metrics
    pub fn collect_metrics(&self) -> Result<()> {
        metrics::collect_metrics(&self.state)
    }

    /// Starts the WAL sync (batched mode only), snapshot and metrics tasks.
    /// Must be called from within a tokio runtime.
    pub fn start_background(self: &Arc<Self>) -> Scheduler {
        let scheduler = Scheduler::new();
        if let FlushPolicy::Batched { interval } = self.config.flush_policy {
            scheduler.register(Arc::new(WalSyncTask::new(self.clone(), interval)));
        }
        scheduler
            .register(Arc::new(SnapshotTask::new(self.clone())))
            .register(Arc::new(MetricsTask::new(self.clone())));
        scheduler
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty".to_string()));
        }
        if key.len() > self.config.max_key_len {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                self.config.max_key_len
            )));
        }
        Ok(())
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        if offset > self.config.max_offset {
            return Err(Error::InvalidArgument(format!(
                "offset {} exceeds the maximum of {}",
                offset, self.config.max_offset
            )));
        }
        Ok(())
    }

    fn write(&self, key: &str, updates: &[ChunkUpdate]) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::InvalidState("engine is shut down".to_string()));
        }

        let existing = self.state.index.lookup(key)?;
        let missing = match &existing {
            Some(store) => store.missing_chunks(updates),
            None => updates.len(),
        };
        let budget = self.state.index.chunk_budget();
        let mut reservation = budget.reserve(missing).ok_or_else(|| {
            Error::ResourceExhausted(format!(
                "chunk limit of {} reached",
                budget.limit().unwrap_or_default()
            ))
        })?;
        if existing.is_none() {
            self.state.index.get_or_create(key)?;
        }

        let mut segments: Vec<Arc<Wal>> = Vec::new();
        for update in updates {
            let wal = self.write_chunk(key, update, &mut reservation)?;
            if !segments.iter().any(|s| Arc::ptr_eq(s, &wal)) {
                segments.push(wal);
            }
        }
        drop(reservation);

        if self.config.flush_policy == FlushPolicy::Sync {
            self.commit(key, &segments)?;
        }
        Ok(())
    }

    /// Logs and applies one chunk's update under the key's writer lock.
    /// Returns the segment the record went to.
    fn write_chunk(
        &self,
        key: &str,
        update: &ChunkUpdate,
        reservation: &mut Reservation<'_>,
    ) -> Result<Arc<Wal>> {
        let active = self.state.active_wal.read()?;

        self.state.index.with_writer(key, |store| {
            match active.append(&Record::set_bits(key, update.index, &update.bits)) {
                Ok(bytes) => self.state.record_append(bytes),
                Err(e) => {
                    tracing::warn!(
                        key = key,
                        chunk = update.index,
                        error = %e,
                        "Failed to append WAL record"
                    );
                    self.state.mark_unreconciled(key);
                    return Err(e);
                }
            }

            if store.apply(update.index, &update.bits) {
                reservation.consume();
            }
            Ok(())
        })?;
        Ok(Arc::clone(&*active))
    }

    fn commit(&self, key: &str, segments: &[Arc<Wal>]) -> Result<()> {
        for wal in segments {
            if let Err(e) = wal.flush() {
                tracing::error!(key = key, wal_id = wal.id(), error = %e, "Failed to sync WAL");
                self.state.mark_unreconciled(key);
                return Err(e);
            }
        }
        if let Err(e) = self.reconcile_if_needed() {
            self.state.mark_unreconciled(key);
            return Err(e);
        }
        Ok(())
    }

    fn reconcile_if_needed(&self) -> Result<()> {
        if self.state.needs_reconcile()? {
            compaction::reconcile(&self.state, &self.config)?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        match self.state.active_wal() {
            Ok(wal) => {
                if let Err(e) = wal.flush() {
                    tracing::warn!(wal_id = wal.id(), error = %e, "Failed to flush WAL on close");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to flush WAL on close"),
        }

        // Release file lock
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.unlock() {
                tracing::warn!(error = %e, "Failed to release directory lock");
            }
        }
    }
}
