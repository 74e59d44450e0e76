use std::collections::BTreeSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, RwLock,
};

use crate::error::Result;
use crate::index::KeyIndex;
use crate::wal::Wal;

/// Writes whose durability is in doubt after a failed WAL append or sync.
///
/// A failed write can leave a partial entry in the middle of a segment, so
/// these are settled by a snapshot at a fresh cut point rather than by more
/// log records.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub keys: BTreeSet<String>,
    /// A sync failed without a specific key to blame.
    pub segment_damaged: bool,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && !self.segment_damaged
    }

    pub fn absorb(&mut self, other: Reconciliation) {
        self.keys.extend(other.keys);
        self.segment_damaged |= other.segment_damaged;
    }
}

/// All mutable engine state, shared with background tasks.
pub struct EngineState {
    pub index: KeyIndex,

    // Writers hold a read guard across append + apply; rotation takes the
    // write guard, so a rotated-out segment has no half-applied records.
    pub active_wal: RwLock<Arc<Wal>>,
    pub next_wal_id: AtomicU64,

    // Snapshot bookkeeping
    pub snapshot_wal_id: AtomicU64,
    pub wal_bytes_since_snapshot: AtomicU64,
    pub wal_records_since_snapshot: AtomicU64,
    pub snapshot_lock: Mutex<()>,

    pub pending: Mutex<Reconciliation>,
    pub closed: AtomicBool,
}

impl EngineState {
    pub fn new(index: KeyIndex, active_wal: Wal, snapshot_wal_id: u64, wal_bytes: u64) -> Self {
        let next_wal_id = active_wal.id() + 1;
        Self {
            index,
            active_wal: RwLock::new(Arc::new(active_wal)),
            next_wal_id: AtomicU64::new(next_wal_id),
            snapshot_wal_id: AtomicU64::new(snapshot_wal_id),
            wal_bytes_since_snapshot: AtomicU64::new(wal_bytes),
            wal_records_since_snapshot: AtomicU64::new(0),
            snapshot_lock: Mutex::new(()),
            pending: Mutex::new(Reconciliation::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Get next WAL ID atomically
    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Current active segment, cloned out of the lock.
    pub fn active_wal(&self) -> Result<Arc<Wal>> {
        Ok(self.active_wal.read()?.clone())
    }

    pub fn record_append(&self, bytes: u64) {
        self.wal_bytes_since_snapshot
            .fetch_add(bytes, Ordering::SeqCst);
        self.wal_records_since_snapshot
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn needs_snapshot(&self, threshold: u64) -> bool {
        self.wal_bytes_since_snapshot.load(Ordering::SeqCst) >= threshold
    }

    pub fn mark_unreconciled(&self, key: &str) {
        match self.pending.lock() {
            Ok(mut pending) => {
                if pending.keys.insert(key.to_string()) {
                    tracing::warn!(key = key, "Marked key for reconciliation");
                }
            }
            Err(_) => tracing::error!(key = key, "Failed to mark key for reconciliation"),
        }
    }

    pub fn mark_segment_damaged(&self) {
        match self.pending.lock() {
            Ok(mut pending) => pending.segment_damaged = true,
            Err(_) => tracing::error!("Failed to mark WAL segment for reconciliation"),
        }
    }

    pub fn needs_reconcile(&self) -> Result<bool> {
        Ok(!self.pending.lock()?.is_empty())
    }

    pub fn unreconciled_keys(&self) -> usize {
        self.pending.lock().map(|p| p.keys.len()).unwrap_or_default()
    }

    /// Takes the outstanding reconciliation work, leaving none behind.
    pub fn take_pending(&self) -> Result<Reconciliation> {
        Ok(std::mem::take(&mut *self.pending.lock()?))
    }

    /// Puts work back after a failed reconciliation.
    pub fn restore_pending(&self, work: Reconciliation) {
        match self.pending.lock() {
            Ok(mut pending) => pending.absorb(work),
            Err(_) => tracing::error!("Failed to restore reconciliation work"),
        }
    }

    pub fn start_snapshot(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.snapshot_lock.lock()?)
    }

    /// Returns `None` if another snapshot is already running.
    pub fn try_start_snapshot(&self) -> Option<MutexGuard<'_, ()>> {
        self.snapshot_lock.try_lock().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the engine closed. Returns false if it already was.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}
