//! Snapshotting: rotate the WAL, write a full image, drop covered segments.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::{wal_cleanup, EngineState};
use crate::config::BitboxConfig;
use crate::error::Result;
use crate::snapshot;
use crate::wal::{segment_path, Wal, WalOptions};

pub(crate) fn wal_options(config: &BitboxConfig) -> WalOptions {
    WalOptions {
        buffer_size: config.wal_buffer_size,
        chunk_bits: config.chunk_bits,
    }
}

pub(crate) struct Rotation {
    /// Id of the new active segment.
    pub id: u64,
    /// Whether the rotated-out segment was flushed.
    pub flushed: bool,
}

/// Makes a fresh segment active. Waits for writers that hold the old segment
/// to finish applying, so every record in older segments is already in memory
/// when this returns.
///
/// The old segment is flushed before the new one exists on disk. A crash in
/// between leaves a torn tail only in the newest segment, which recovery can
/// truncate.
pub(crate) fn rotate(state: &EngineState, config: &BitboxConfig) -> Result<Rotation> {
    let mut active = state.active_wal.write()?;

    let flushed = match active.flush() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(wal_id = active.id(), error = %e, "Failed to flush rotated WAL segment");
            false
        }
    };

    let id = state.next_wal_id();
    let wal = Wal::open(&segment_path(&config.wal_dir(), id), id, wal_options(config))?;
    state.wal_bytes_since_snapshot.store(0, Ordering::SeqCst);
    state.wal_records_since_snapshot.store(0, Ordering::SeqCst);
    let old = std::mem::replace(&mut *active, Arc::new(wal));
    drop(active);

    tracing::debug!(old_wal_id = old.id(), wal_id = id, "Rotated WAL segment");
    Ok(Rotation { id, flushed })
}

/// Takes a snapshot, waiting for any snapshot already in progress.
pub(crate) fn snapshot(state: &EngineState, config: &BitboxConfig) -> Result<()> {
    let _guard = state.start_snapshot()?;
    run_snapshot(state, config)
}

/// Takes a snapshot unless one is already running. Returns whether it ran.
pub(crate) fn try_snapshot(state: &EngineState, config: &BitboxConfig) -> Result<bool> {
    let Some(_guard) = state.try_start_snapshot() else {
        return Ok(false);
    };
    run_snapshot(state, config)?;
    Ok(true)
}

/// Settles outstanding reconciliation work with a snapshot. A no-op if a
/// concurrent snapshot already did.
pub(crate) fn reconcile(state: &EngineState, config: &BitboxConfig) -> Result<()> {
    let _guard = state.start_snapshot()?;
    if !state.needs_reconcile()? {
        return Ok(());
    }
    run_snapshot(state, config)
}

fn run_snapshot(state: &EngineState, config: &BitboxConfig) -> Result<()> {
    let start = Instant::now();
    let mut work = state.take_pending()?;

    let rotation = match rotate(state, config) {
        Ok(rotation) => rotation,
        Err(e) => {
            state.restore_pending(work);
            return Err(e);
        }
    };
    if !rotation.flushed {
        work.segment_damaged = true;
    }

    let stats = match snapshot::write(&config.dir, &state.index, rotation.id) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(wal_id = rotation.id, error = %e, "Failed to write snapshot");
            state.restore_pending(work);
            return Err(e);
        }
    };
    state.snapshot_wal_id.store(rotation.id, Ordering::SeqCst);

    let removed = match wal_cleanup::cleanup_segments(&config.wal_dir(), rotation.id) {
        Ok(removed) => removed,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list WAL segments for cleanup");
            0
        }
    };

    tracing::info!(
        wal_id = rotation.id,
        keys = stats.keys,
        chunks = stats.chunks,
        bytes = stats.bytes,
        removed_wals = removed,
        reconciled_keys = work.keys.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Snapshot completed"
    );
    Ok(())
}
