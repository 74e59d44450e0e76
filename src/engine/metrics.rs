use std::sync::atomic::Ordering;

use super::EngineState;
use crate::error::Result;

/// Point-in-time counters describing the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Every key, including ones paged out of memory.
    pub keys: usize,
    pub resident_keys: usize,
    pub chunks: usize,
    pub active_wal_id: u64,
    /// Cut point of the newest snapshot.
    pub snapshot_wal_id: u64,
    pub wal_bytes_since_snapshot: u64,
    pub wal_records_since_snapshot: u64,
    pub unreconciled_keys: usize,
    pub closed: bool,
}

pub fn stats(state: &EngineState) -> Result<EngineStats> {
    Ok(EngineStats {
        keys: state.index.key_count(),
        resident_keys: state.index.resident_key_count(),
        chunks: state.index.chunk_count(),
        active_wal_id: state.active_wal()?.id(),
        snapshot_wal_id: state.snapshot_wal_id.load(Ordering::SeqCst),
        wal_bytes_since_snapshot: state.wal_bytes_since_snapshot.load(Ordering::SeqCst),
        wal_records_since_snapshot: state.wal_records_since_snapshot.load(Ordering::SeqCst),
        unreconciled_keys: state.unreconciled_keys(),
        closed: state.is_closed(),
    })
}

/// Collect metrics from engine state and log them
pub fn collect_metrics(state: &EngineState) -> Result<()> {
    let stats = stats(state)?;

    tracing::info!(
        keys = stats.keys,
        resident_keys = stats.resident_keys,
        chunks = stats.chunks,
        active_wal_id = stats.active_wal_id,
        snapshot_wal_id = stats.snapshot_wal_id,
        wal_bytes_since_snapshot = stats.wal_bytes_since_snapshot,
        wal_records_since_snapshot = stats.wal_records_since_snapshot,
        unreconciled_keys = stats.unreconciled_keys,
        "Bitbox metrics"
    );

    if stats.unreconciled_keys > 0 {
        tracing::warn!(
            unreconciled_keys = stats.unreconciled_keys,
            "Keys are waiting for a successful WAL sync"
        );
    }

    Ok(())
}
