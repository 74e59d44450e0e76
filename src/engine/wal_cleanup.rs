use std::path::Path;

use crate::error::Result;
use crate::wal::recovery::list_segments;

/// Segments with an id below `cut` are fully covered by the snapshot at `cut`.
pub fn deletable_segments(wal_dir: &Path, cut: u64) -> Result<Vec<u64>> {
    Ok(list_segments(wal_dir)?
        .into_iter()
        .map(|(id, _)| id)
        .filter(|&id| id < cut)
        .collect())
}

/// Deletes every segment below `cut`. Failures are logged and left for the
/// next snapshot or restart to retry. Returns the number of segments removed.
pub fn cleanup_segments(wal_dir: &Path, cut: u64) -> Result<usize> {
    let deletable = deletable_segments(wal_dir, cut)?;
    if deletable.is_empty() {
        return Ok(0);
    }

    tracing::debug!(
        deletable_wals = ?deletable,
        "Found {} WAL files to clean up",
        deletable.len()
    );

    let mut removed = 0;
    for wal_id in deletable {
        let wal_path = crate::wal::segment_path(wal_dir, wal_id);
        match std::fs::remove_file(&wal_path) {
            Ok(_) => {
                tracing::info!(wal_id = wal_id, "Deleted WAL file");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    wal_id = wal_id,
                    error = %e,
                    "Failed to delete WAL file"
                );
            }
        }
    }

    Ok(removed)
}
