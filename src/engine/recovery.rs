use std::path::PathBuf;
use std::time::Instant;

use super::compaction::wal_options;
use super::{wal_cleanup, EngineState};
use crate::config::BitboxConfig;
use crate::error::Result;
use crate::index::KeyIndex;
use crate::snapshot;
use crate::wal::recovery::{list_segments, replay_segment, segment_has_entries};
use crate::wal::{segment_path, Wal};

/// Rebuilds engine state from the snapshot and the WAL segments after its cut
/// point, then opens the segment new writes go to.
pub(crate) fn recover_state(config: &BitboxConfig) -> Result<EngineState> {
    let start = Instant::now();
    let mut index = KeyIndex::new(
        config.chunk_bits,
        config.limits.max_keys,
        config.limits.max_chunks,
    );
    if let Some(max_resident) = config.max_resident_keys {
        index = index.with_eviction(reset_pages(config)?, max_resident);
    }

    let loaded = snapshot::load(&config.dir, &index)?;
    let cut = loaded.map(|info| info.wal_id).unwrap_or(0);
    if let Some(info) = loaded {
        tracing::info!(
            wal_id = info.wal_id,
            keys = info.keys,
            chunks = info.chunks,
            chunk_bits = info.chunk_bits,
            "Loaded snapshot"
        );
    }

    // Leftovers from a cleanup interrupted after the last snapshot.
    let wal_dir = config.wal_dir();
    wal_cleanup::cleanup_segments(&wal_dir, cut)?;
    let segments: Vec<_> = list_segments(&wal_dir)?
        .into_iter()
        .filter(|(id, _)| *id >= cut)
        .collect();

    // A crash right after a rotation can leave a torn tail in front of
    // segments that hold nothing but a header. Past the last segment with
    // records, every torn tail is an unacknowledged write.
    let mut tail_start = 0;
    for (i, (_, path)) in segments.iter().enumerate().rev() {
        if segment_has_entries(path)? {
            tail_start = i;
            break;
        }
    }

    let mut records = 0u64;
    let mut wal_bytes = 0u64;
    let mut truncated = 0usize;
    let mut last_chunk_bits = None;
    for (i, (id, path)) in segments.iter().enumerate() {
        let replay = replay_segment(path, *id, i >= tail_start, |header, record| {
            index.restore_bits(
                record.key(),
                header.chunk_bits,
                record.chunk_index(),
                record.bits(),
            )
        })?;

        records += replay.records;
        wal_bytes += std::fs::metadata(path)?.len();
        if replay.truncated_at.is_some() {
            truncated += 1;
        }
        last_chunk_bits = replay.chunk_bits;
    }

    // Keep appending to the newest segment unless it was written at another
    // chunk width.
    let active = match segments.last() {
        Some((id, path)) if last_chunk_bits.map_or(true, |bits| bits == config.chunk_bits) => {
            Wal::open(path, *id, wal_options(config))?
        }
        Some((id, _)) => {
            let id = id + 1;
            Wal::open(&segment_path(&wal_dir, id), id, wal_options(config))?
        }
        None => Wal::open(&segment_path(&wal_dir, cut), cut, wal_options(config))?,
    };

    tracing::info!(
        snapshot_wal_id = cut,
        segments = segments.len(),
        records = records,
        truncated_segments = truncated,
        keys = index.key_count(),
        chunks = index.chunk_count(),
        active_wal_id = active.id(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Recovery completed"
    );

    Ok(EngineState::new(index, active, cut, wal_bytes))
}

/// Page files only cache memory; the snapshot and WAL hold every key, so
/// whatever a previous run left behind is stale.
fn reset_pages(config: &BitboxConfig) -> Result<PathBuf> {
    let dir = config.pages_dir();
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => tracing::debug!(dir = ?dir, "Removed stale page files"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{Record, WalOptions};
    use crate::Error;
    use tempfile::TempDir;

    fn write_segment(
        config: &BitboxConfig,
        id: u64,
        chunk_bits: u32,
        records: &[(&str, u64, Vec<u32>)],
    ) -> Result<()> {
        let opts = WalOptions {
            chunk_bits,
            ..WalOptions::default()
        };
        let wal = Wal::open(&segment_path(&config.wal_dir(), id), id, opts)?;
        for (key, chunk, bits) in records {
            wal.append(&Record::set_bits(key, *chunk, bits))?;
        }
        wal.flush()?;
        Ok(())
    }

    #[test]
    fn test_recover_empty_state() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path());

        let state = recover_state(&config)?;
        assert_eq!(state.index.key_count(), 0);
        assert_eq!(state.active_wal()?.id(), 0);
        assert!(segment_path(&config.wal_dir(), 0).exists());
        Ok(())
    }

    #[test]
    fn test_recover_replays_segments_in_order() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;
        write_segment(&config, 0, 64, &[("a", 0, vec![1]), ("b", 3, vec![0])])?;
        write_segment(&config, 1, 64, &[("a", 0, vec![2])])?;

        let state = recover_state(&config)?;
        let a = state.index.lookup("a")?.unwrap();
        assert_eq!((a.get_bit(1), a.get_bit(2), a.get_bit(3)), (1, 1, 0));
        assert_eq!(state.index.lookup("b")?.unwrap().get_bit(192), 1);
        assert_eq!(state.active_wal()?.id(), 1);
        assert_eq!(state.next_wal_id(), 2);
        Ok(())
    }

    #[test]
    fn test_recover_rechunks_and_starts_new_segment() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;
        write_segment(&config, 4, 4096, &[("k", 1, vec![100])])?;

        let state = recover_state(&config)?;
        let store = state.index.lookup("k")?.unwrap();
        assert_eq!(store.get_bit(4096 + 100), 1);
        assert_eq!(store.chunk_indices(), vec![(4096 + 100) / 64]);
        assert_eq!(state.active_wal()?.id(), 5);
        assert_eq!(state.active_wal()?.chunk_bits(), 64);
        Ok(())
    }

    #[test]
    fn test_recover_skips_segments_below_snapshot() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;

        let index = KeyIndex::new(64, None, None);
        index.get_or_create("k")?.set_bit(7)?;
        snapshot::write(dir.path(), &index, 3)?;
        // A segment the snapshot covers, left behind by an interrupted cleanup.
        write_segment(&config, 2, 64, &[("stale", 0, vec![0])])?;
        write_segment(&config, 3, 64, &[("k", 0, vec![8])])?;

        let state = recover_state(&config)?;
        let store = state.index.lookup("k")?.unwrap();
        assert_eq!((store.get_bit(7), store.get_bit(8)), (1, 1));
        assert!(state.index.lookup("stale")?.is_none());
        assert!(!segment_path(&config.wal_dir(), 2).exists());
        Ok(())
    }

    #[test]
    fn test_recover_fails_on_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;
        write_segment(&config, 0, 64, &[("a", 0, vec![1]), ("b", 0, vec![2])])?;

        let path = segment_path(&config.wal_dir(), 0);
        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes)?;

        assert!(matches!(recover_state(&config), Err(Error::Corrupted(_))));
        Ok(())
    }

    fn cut_short(path: &std::path::Path, bytes: u64) -> Result<()> {
        let len = std::fs::metadata(path)?.len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(len - bytes)?;
        Ok(())
    }

    #[test]
    fn test_torn_tail_before_empty_segment_recovers() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;

        // Crash after the next segment was created but before the torn
        // append in segment 0 was repaired.
        write_segment(&config, 0, 64, &[("a", 0, vec![1]), ("b", 0, vec![2])])?;
        cut_short(&segment_path(&config.wal_dir(), 0), 3)?;
        write_segment(&config, 1, 64, &[])?;

        let state = recover_state(&config)?;
        assert_eq!(state.index.lookup("a")?.unwrap().get_bit(1), 1);
        assert!(state.index.lookup("b")?.is_none());
        assert_eq!(state.active_wal()?.id(), 1);

        // The torn entry is gone, so the next start is clean too.
        drop(state);
        let state = recover_state(&config)?;
        assert_eq!(state.index.lookup("a")?.unwrap().get_bit(1), 1);
        Ok(())
    }

    #[test]
    fn test_torn_tail_before_records_is_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).chunk_bits(64);
        std::fs::create_dir_all(config.wal_dir())?;

        write_segment(&config, 0, 64, &[("a", 0, vec![1]), ("b", 0, vec![2])])?;
        cut_short(&segment_path(&config.wal_dir(), 0), 3)?;
        write_segment(&config, 1, 64, &[("c", 0, vec![3])])?;

        assert!(matches!(recover_state(&config), Err(Error::Corrupted(_))));
        Ok(())
    }

    #[test]
    fn test_stale_pages_are_discarded() -> Result<()> {
        let dir = TempDir::new()?;
        let config = BitboxConfig::new(dir.path()).max_resident_keys(1);
        std::fs::create_dir_all(config.pages_dir())?;
        std::fs::write(config.pages_dir().join("0.page"), b"left over")?;

        let state = recover_state(&config)?;
        assert!(config.pages_dir().exists());
        assert!(!config.pages_dir().join("0.page").exists());
        assert_eq!(state.index.key_count(), 0);
        Ok(())
    }
}
