use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::header::{Header, HEADER_SIZE};
use super::{Record, Wal};
use crate::error::Result;
use crate::Error;

/// Outcome of replaying one segment.
#[derive(Debug)]
pub struct SegmentReplay {
    pub records: u64,
    /// Chunk width of the segment, `None` if its header was torn.
    pub chunk_bits: Option<u32>,
    /// Set when a partially written tail entry was found and cut off.
    pub truncated_at: Option<u64>,
}

/// Lists `<id>.wal` segments in `wal_dir`, sorted by id.
pub fn list_segments(wal_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    std::fs::create_dir_all(wal_dir)?;

    let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(wal_dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension()?.to_str()? != "wal" {
                return None;
            }
            match path.file_stem()?.to_str()?.parse::<u64>() {
                Ok(id) => Some((id, path)),
                Err(_) => {
                    tracing::warn!(path = ?path, "Ignoring WAL file with a non-numeric name");
                    None
                }
            }
        })
        .collect();

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Whether the segment holds anything past its header.
pub fn segment_has_entries(path: &Path) -> Result<bool> {
    Ok(std::fs::metadata(path)?.len() > HEADER_SIZE as u64)
}

/// Replays the segment at `path`, feeding each record to `apply` in log order.
///
/// A torn tail is tolerated only when `allow_torn_tail` is set: the file is
/// truncated back to the last complete entry. Anywhere else it is corruption,
/// as is a checksum mismatch or an undecodable record.
pub fn replay_segment<F>(
    path: &Path,
    id: u64,
    allow_torn_tail: bool,
    mut apply: F,
) -> Result<SegmentReplay>
where
    F: FnMut(&Header, Record<'static>) -> Result<()>,
{
    let corrupted = |e: Error| Error::Corrupted(format!("WAL segment {:?}: {}", path, e));

    let mut replay = Wal::replay(path).map_err(corrupted)?;
    if let Some(header) = replay.header() {
        if header.segment_id != id {
            return Err(Error::Corrupted(format!(
                "WAL segment {:?} carries segment id {}",
                path, header.segment_id
            )));
        }
    }

    let mut records = 0;
    while let Some(entry) = replay.next() {
        let record = entry.map_err(|e| {
            Error::Corrupted(format!(
                "WAL segment {:?} at offset {}: {}",
                path,
                replay.offset(),
                e
            ))
        })?;
        let header = replay.header().copied().ok_or(Error::InvalidHeader)?;
        apply(&header, record)?;
        records += 1;
    }

    let truncated_at = match replay.torn_tail() {
        Some(offset) if allow_torn_tail => {
            tracing::warn!(
                segment = id,
                offset = offset,
                "Truncating partially written WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_all()?;
            Some(offset)
        }
        Some(offset) => {
            return Err(Error::Corrupted(format!(
                "WAL segment {:?} is truncated at offset {} but later segments hold records",
                path, offset
            )));
        }
        None => None,
    };

    Ok(SegmentReplay {
        records,
        chunk_bits: replay.header().map(|h| h.chunk_bits),
        truncated_at,
    })
}
