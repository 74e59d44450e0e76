//! Full images of the key index, used to bound WAL replay.
//!
//! # File Format
//!
//! ```text
//! +-------------------+
//! | Header (64 bytes) |  magic, version, chunk width, wal_id, key count, crc
//! +-------------------+
//! | KeyImage 1        |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | KeyImage n        |
//! +-------------------+
//! ```
//!
//! Each key image is framed like a WAL entry:
//!
//! ```text
//! +-----------+--------------------+-----------+
//! |length:u32 | bincode(KeyImage)  |crc32:u32  |
//! +-----------+--------------------+-----------+
//! ```
//!
//! A snapshot is written to `snapshot.tmp`, fsynced and renamed over
//! `snapshot`, so readers only ever see a complete file. The header's
//! `wal_id` is the cut point: every segment with a lower id is fully
//! contained in the snapshot.

pub mod header;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::index::KeyIndex;
use crate::wal::CRC32;
use crate::Error;
use header::{SnapshotHeader, HEADER_SIZE};

pub const SNAPSHOT_FILE: &str = "snapshot";
const SNAPSHOT_TMP_FILE: &str = "snapshot.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkImage {
    pub index: u64,
    pub words: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyImage {
    pub key: String,
    pub chunks: Vec<ChunkImage>,
}

/// What a completed `write` persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub keys: u64,
    pub chunks: u64,
    pub bytes: u64,
}

/// What a `load` restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub wal_id: u64,
    pub chunk_bits: u32,
    pub keys: u64,
    pub chunks: u64,
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Writes every key in `index` to `<dir>/snapshot`, replacing any previous
/// snapshot atomically. `wal_id` is the first segment the snapshot does not
/// cover.
pub fn write(dir: &Path, index: &KeyIndex, wal_id: u64) -> Result<SnapshotStats> {
    // Keys are never removed, so every listed key yields exactly one frame.
    let keys = index.keys()?;
    let header = SnapshotHeader::new(index.chunk_bits(), wal_id, keys.len() as u64);

    let tmp_path = dir.join(SNAPSHOT_TMP_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.encode())?;

    let mut chunks = 0u64;
    for key in keys {
        let image = index.image(&key)?;
        chunks += image.chunks.len() as u64;
        write_frame(&mut writer, &image)?;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    let bytes = file.metadata()?.len();
    drop(file);

    fs::rename(&tmp_path, snapshot_path(dir))?;
    sync_dir(dir)?;

    Ok(SnapshotStats {
        keys: header.key_count,
        chunks,
        bytes,
    })
}

/// Restores the snapshot in `dir` into `index`. Returns `None` when no
/// snapshot has been taken yet. Any damage is reported as `Corrupted`.
pub fn load(dir: &Path, index: &KeyIndex) -> Result<Option<SnapshotInfo>> {
    remove_stale_tmp(dir);

    let path = snapshot_path(dir);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut remaining = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let corrupted = |what: String, e: Error| Error::Corrupted(format!("snapshot {:?} {}: {}", path, what, e));

    let mut buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut buf)
        .map_err(|e| corrupted("header".to_string(), e.into()))?;
    let header = SnapshotHeader::decode(&buf).map_err(|e| corrupted("header".to_string(), e))?;
    remaining = remaining.saturating_sub(HEADER_SIZE as u64);

    let mut chunks = 0u64;
    for n in 0..header.key_count {
        let (image, frame_len) =
            read_frame(&mut reader, remaining).map_err(|e| corrupted(format!("key frame {}", n), e))?;
        remaining -= frame_len;

        if image.chunks.is_empty() {
            index.get_or_create_unchecked(&image.key)?;
        }
        for chunk in &image.chunks {
            index.restore_image(&image.key, header.chunk_bits, chunk.index, &chunk.words)?;
        }
        chunks += image.chunks.len() as u64;
    }

    if remaining != 0 {
        return Err(Error::Corrupted(format!(
            "snapshot {:?} has {} trailing bytes after {} keys",
            path, remaining, header.key_count
        )));
    }

    Ok(Some(SnapshotInfo {
        wal_id: header.wal_id,
        chunk_bits: header.chunk_bits,
        keys: header.key_count,
        chunks,
    }))
}

/// Writes one key's image to a page file. Pages only hold keys evicted from
/// memory; the snapshot and WAL stay authoritative, so no fsync is needed.
pub fn write_page(path: &Path, image: &KeyImage) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_frame(&mut writer, image)?;
    writer.flush()?;
    Ok(())
}

/// Reads back a page written by `write_page`.
pub fn read_page(path: &Path) -> Result<KeyImage> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let corrupted = |e: Error| Error::Corrupted(format!("page {:?}: {}", path, e));
    let (image, frame_len) = read_frame(&mut reader, len).map_err(corrupted)?;
    if frame_len != len {
        return Err(Error::Corrupted(format!(
            "page {:?} has {} trailing bytes",
            path,
            len - frame_len
        )));
    }
    Ok(image)
}

fn write_frame<W: Write>(writer: &mut W, image: &KeyImage) -> Result<()> {
    let bytes =
        bincode::serialize(image).map_err(|e| Error::Encode("snapshot key image", e.to_string()))?;
    let len = u32::try_from(bytes.len()).map_err(|_| {
        Error::Encode(
            "snapshot key image",
            format!("key {:?} image of {} bytes exceeds u32", image.key, bytes.len()),
        )
    })?;

    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(&bytes)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(&bytes))?;
    Ok(())
}

/// Reads one frame, refusing lengths that run past the end of the file.
/// Returns the image and the number of bytes the frame occupied.
fn read_frame<R: Read>(reader: &mut R, remaining: u64) -> Result<(KeyImage, u64)> {
    let len = reader.read_u32::<BigEndian>()? as u64;
    let frame_len = 4 + len + 4;
    if frame_len > remaining {
        return Err(Error::Decode(
            "snapshot frame",
            format!("length {} exceeds the {} bytes left", len, remaining),
        ));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    let checksum = reader.read_u32::<BigEndian>()?;
    if CRC32.checksum(&bytes) != checksum {
        return Err(Error::ChecksumMismatch);
    }

    let image = bincode::deserialize(&bytes)
        .map_err(|e| Error::Decode("snapshot key image", e.to_string()))?;
    Ok((image, frame_len))
}

fn remove_stale_tmp(dir: &Path) {
    let tmp_path = dir.join(SNAPSHOT_TMP_FILE);
    match fs::remove_file(&tmp_path) {
        Ok(()) => tracing::warn!(path = ?tmp_path, "Removed unfinished snapshot"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?tmp_path, error = %e, "Failed to remove unfinished snapshot"),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
