//! Write-Ahead Log (WAL) for durability and recovery.
//!
//! Every bit mutation is appended to the active WAL segment before it is
//! applied in memory, so that replaying the segments written since the last
//! snapshot reconstructs every acknowledged write.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Entry 1          |
//! +------------------+
//! | Entry 2          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Entry Format
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | record payload   |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! - All multi-byte integers use big-endian encoding
//! - CRC32 (iSCSI) covers the payload; see `record` for payload layouts
//!
//! # Torn Tails
//!
//! A crash can leave the last entry of the newest segment partially written,
//! possibly followed by a freshly rotated segment that holds only its header.
//! Replay reports that position through `ReplayIterator::torn_tail` instead of
//! failing, because such an entry was never acknowledged. A checksum mismatch
//! on a complete entry is corruption and is returned as an error.

pub mod header;
pub mod record;
pub mod recovery;

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use header::{Header, HEADER_SIZE};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::Error;

pub use record::Record;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Upper bound on a single entry; larger length prefixes are treated as corruption.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

pub struct WalOptions {
    pub buffer_size: usize,
    pub chunk_bits: u32,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_bits: 4096,
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("segment_id", &self.header.segment_id)
            .finish()
    }
}

/// One WAL segment file.
pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    header: Header,
    size: AtomicU64,
    entry_count: AtomicU64,
}

/// Path of segment `id` inside `wal_dir`.
pub fn segment_path(wal_dir: &Path, id: u64) -> PathBuf {
    wal_dir.join(format!("{}.wal", id))
}

impl Wal {
    /// Opens segment `id` at `path`, creating it (and syncing its header) if it
    /// is empty. Appends go to the end of the existing content.
    pub fn open(path: &Path, id: u64, opts: WalOptions) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let header = if len == 0 {
            let h = Header::new(id, opts.chunk_bits);
            file.write_all(&h.encode())?;
            file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let h = Header::decode(&buf)?;
            if h.segment_id != id {
                return Err(Error::Corrupted(format!(
                    "WAL file {:?} carries segment id {}",
                    path, h.segment_id
                )));
            }
            h
        };

        let writer = BufWriter::with_capacity(opts.buffer_size, file.try_clone()?);
        let size = file.metadata()?.len();

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path: path.into(),
            header,
            size: AtomicU64::new(size),
            entry_count: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn chunk_bits(&self) -> u32 {
        self.header.chunk_bits
    }

    /// Bytes written to the segment, including still-buffered entries.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Entries appended through this handle.
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// Appends one record to the write buffer and returns the entry's size.
    /// The entry is durable only after `flush`.
    pub fn append(&self, record: &Record<'_>) -> Result<u64> {
        let payload = record.encode()?;
        if payload.len() > MAX_ENTRY_SIZE {
            return Err(Error::Encode(
                "record",
                format!("{} bytes exceeds the entry limit", payload.len()),
            ));
        }
        let checksum = CRC32.checksum(&payload);

        let mut entry = Vec::with_capacity(payload.len() + 8);
        entry.write_u32::<BigEndian>(payload.len() as u32)?;
        entry.extend_from_slice(&payload);
        entry.write_u32::<BigEndian>(checksum)?;

        self.writer.lock()?.write_all(&entry)?;

        let written = entry.len() as u64;
        self.size.fetch_add(written, Ordering::SeqCst);
        self.entry_count.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    /// Writes out buffered entries and fsyncs the segment.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the segment at `path` from the start.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        ReplayIterator::new(path)
    }

    /// A segment whose every write fails with `ENOSPC` once it reaches the
    /// device. With the default buffer that is on `flush`; with a one-byte
    /// buffer it is on `append`.
    #[cfg(all(test, target_os = "linux"))]
    pub(crate) fn open_failing(id: u64, opts: WalOptions) -> Result<Self> {
        let path = PathBuf::from("/dev/full");
        let file = File::options().write(true).open(&path)?;
        let writer = BufWriter::with_capacity(opts.buffer_size, file.try_clone()?);
        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
            header: Header::new(id, opts.chunk_bits),
            size: AtomicU64::new(HEADER_SIZE as u64),
            entry_count: AtomicU64::new(0),
        })
    }
}

/// Reads entries back out of a segment.
pub struct ReplayIterator {
    reader: BufReader<File>,
    header: Option<Header>,
    offset: u64,
    torn_at: Option<u64>,
    done: bool,
}

impl ReplayIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // A segment shorter than its header was cut off while being created.
        if len < HEADER_SIZE as u64 {
            return Ok(Self {
                reader,
                header: None,
                offset: 0,
                torn_at: Some(0),
                done: true,
            });
        }

        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let header = Header::decode(&buf)?;

        Ok(Self {
            reader,
            header: Some(header),
            offset: HEADER_SIZE as u64,
            torn_at: None,
            done: false,
        })
    }

    /// The segment header, or `None` if the header itself was torn.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Offset of the first byte past the last complete entry, if the segment
    /// ends in a partially written entry.
    pub fn torn_tail(&self) -> Option<u64> {
        self.torn_at
    }

    /// Offset just past the last entry returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_entry(&mut self) -> Result<Option<Record<'static>>> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            _ => return Ok(self.tear()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(Error::Corrupted(format!(
                "entry at offset {} claims {} bytes",
                self.offset, len
            )));
        }

        let mut payload = vec![0u8; len];
        if read_full(&mut self.reader, &mut payload)? < len {
            return Ok(self.tear());
        }

        let mut crc_buf = [0u8; 4];
        if read_full(&mut self.reader, &mut crc_buf)? < 4 {
            return Ok(self.tear());
        }

        if CRC32.checksum(&payload) != u32::from_be_bytes(crc_buf) {
            return Err(Error::ChecksumMismatch);
        }

        let record = Record::decode(&payload)?;
        self.offset += (len + 8) as u64;
        Ok(Some(record))
    }

    fn tear(&mut self) -> Option<Record<'static>> {
        self.torn_at = Some(self.offset);
        None
    }
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Iterator for ReplayIterator {
    type Item = Result<Record<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn create_temp_wal(dir: &TempDir) -> Wal {
        Wal::open(&segment_path(dir.path(), 0), 0, WalOptions::default())
            .expect("Failed to initialize WAL")
    }

    #[test]
    fn test_append_and_flush() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = create_temp_wal(&dir);

        wal.append(&Record::set_bits("key1", 0, &[1, 2]))?;
        wal.append(&Record::set_bits("key2", 5, &[7]))?;
        wal.append(&Record::set_bits("key3", 1, &[0, 2]))?;
        wal.flush()?;

        assert_eq!(wal.entry_count(), 3);
        assert_eq!(wal.size(), std::fs::metadata(wal.path())?.len());
        Ok(())
    }

    #[test]
    fn test_replay_iterator() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = create_temp_wal(&dir);

        wal.append(&Record::set_bits("key1", 0, &[1]))?;
        wal.append(&Record::set_bits("key2", 3, &[4, 5]))?;
        wal.flush()?;

        let mut replay = Wal::replay(wal.path())?;
        let entries: Vec<_> = replay.by_ref().collect::<Result<Vec<_>>>()?;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Record::set_bits("key1", 0, &[1]));
        assert_eq!(entries[1], Record::set_bits("key2", 3, &[4, 5]));
        assert!(replay.torn_tail().is_none());
        assert_eq!(replay.header().map(|h| h.segment_id), Some(0));
        Ok(())
    }

    #[test]
    fn test_empty_replay() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = create_temp_wal(&dir);
        assert_eq!(Wal::replay(wal.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_reopen_appends_after_existing_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let path = segment_path(dir.path(), 3);
        {
            let wal = Wal::open(&path, 3, WalOptions::default())?;
            wal.append(&Record::set_bits("a", 0, &[0]))?;
            wal.flush()?;
        }
        let wal = Wal::open(&path, 3, WalOptions::default())?;
        wal.append(&Record::set_bits("b", 0, &[1]))?;
        wal.flush()?;

        let keys: Vec<String> = Wal::replay(&path)?
            .map(|r| r.map(|record| record.key().to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_reopen_rejects_mismatched_segment_id() -> Result<()> {
        let dir = TempDir::new()?;
        let path = segment_path(dir.path(), 1);
        Wal::open(&path, 1, WalOptions::default())?;
        assert!(matches!(
            Wal::open(&path, 2, WalOptions::default()),
            Err(Error::Corrupted(_))
        ));
        Ok(())
    }

    #[test]
    fn test_corrupted_wal() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = create_temp_wal(&dir);

        wal.append(&Record::set_bits("key1", 0, &[1]))?;
        wal.append(&Record::set_bits("key2", 0, &[2]))?;
        wal.flush()?;

        let mut file = OpenOptions::new().write(true).open(wal.path())?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6))?;
        file.write_all(b"garbage")?;
        file.sync_all()?;

        let results: Vec<_> = Wal::replay(wal.path())?.collect();
        assert!(matches!(results.last(), Some(Err(Error::ChecksumMismatch))));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = create_temp_wal(&dir);

        wal.append(&Record::set_bits("key1", 0, &[1]))?;
        wal.flush()?;
        let good_end = wal.size();
        wal.append(&Record::set_bits("key2", 0, &[2, 3, 4]))?;
        wal.flush()?;

        let file = OpenOptions::new().write(true).open(wal.path())?;
        file.set_len(wal.size() - 5)?;

        let mut replay = Wal::replay(wal.path())?;
        let entries: Vec<_> = replay.by_ref().collect::<Result<Vec<_>>>()?;
        assert_eq!(entries, vec![Record::set_bits("key1", 0, &[1])]);
        assert_eq!(replay.torn_tail(), Some(good_end));
        Ok(())
    }

    #[test]
    fn test_torn_header() -> Result<()> {
        let dir = TempDir::new()?;
        let path = segment_path(dir.path(), 9);
        std::fs::write(&path, b"BITB")?;

        let mut replay = Wal::replay(&path)?;
        assert!(replay.next().is_none());
        assert!(replay.header().is_none());
        assert_eq!(replay.torn_tail(), Some(0));
        Ok(())
    }

    #[test]
    fn test_concurrent_appends() -> Result<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new()?;
        let wal = Arc::new(create_temp_wal(&dir));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let wal = wal.clone();
                thread::spawn(move || {
                    let key = format!("key{}", t);
                    for i in 0..100u32 {
                        wal.append(&Record::set_bits(&key, i as u64, &[i]))
                            .expect("Failed to append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        wal.flush()?;

        let count = Wal::replay(wal.path())?
            .collect::<Result<Vec<_>>>()?
            .len();
        assert_eq!(count, 400);
        Ok(())
    }
}
