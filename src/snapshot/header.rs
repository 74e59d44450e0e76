use crate::config::MAX_CHUNK_BITS;
use crate::error::Result;
use crate::wal::CRC32;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"BITBOXSN";
const VERSION: u32 = 1;
const CHECKSUM_OFFSET: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Chunk width the images were taken at.
    pub chunk_bits: u32,
    /// First WAL segment not covered by this snapshot.
    pub wal_id: u64,
    pub key_count: u64,
}

impl SnapshotHeader {
    pub fn new(chunk_bits: u32, wal_id: u64, key_count: u64) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            chunk_bits,
            wal_id,
            key_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidHeader);
        }
        if self.version != VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        if self.chunk_bits == 0 || self.chunk_bits % 64 != 0 || self.chunk_bits > MAX_CHUNK_BITS {
            return Err(Error::Corrupted(format!(
                "snapshot has invalid chunk width {}",
                self.chunk_bits
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.chunk_bits.to_be_bytes());
        buf[16..24].copy_from_slice(&self.wal_id.to_be_bytes());
        buf[24..32].copy_from_slice(&self.key_count.to_be_bytes());
        let checksum = CRC32.checksum(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        let version = cursor.read_u32::<BigEndian>()?;
        let chunk_bits = cursor.read_u32::<BigEndian>()?;
        let wal_id = cursor.read_u64::<BigEndian>()?;
        let key_count = cursor.read_u64::<BigEndian>()?;
        let checksum = cursor.read_u32::<BigEndian>()?;

        let header = Self {
            magic,
            version,
            chunk_bits,
            wal_id,
            key_count,
        };
        if header.magic != *MAGIC {
            return Err(Error::InvalidHeader);
        }
        if CRC32.checksum(&buf[..CHECKSUM_OFFSET]) != checksum {
            return Err(Error::ChecksumMismatch);
        }
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() -> Result<()> {
        let header = SnapshotHeader::new(4096, 17, 3);
        let decoded = SnapshotHeader::decode(&header.encode())?;
        assert_eq!(decoded, header);
        assert_eq!(decoded.wal_id, 17);
        assert_eq!(decoded.key_count, 3);
        Ok(())
    }

    #[test]
    fn test_header_detects_bit_flip() {
        let mut encoded = SnapshotHeader::new(4096, 17, 3).encode();
        encoded[20] ^= 0x01;
        assert!(matches!(
            SnapshotHeader::decode(&encoded),
            Err(Error::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_header_rejects_wrong_magic() {
        let mut encoded = SnapshotHeader::new(64, 0, 0).encode();
        encoded[0..8].copy_from_slice(b"BITBOXWL");
        assert!(matches!(
            SnapshotHeader::decode(&encoded),
            Err(Error::InvalidHeader)
        ));
    }
}
