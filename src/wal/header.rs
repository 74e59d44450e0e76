use crate::config::MAX_CHUNK_BITS;
use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"BITBOXWL";
const VERSION: u32 = 1;

/// Fixed header at the start of every WAL segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub segment_id: u64,
    /// Chunk width the segment's records are addressed in.
    pub chunk_bits: u32,
}

impl Header {
    pub fn new(segment_id: u64, chunk_bits: u32) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            segment_id,
            chunk_bits,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidHeader);
        }
        if self.version != VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported WAL version {}",
                self.version
            )));
        }
        if self.chunk_bits == 0 || self.chunk_bits % 64 != 0 || self.chunk_bits > MAX_CHUNK_BITS {
            return Err(Error::Corrupted(format!(
                "WAL segment {} has invalid chunk width {}",
                self.segment_id, self.chunk_bits
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..20].copy_from_slice(&self.segment_id.to_be_bytes());
        buf[20..24].copy_from_slice(&self.chunk_bits.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let header = Self {
            magic,
            version: (&buf[8..12]).read_u32::<BigEndian>()?,
            segment_id: (&buf[12..20]).read_u64::<BigEndian>()?,
            chunk_bits: (&buf[20..24]).read_u32::<BigEndian>()?,
        };
        header.validate()?;
        Ok(header)
    }
}
