//! Mutation records carried by the WAL.
//!
//! ```text
//! | kind=1:u8 | key_len:u16 | key | chunk:u64 | n:u32 | bit:u32 * n |
//! ```
//!
//! All integers are big-endian. One record covers the bits a single write set
//! in one chunk, addressed relative to the chunk start. The leading kind byte
//! leaves room for further record types.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::borrow::Cow;
use std::io::{Cursor, Read};

use crate::error::Result;
use crate::Error;

const KIND_SET_BITS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    key: Cow<'a, str>,
    chunk_index: u64,
    bits: Cow<'a, [u32]>,
}

impl<'a> Record<'a> {
    pub fn set_bits(key: &'a str, chunk_index: u64, bits: &'a [u32]) -> Self {
        Record {
            key: Cow::Borrowed(key),
            chunk_index,
            bits: Cow::Borrowed(bits),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    pub fn bits(&self) -> &[u32] {
        &self.bits
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.key.len() > u16::MAX as usize {
            return Err(Error::Encode(
                "key",
                format!("length {} exceeds u16", self.key.len()),
            ));
        }

        let mut buf = Vec::with_capacity(1 + 2 + self.key.len() + 8 + 4 + self.bits.len() * 4);
        buf.write_u8(KIND_SET_BITS)?;
        buf.write_u16::<BigEndian>(self.key.len() as u16)?;
        buf.extend_from_slice(self.key.as_bytes());
        buf.write_u64::<BigEndian>(self.chunk_index)?;
        buf.write_u32::<BigEndian>(self.bits.len() as u32)?;
        for &bit in self.bits.iter() {
            buf.write_u32::<BigEndian>(bit)?;
        }
        Ok(buf)
    }
}

impl Record<'static> {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let decode_err =
            |field: &'static str| move |e: std::io::Error| Error::Decode(field, e.to_string());

        let kind = cursor.read_u8().map_err(decode_err("kind"))?;
        if kind != KIND_SET_BITS {
            return Err(Error::Decode("kind", format!("unknown record kind {}", kind)));
        }

        let key_len = cursor
            .read_u16::<BigEndian>()
            .map_err(decode_err("key length"))? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).map_err(decode_err("key"))?;
        let key = String::from_utf8(key).map_err(|e| Error::Decode("key", e.to_string()))?;
        let chunk_index = cursor
            .read_u64::<BigEndian>()
            .map_err(decode_err("chunk index"))?;
        let count = cursor.read_u32::<BigEndian>().map_err(decode_err("count"))? as usize;

        let remaining = payload.len() - cursor.position() as usize;
        if remaining != count * 4 {
            return Err(Error::Decode("bits", format!("expected {} bits", count)));
        }
        let bits = (0..count)
            .map(|_| cursor.read_u32::<BigEndian>())
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(decode_err("bits"))?;

        Ok(Record {
            key: Cow::Owned(key),
            chunk_index,
            bits: Cow::Owned(bits),
        })
    }
}
