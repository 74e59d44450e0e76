//! Sparse, chunked storage for one key's bit vector.
//!
//! A key's bits live in fixed-width pages ("chunks") of `W` bits, keyed by
//! `offset / W` in a concurrent skip list. Chunks are allocated on the first
//! write into their range and are never moved, so writing far ahead of, or
//! below, every existing chunk costs exactly one new page and never copies
//! existing data.
//!
//! # Concurrency
//!
//! - **Reads are lock-free**: the chunk map is a `crossbeam-skiplist::SkipMap`
//!   and chunk words are atomics, so `get_bit` never blocks.
//! - **Writers are serialized per key**: `lock()` hands out the key's writer
//!   guard. Batch writers take it once per chunk rather than once per batch so
//!   other writers on the same key interleave between chunks.
//! - Bits only ever go from 0 to 1.

use crossbeam_skiplist::SkipMap;
use itertools::Itertools;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;

const WORD_BITS: u32 = u64::BITS;

/// Splits an absolute offset into `(chunk_index, bit_in_chunk)`.
pub fn locate(offset: u64, chunk_bits: u32) -> (u64, u32) {
    let width = chunk_bits as u64;
    (offset / width, (offset % width) as u32)
}

/// Positions of the set bits in a page image, ascending.
pub fn set_positions(words: &[u64]) -> Vec<u32> {
    words
        .iter()
        .enumerate()
        .flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i as u32 * WORD_BITS + bit)
        })
        .collect()
}

/// The bits of one batch that fall into a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpdate {
    pub index: u64,
    /// Positions within the chunk, sorted and deduplicated.
    pub bits: Vec<u32>,
}

/// Groups offsets by covering chunk, in ascending chunk order.
pub fn group_by_chunk(offsets: &[u64], chunk_bits: u32) -> Vec<ChunkUpdate> {
    offsets
        .iter()
        .map(|&offset| locate(offset, chunk_bits))
        .into_group_map()
        .into_iter()
        .sorted_by_key(|(index, _)| *index)
        .map(|(index, bits)| ChunkUpdate {
            index,
            bits: bits.into_iter().sorted_unstable().dedup().collect(),
        })
        .collect()
}

/// A zero-initialized page of `W` bits.
#[derive(Debug)]
pub struct Chunk {
    words: Box<[AtomicU64]>,
}

impl Chunk {
    pub fn new(chunk_bits: u32) -> Self {
        let words = (0..chunk_bits / WORD_BITS).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub fn from_words(words: &[u64]) -> Self {
        let words = words.iter().map(|&w| AtomicU64::new(w)).collect();
        Self { words }
    }

    pub fn get(&self, bit: u32) -> bool {
        let word = self.words[(bit / WORD_BITS) as usize].load(Ordering::Acquire);
        word & (1 << (bit % WORD_BITS)) != 0
    }

    /// Sets every bit in `bits`, one atomic OR per run of bits sharing a word.
    pub fn set_many(&self, bits: &[u32]) {
        for (word, group) in &bits.iter().chunk_by(|&&bit| bit / WORD_BITS) {
            let mask = group.fold(0u64, |mask, &bit| mask | 1 << (bit % WORD_BITS));
            self.words[word as usize].fetch_or(mask, Ordering::AcqRel);
        }
    }

    /// ORs a full page image into this chunk.
    pub fn merge(&self, words: &[u64]) {
        for (slot, &word) in self.words.iter().zip(words) {
            if word != 0 {
                slot.fetch_or(word, Ordering::AcqRel);
            }
        }
    }

    /// Copies the current contents out.
    pub fn words(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }

    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }
}

/// All chunks of a single key.
#[derive(Debug)]
pub struct ChunkStore {
    chunk_bits: u32,
    chunks: SkipMap<u64, Arc<Chunk>>,
    writer: Mutex<()>,
    /// Index clock value at the last lookup, for choosing eviction victims.
    last_access: AtomicU64,
    /// Set once the store's contents were paged out. Writers that find it set
    /// must look the key up again.
    evicted: AtomicBool,
}

impl ChunkStore {
    pub fn new(chunk_bits: u32) -> Self {
        Self {
            chunk_bits,
            chunks: SkipMap::new(),
            writer: Mutex::new(()),
            last_access: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn chunk_bits(&self) -> u32 {
        self.chunk_bits
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Callers hold the writer guard, so no write lands after the image taken
    /// for the page file.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Acquires this key's writer guard.
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.writer.lock()?)
    }

    pub fn set_bit(&self, offset: u64) -> Result<()> {
        let (index, bit) = locate(offset, self.chunk_bits);
        let _guard = self.lock()?;
        self.apply(index, &[bit]);
        Ok(())
    }

    /// Applies a batch chunk by chunk. Readers may observe some chunks of the
    /// batch updated before others.
    pub fn set_bits(&self, offsets: &[u64]) -> Result<()> {
        for update in group_by_chunk(offsets, self.chunk_bits) {
            let _guard = self.lock()?;
            self.apply(update.index, &update.bits);
        }
        Ok(())
    }

    pub fn get_bit(&self, offset: u64) -> u8 {
        let (index, bit) = locate(offset, self.chunk_bits);
        match self.chunks.get(&index) {
            Some(entry) => entry.value().get(bit) as u8,
            None => 0,
        }
    }

    /// Sets `bits` in chunk `index`, allocating the chunk if needed.
    /// Returns whether a chunk was allocated. Callers hold the writer guard.
    pub(crate) fn apply(&self, index: u64, bits: &[u32]) -> bool {
        let (chunk, allocated) = self.chunk_or_insert(index);
        chunk.set_many(bits);
        allocated
    }

    /// ORs a page image into chunk `index`. Returns whether a chunk was
    /// allocated. Callers hold the writer guard.
    pub(crate) fn merge(&self, index: u64, words: &[u64]) -> bool {
        match self.chunks.get(&index) {
            Some(entry) => {
                entry.value().merge(words);
                false
            }
            None => {
                self.chunks.insert(index, Arc::new(Chunk::from_words(words)));
                true
            }
        }
    }

    fn chunk_or_insert(&self, index: u64) -> (Arc<Chunk>, bool) {
        if let Some(entry) = self.chunks.get(&index) {
            return (entry.value().clone(), false);
        }
        let chunk = Arc::new(Chunk::new(self.chunk_bits));
        let entry = self.chunks.get_or_insert(index, chunk.clone());
        let allocated = Arc::ptr_eq(entry.value(), &chunk);
        (entry.value().clone(), allocated)
    }

    pub fn contains_chunk(&self, index: u64) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Number of chunks in `updates` that are not yet allocated.
    pub fn missing_chunks(&self, updates: &[ChunkUpdate]) -> usize {
        updates
            .iter()
            .filter(|update| !self.contains_chunk(update.index))
            .count()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_indices(&self) -> Vec<u64> {
        self.chunks.iter().map(|entry| *entry.key()).collect()
    }

    /// Copies every chunk out as `(index, words)`, in index order.
    pub fn chunk_images(&self) -> Vec<(u64, Vec<u64>)> {
        self.chunks
            .iter()
            .map(|entry| (*entry.key(), entry.value().words()))
            .collect()
    }

    pub fn count_ones(&self) -> u64 {
        self.chunks.iter().map(|entry| entry.value().count_ones()).sum()
    }
}
