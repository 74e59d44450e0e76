//! Key index: owns every key's `ChunkStore` and the capacity budgets.
//!
//! Keys map to `Arc<ChunkStore>` handles in a concurrent skip list, so lookups
//! on different keys never contend. Creation is race-free: when two writers
//! create the same key at once, exactly one store is inserted and both get it.
//!
//! With eviction enabled, every lookup stamps the store with a logical clock.
//! Once more than `max_resident` keys are in memory, the stalest ones are
//! written to page files and dropped from the map; the next access reads the
//! page back. Page files are a memory cache only and are discarded on restart,
//! since the snapshot and WAL already hold every key.

use crossbeam_skiplist::SkipMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunk::{group_by_chunk, set_positions, ChunkStore};
use crate::error::{Error, Result};
use crate::snapshot::{self, ChunkImage, KeyImage};

/// A counter with an optional ceiling.
#[derive(Debug)]
pub struct Budget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl Budget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserves `n` units, failing without side effects if the ceiling would
    /// be crossed.
    pub fn try_reserve(&self, n: usize) -> bool {
        let Some(limit) = self.limit else {
            self.used.fetch_add(n, Ordering::SeqCst);
            return true;
        };
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(n).filter(|&total| total <= limit)
            })
            .is_ok()
    }

    /// Like `try_reserve`, but hands unconsumed units back when the returned
    /// reservation is dropped.
    pub fn reserve(&self, n: usize) -> Option<Reservation<'_>> {
        self.try_reserve(n).then_some(Reservation {
            budget: self,
            remaining: n,
        })
    }

    /// Adds units unconditionally (recovery must never drop data).
    pub fn add(&self, n: usize) {
        self.used.fetch_add(n, Ordering::SeqCst);
    }

    pub fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::SeqCst);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Units held against a `Budget` for an operation in progress.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a Budget,
    remaining: usize,
}

impl Reservation<'_> {
    /// Turns one reserved unit into a permanent one.
    pub fn consume(&mut self) {
        if self.remaining > 0 {
            self.remaining -= 1;
        } else {
            self.budget.add(1);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.release(self.remaining);
    }
}

/// Keys paged out of memory, by page file id.
#[derive(Debug, Default)]
struct Evicted {
    pages: HashMap<String, u64>,
    next_page: u64,
}

#[derive(Debug)]
struct Pager {
    dir: PathBuf,
    max_resident: usize,
    // Every move between `stores` and `pages` happens under this lock.
    evicted: Mutex<Evicted>,
}

#[derive(Debug, Clone, Copy)]
enum Create {
    No,
    Checked,
    Unchecked,
}

#[derive(Debug)]
pub struct KeyIndex {
    chunk_bits: u32,
    /// Resident keys only.
    stores: SkipMap<String, Arc<ChunkStore>>,
    keys: Budget,
    chunks: Budget,
    clock: AtomicU64,
    pager: Option<Pager>,
}

impl KeyIndex {
    pub fn new(chunk_bits: u32, max_keys: Option<usize>, max_chunks: Option<usize>) -> Self {
        Self {
            chunk_bits,
            stores: SkipMap::new(),
            keys: Budget::new(max_keys),
            chunks: Budget::new(max_chunks),
            clock: AtomicU64::new(0),
            pager: None,
        }
    }

    /// Keeps at most `max_resident` keys in memory. The least recently used
    /// ones are written to page files in `dir` and read back on next access.
    pub fn with_eviction(mut self, dir: impl Into<PathBuf>, max_resident: usize) -> Self {
        self.pager = Some(Pager {
            dir: dir.into(),
            max_resident: max_resident.max(1),
            evicted: Mutex::new(Evicted::default()),
        });
        self
    }

    pub fn chunk_bits(&self) -> u32 {
        self.chunk_bits
    }

    /// Returns the key's store without creating it, paging it back in if it
    /// was evicted.
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<ChunkStore>>> {
        self.resolve(key, Create::No)
    }

    /// Returns the key's store, creating it if needed. Fails with
    /// `ResourceExhausted` if a new key would exceed the key limit.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<ChunkStore>> {
        self.resolve(key, Create::Checked)?
            .ok_or_else(|| Error::InvalidState(format!("key {:?} was not created", key)))
    }

    /// Like `get_or_create`, but ignores the key limit. Used by recovery.
    pub(crate) fn get_or_create_unchecked(&self, key: &str) -> Result<Arc<ChunkStore>> {
        self.resolve(key, Create::Unchecked)?
            .ok_or_else(|| Error::InvalidState(format!("key {:?} was not created", key)))
    }

    /// Runs `f` under the writer guard of the key's resident store. A store
    /// evicted between lookup and locking is looked up again.
    pub(crate) fn with_writer<T>(
        &self,
        key: &str,
        f: impl FnOnce(&ChunkStore) -> Result<T>,
    ) -> Result<T> {
        self.lock_resident(key, Create::No, f)
    }

    fn lock_resident<T>(
        &self,
        key: &str,
        create: Create,
        f: impl FnOnce(&ChunkStore) -> Result<T>,
    ) -> Result<T> {
        loop {
            let store = self
                .resolve(key, create)?
                .ok_or_else(|| Error::InvalidState(format!("key {:?} does not exist", key)))?;
            let _guard = store.lock()?;
            if store.is_evicted() {
                continue;
            }
            return f(&store);
        }
    }

    /// Sets bits addressed in `chunk_bits`-wide chunks, re-chunking when that
    /// width differs from this index's. Ignores capacity limits.
    pub(crate) fn restore_bits(
        &self,
        key: &str,
        chunk_bits: u32,
        chunk_index: u64,
        bits: &[u32],
    ) -> Result<()> {
        if let Some(&bit) = bits.iter().find(|&&bit| bit >= chunk_bits) {
            return Err(Error::Corrupted(format!(
                "bit {} of key {:?} is outside a {}-bit chunk",
                bit, key, chunk_bits
            )));
        }

        if chunk_bits == self.chunk_bits {
            return self.lock_resident(key, Create::Unchecked, |store| {
                self.count_allocation(store.apply(chunk_index, bits));
                Ok(())
            });
        }

        let base = chunk_index.checked_mul(chunk_bits as u64).ok_or_else(|| {
            Error::Corrupted(format!("chunk {} of key {:?} overflows", chunk_index, key))
        })?;
        let offsets = bits
            .iter()
            .map(|&bit| base.checked_add(bit as u64))
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| {
                Error::Corrupted(format!("chunk {} of key {:?} overflows", chunk_index, key))
            })?;
        self.lock_resident(key, Create::Unchecked, |store| {
            for update in group_by_chunk(&offsets, self.chunk_bits) {
                self.count_allocation(store.apply(update.index, &update.bits));
            }
            Ok(())
        })
    }

    /// ORs a full page image, re-chunking when widths differ. Ignores capacity
    /// limits.
    pub(crate) fn restore_image(
        &self,
        key: &str,
        chunk_bits: u32,
        chunk_index: u64,
        words: &[u64],
    ) -> Result<()> {
        if words.len() != (chunk_bits / 64) as usize {
            return Err(Error::Corrupted(format!(
                "image of chunk {} of key {:?} has {} words, expected {}",
                chunk_index,
                key,
                words.len(),
                chunk_bits / 64
            )));
        }
        if chunk_bits != self.chunk_bits {
            return self.restore_bits(key, chunk_bits, chunk_index, &set_positions(words));
        }

        self.lock_resident(key, Create::Unchecked, |store| {
            self.count_allocation(store.merge(chunk_index, words));
            Ok(())
        })
    }

    /// Every key, resident or evicted, in key order.
    pub(crate) fn keys(&self) -> Result<Vec<String>> {
        let resident = self.stores.iter().map(|entry| entry.key().clone());
        let mut keys: Vec<String> = match &self.pager {
            Some(pager) => {
                let evicted = pager.evicted.lock()?;
                resident.chain(evicted.pages.keys().cloned()).collect()
            }
            None => resident.collect(),
        };
        keys.sort_unstable();
        Ok(keys)
    }

    /// Copies a key's contents out, reading its page if it is evicted. Does
    /// not count as an access.
    pub(crate) fn image(&self, key: &str) -> Result<KeyImage> {
        if let Some(entry) = self.stores.get(key) {
            return Ok(image_of(key, entry.value()));
        }
        if let Some(pager) = &self.pager {
            let evicted = pager.evicted.lock()?;
            if let Some(entry) = self.stores.get(key) {
                return Ok(image_of(key, entry.value()));
            }
            if let Some(&page) = evicted.pages.get(key) {
                return snapshot::read_page(&page_path(&pager.dir, page));
            }
        }
        Err(Error::InvalidState(format!("key {:?} is not in the index", key)))
    }

    fn resolve(&self, key: &str, create: Create) -> Result<Option<Arc<ChunkStore>>> {
        if let Some(store) = self.resident(key) {
            return Ok(Some(store));
        }

        let store = match &self.pager {
            None => self.insert_new(key, create)?,
            Some(pager) => {
                let mut evicted = pager.evicted.lock()?;
                if let Some(store) = self.resident(key) {
                    return Ok(Some(store));
                }
                match evicted.pages.get(key).copied() {
                    Some(page) => {
                        let store = self.page_in(pager, key, page)?;
                        evicted.pages.remove(key);
                        Some(store)
                    }
                    None => self.insert_new(key, create)?,
                }
            }
        };

        if store.is_some() {
            self.evict_if_needed();
        }
        Ok(store)
    }

    fn resident(&self, key: &str) -> Option<Arc<ChunkStore>> {
        let store = self.stores.get(key)?.value().clone();
        store.touch(self.tick());
        Some(store)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert_new(&self, key: &str, create: Create) -> Result<Option<Arc<ChunkStore>>> {
        match create {
            Create::No => Ok(None),
            Create::Checked => {
                if !self.keys.try_reserve(1) {
                    return Err(Error::ResourceExhausted(format!(
                        "key limit of {} reached",
                        self.keys.limit().unwrap_or_default()
                    )));
                }
                let (store, created) = self.insert(key);
                if !created {
                    self.keys.release(1);
                }
                Ok(Some(store))
            }
            Create::Unchecked => {
                let (store, created) = self.insert(key);
                if created {
                    self.keys.add(1);
                }
                Ok(Some(store))
            }
        }
    }

    fn insert(&self, key: &str) -> (Arc<ChunkStore>, bool) {
        let fresh = Arc::new(ChunkStore::new(self.chunk_bits));
        fresh.touch(self.tick());
        let entry = self.stores.get_or_insert(key.to_string(), fresh.clone());
        let created = Arc::ptr_eq(entry.value(), &fresh);
        (entry.value().clone(), created)
    }

    fn page_in(&self, pager: &Pager, key: &str, page: u64) -> Result<Arc<ChunkStore>> {
        let path = page_path(&pager.dir, page);
        let image = snapshot::read_page(&path)?;
        if image.key != key {
            return Err(Error::Corrupted(format!(
                "page {:?} holds key {:?}, expected {:?}",
                path, image.key, key
            )));
        }

        let words = (self.chunk_bits / 64) as usize;
        let store = Arc::new(ChunkStore::new(self.chunk_bits));
        for chunk in &image.chunks {
            if chunk.words.len() != words {
                return Err(Error::Corrupted(format!(
                    "page {:?} chunk {} has {} words, expected {}",
                    path,
                    chunk.index,
                    chunk.words.len(),
                    words
                )));
            }
            store.merge(chunk.index, &chunk.words);
        }
        store.touch(self.tick());
        self.stores.insert(key.to_string(), store.clone());

        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(path = ?path, error = %e, "Failed to remove page file");
        }
        tracing::debug!(key = key, page = page, chunks = image.chunks.len(), "Paged key in");
        Ok(store)
    }

    /// Pages the least recently used keys out once more than the resident
    /// limit are in memory. On failure the keys stay resident.
    fn evict_if_needed(&self) {
        let Some(pager) = &self.pager else {
            return;
        };
        if self.stores.len() <= pager.max_resident {
            return;
        }
        if let Err(e) = self.evict_cold(pager) {
            tracing::warn!(error = %e, "Failed to evict cold keys");
        }
    }

    fn evict_cold(&self, pager: &Pager) -> Result<()> {
        let mut evicted = pager.evicted.lock()?;
        let resident = self.stores.len();
        if resident <= pager.max_resident {
            return Ok(());
        }
        // Go a little below the limit so the scan is not repeated for every
        // new key.
        let target = pager.max_resident - pager.max_resident / 16;

        let mut candidates: Vec<(u64, String, Arc<ChunkStore>)> = self
            .stores
            .iter()
            .map(|entry| {
                let store = entry.value().clone();
                (store.last_access(), entry.key().clone(), store)
            })
            .collect();
        candidates.sort_unstable_by_key(|(tick, _, _)| *tick);

        let mut paged = 0;
        for (_, key, store) in candidates.into_iter().take(resident - target) {
            self.page_out(pager, &mut evicted, &key, &store)?;
            paged += 1;
        }

        tracing::debug!(
            evicted = paged,
            resident = self.stores.len(),
            paged_out = evicted.pages.len(),
            "Evicted cold keys"
        );
        Ok(())
    }

    fn page_out(
        &self,
        pager: &Pager,
        evicted: &mut Evicted,
        key: &str,
        store: &ChunkStore,
    ) -> Result<()> {
        let _guard = store.lock()?;
        let page = evicted.next_page;
        snapshot::write_page(&page_path(&pager.dir, page), &image_of(key, store))?;

        evicted.next_page += 1;
        store.mark_evicted();
        self.stores.remove(key);
        evicted.pages.insert(key.to_string(), page);
        Ok(())
    }

    fn count_allocation(&self, allocated: bool) {
        if allocated {
            self.chunks.add(1);
        }
    }

    pub fn chunk_budget(&self) -> &Budget {
        &self.chunks
    }

    /// Every key, resident or not.
    pub fn key_count(&self) -> usize {
        self.keys.used()
    }

    pub fn resident_key_count(&self) -> usize {
        self.stores.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.used()
    }
}

fn page_path(dir: &Path, page: u64) -> PathBuf {
    dir.join(format!("{}.page", page))
}

fn image_of(key: &str, store: &ChunkStore) -> KeyImage {
    KeyImage {
        key: key.to_string(),
        chunks: store
            .chunk_images()
            .into_iter()
            .map(|(index, words)| ChunkImage { index, words })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lookup_does_not_create() -> Result<()> {
        let index = KeyIndex::new(64, None, None);
        assert!(index.lookup("missing")?.is_none());
        assert_eq!(index.key_count(), 0);
        Ok(())
    }

    #[test]
    fn test_get_or_create_is_idempotent() -> Result<()> {
        let index = KeyIndex::new(64, None, None);
        let a = index.get_or_create("k")?;
        let b = index.get_or_create("k")?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(index.key_count(), 1);
        Ok(())
    }

    #[test]
    fn test_keys_are_byte_sensitive() -> Result<()> {
        let index = KeyIndex::new(64, None, None);
        index.get_or_create("Key")?.set_bit(1)?;
        assert!(index.lookup("key")?.is_none());
        assert!(index.lookup("Key ")?.is_none());
        assert_eq!(index.lookup("Key")?.unwrap().get_bit(1), 1);
        Ok(())
    }

    #[test]
    fn test_racing_creators_share_one_store() -> Result<()> {
        let index = Arc::new(KeyIndex::new(64, None, None));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let index = index.clone();
                thread::spawn(move || {
                    let store = index.get_or_create("shared").unwrap();
                    store.set_bit(t).unwrap();
                    store
                })
            })
            .collect();
        let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(index.key_count(), 1);
        let store = index.lookup("shared")?.unwrap();
        assert!((0..8).all(|bit| store.get_bit(bit) == 1));
        Ok(())
    }

    #[test]
    fn test_key_limit() -> Result<()> {
        let index = KeyIndex::new(64, Some(2), None);
        index.get_or_create("a")?;
        index.get_or_create("b")?;
        index.get_or_create("a")?;
        assert!(matches!(
            index.get_or_create("c"),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(index.lookup("c")?.is_none());
        Ok(())
    }

    #[test]
    fn test_restore_same_width() -> Result<()> {
        let index = KeyIndex::new(64, Some(1), Some(1));
        index.restore_bits("k", 64, 2, &[5])?;
        index.restore_image("k", 64, 9, &[1 << 3])?;
        index.restore_bits("other", 64, 0, &[0])?;

        let store = index.lookup("k")?.unwrap();
        assert_eq!(store.get_bit(2 * 64 + 5), 1);
        assert_eq!(store.get_bit(9 * 64 + 3), 1);
        // Limits never reject recovered data.
        assert_eq!(index.key_count(), 2);
        assert_eq!(index.chunk_count(), 3);
        Ok(())
    }

    #[test]
    fn test_restore_rechunks_across_widths() -> Result<()> {
        let index = KeyIndex::new(64, None, None);
        index.restore_bits("k", 128, 1, &[0, 70])?;
        index.restore_image("k", 128, 0, &[1 << 1, 1])?;

        let store = index.lookup("k")?.unwrap();
        assert_eq!(store.get_bit(128), 1);
        assert_eq!(store.get_bit(198), 1);
        assert_eq!(store.get_bit(1), 1);
        assert_eq!(store.get_bit(64), 1);
        assert_eq!(store.chunk_indices(), vec![0, 1, 2, 3]);
        assert_eq!(index.chunk_count(), 4);
        Ok(())
    }

    #[test]
    fn test_restore_rejects_out_of_range() {
        let index = KeyIndex::new(64, None, None);
        assert!(matches!(
            index.restore_bits("k", 64, 0, &[64]),
            Err(Error::Corrupted(_))
        ));
        assert!(matches!(
            index.restore_image("k", 128, 0, &[0]),
            Err(Error::Corrupted(_))
        ));
    }

    fn paged(dir: &tempfile::TempDir, max_resident: usize) -> KeyIndex {
        KeyIndex::new(64, None, None).with_eviction(dir.path(), max_resident)
    }

    #[test]
    fn test_least_recently_used_key_is_evicted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let index = paged(&dir, 2);

        index.get_or_create("a")?.set_bits(&[1, 640])?;
        index.get_or_create("b")?.set_bits(&[2, 65])?;
        index.lookup("a")?;
        index.get_or_create("c")?.set_bit(3)?;

        assert_eq!(index.resident_key_count(), 2);
        assert!(index.stores.get("b").is_none());
        assert_eq!(index.key_count(), 3);
        assert_eq!(index.chunk_count(), 0);

        // Reading "b" pages it back in and pushes "a" out.
        let b = index.lookup("b")?.unwrap();
        assert_eq!((b.get_bit(2), b.get_bit(65), b.get_bit(3)), (1, 1, 0));
        assert!(index.stores.get("a").is_none());

        let a = index.lookup("a")?.unwrap();
        assert_eq!((a.get_bit(1), a.get_bit(640), a.get_bit(2)), (1, 1, 0));
        assert_eq!(a.chunk_indices(), vec![0, 10]);
        assert_eq!(index.keys()?, vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn test_evicted_image_matches_resident_one() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let index = paged(&dir, 1);

        index.get_or_create("a")?.set_bits(&[0, 64, 129])?;
        let before = index.image("a")?;
        index.get_or_create("b")?;
        assert!(index.stores.get("a").is_none());

        let evicted = index.image("a")?;
        assert_eq!(evicted.key, before.key);
        let words = |image: &KeyImage| -> Vec<(u64, Vec<u64>)> {
            image
                .chunks
                .iter()
                .map(|c| (c.index, c.words.clone()))
                .collect()
        };
        assert_eq!(words(&evicted), words(&before));
        // Reading the image does not page the key in.
        assert!(index.stores.get("a").is_none());
        Ok(())
    }

    #[test]
    fn test_writer_follows_evicted_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let index = paged(&dir, 1);

        let stale = index.get_or_create("a")?;
        stale.set_bit(1)?;
        index.get_or_create("b")?;
        assert!(stale.is_evicted());

        index.with_writer("a", |store| {
            assert!(!store.is_evicted());
            store.apply(0, &[7]);
            Ok(())
        })?;
        let store = index.lookup("a")?.unwrap();
        assert_eq!((store.get_bit(1), store.get_bit(7)), (1, 1));
        assert_eq!(stale.get_bit(7), 0);
        Ok(())
    }

    #[test]
    fn test_budget() {
        let budget = Budget::new(Some(3));
        assert!(budget.try_reserve(2));
        assert!(!budget.try_reserve(2));
        assert_eq!(budget.used(), 2);
        budget.release(1);
        assert!(budget.try_reserve(2));
        budget.add(5);
        assert_eq!(budget.used(), 8);

        let unlimited = Budget::new(None);
        assert!(unlimited.try_reserve(usize::MAX / 2));
    }

    #[test]
    fn test_reservation_returns_unused_units() {
        let budget = Budget::new(Some(4));
        {
            let mut reservation = budget.reserve(3).expect("fits");
            assert!(budget.reserve(2).is_none());
            reservation.consume();
        }
        assert_eq!(budget.used(), 1);
        assert!(budget.reserve(3).is_some());
        assert_eq!(budget.used(), 1);
    }
}
