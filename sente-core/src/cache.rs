//! Two-tier evaluation cache: an in-memory map with FIFO eviction in
//! front of an append-only disk journal. The memory tier stores entries
//! in compressed form; the disk tier is reached through a hash-to-offset
//! index and read on demand.
//!
//! A corrupt entry, an unreadable file or a failed decode is reported to
//! the caller as a plain miss.

use crate::codec::CompressedEntry;
use crate::journal::{self, JournalWriter, MAX_ENTRY_BYTES, RESERVED_HASH};
use crate::result::Netresult;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Maximum size of the memory tier in entries.
pub const MAX_CACHE_COUNT: usize = 150_000;

/// Minimum size of the memory tier in entries.
pub const MIN_CACHE_COUNT: usize = 6_000;

/// Nominal memory footprint of one cached entry, used for budgeting and
/// size estimation.
pub const ENTRY_SIZE: usize = 15_000;

/// Approximate cost of one disk-index slot relative to `ENTRY_SIZE`.
const INDEX_SLOT_DIVISOR: usize = 32;

/// Playout counts above this no longer grow the requested size.
const UNLIMITED_PLAYOUTS: usize = i32::MAX as usize;

/// A guard is appended after this many journal inserts.
const GUARD_INTERVAL: u64 = 1024;

struct Inner {
    /// Hot tier, keyed by position hash.
    cache: HashMap<u64, Arc<CompressedEntry>>,

    /// Insertion order of the hot tier; the front is the next evictee.
    order: VecDeque<u64>,

    /// Cold tier: hash to record offset in the journal file.
    index: HashMap<u64, u64>,

    journal: Option<JournalWriter>,
    journal_path: Option<PathBuf>,
    journal_inserts: u64,

    /// Requested total size in entries, before budget splitting.
    size: usize,

    max_cache_size: usize,
    max_index_size: usize,
}

impl Inner {
    /// Recompute the tier budgets from `size` and trim both tiers down to
    /// them. With a journal in play the first `MIN_CACHE_COUNT` entries go
    /// to memory, the remainder is split evenly, and everything the memory
    /// tier gives up is turned into index slots.
    fn apply_budgets(&mut self, reserve_filecache: bool) {
        let clamped = self.size.clamp(MIN_CACHE_COUNT, MAX_CACHE_COUNT);

        if reserve_filecache || self.journal.is_some() || !self.index.is_empty() {
            let cache_budget = MIN_CACHE_COUNT + (clamped - MIN_CACHE_COUNT) / 2;
            self.max_cache_size = cache_budget;
            self.max_index_size =
                self.size.saturating_sub(cache_budget) * ENTRY_SIZE / INDEX_SLOT_DIVISOR;
        } else {
            self.max_cache_size = clamped;
            self.max_index_size = 0;
        }

        info!(
            "cache budgeting: {} entries in memory, {} file-index slots",
            self.max_cache_size, self.max_index_size
        );

        while self.order.len() > self.max_cache_size {
            if let Some(evictee) = self.order.pop_front() {
                self.cache.remove(&evictee);
            }
        }
        self.trim_index();
    }

    /// Drop index entries until the budget holds. The evicted keys are
    /// implementation-defined; the file bytes stay in place and merely
    /// become unreachable until the next full scan.
    fn trim_index(&mut self) {
        while self.index.len() > self.max_index_size {
            let Some(&victim) = self.index.keys().next() else {
                break;
            };
            self.index.remove(&victim);
        }
    }
}

/// Process-wide evaluation cache. Shared by reference between the search
/// threads and the dispatcher; all methods take `&self`.
pub struct NNCache {
    inner: RwLock<Inner>,

    // Statistics, updated outside the lock.
    hits: AtomicU64,
    file_hits: AtomicU64,
    lookups: AtomicU64,
    inserts: AtomicU64,
}

impl Default for NNCache {
    fn default() -> Self {
        NNCache::new(MAX_CACHE_COUNT)
    }
}

impl NNCache {
    pub fn new(size: usize) -> Self {
        let mut inner = Inner {
            cache: HashMap::new(),
            order: VecDeque::new(),
            index: HashMap::new(),
            journal: None,
            journal_path: None,
            journal_inserts: 0,
            size,
            max_cache_size: 0,
            max_index_size: 0,
        };
        inner.apply_budgets(false);

        NNCache {
            inner: RwLock::new(inner),
            hits: AtomicU64::new(0),
            file_hits: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    /// Change the requested size and re-derive the tier budgets.
    pub fn resize(&self, size: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.size = size;
        inner.apply_budgets(false);
    }

    /// Size the cache so a full search of `max_playouts` playouts mostly
    /// hits memory.
    pub fn set_size_from_playouts(&self, max_playouts: usize) {
        let size = (3 * max_playouts.min(UNLIMITED_PLAYOUTS / 3))
            .clamp(MIN_CACHE_COUNT, MAX_CACHE_COUNT);
        self.resize(size);
    }

    /// Look up a previous evaluation. The read lock covers only the map
    /// probes; a cold hit re-reads the journal on a fresh handle owned by
    /// the calling thread.
    pub fn lookup(&self, hash: u64) -> Option<Netresult> {
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let (path, offset) = {
            let inner = self.inner.read().unwrap();
            if let Some(entry) = inner.cache.get(&hash) {
                let entry = Arc::clone(entry);
                drop(inner);

                return match entry.decode() {
                    Ok(result) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(result)
                    }
                    Err(_) => None,
                };
            }

            let offset = *inner.index.get(&hash)?;
            let path = inner.journal_path.clone()?;
            (path, offset)
        };

        match journal::read_entry_at(&path, offset, hash) {
            Ok(result) => {
                self.file_hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Err(_) => None,
        }
    }

    /// Insert a new evaluation. Re-inserting a hash already held in memory
    /// is a no-op. Entries that fit a journal record are also appended to
    /// the journal and registered in the disk index.
    pub fn insert(&self, hash: u64, result: &Netresult) {
        let mut inner = self.inner.write().unwrap();

        if inner.cache.contains_key(&hash) {
            return;
        }

        let entry = CompressedEntry::from_netresult(result);

        if hash != RESERVED_HASH && entry.serialized_len() <= MAX_ENTRY_BYTES {
            let mut journal_broken = false;

            let appended = inner.journal.as_mut().and_then(|writer| {
                match writer.append(hash, &entry) {
                    Ok(offset) => Some(offset),
                    Err(e) => {
                        warn!("cache journal append failed, closing it: {e}");
                        journal_broken = true;
                        None
                    }
                }
            });

            if let Some(offset) = appended {
                inner.index.insert(hash, offset);
                inner.journal_inserts += 1;

                if inner.journal_inserts % GUARD_INTERVAL == 0 {
                    if let Some(Err(e)) = inner.journal.as_mut().map(JournalWriter::write_guard) {
                        warn!("cache journal guard write failed, closing it: {e}");
                        journal_broken = true;
                    }
                }

                inner.trim_index();
            }

            if journal_broken {
                inner.journal = None;
            }
        }

        inner.cache.insert(hash, Arc::new(entry));
        inner.order.push_back(hash);
        self.inserts.fetch_add(1, Ordering::Relaxed);

        while inner.order.len() > inner.max_cache_size {
            if let Some(evictee) = inner.order.pop_front() {
                inner.cache.remove(&evictee);
            }
        }
    }

    /// Attach a journal file. In write mode the file is created when
    /// missing and opened for appending; in read-only mode an existing
    /// file only feeds the disk index. Returns false when the file cannot
    /// serve the requested role.
    pub fn load_cachefile(&self, filename: &str, read_only: bool) -> bool {
        let mut inner = self.inner.write().unwrap();

        inner.index.clear();
        inner.journal = None;
        inner.journal_path = Some(PathBuf::from(filename));

        let path = Path::new(filename);
        let existed = path.exists();

        if !existed && read_only {
            inner.journal_path = None;
            return false;
        }

        // Rebudget first: attaching a file hands half the headroom to the
        // disk index and prunes the memory tier accordingly.
        inner.apply_budgets(true);

        if existed {
            let mut recovered = HashMap::new();
            match journal::scan(path, |hash, offset| {
                recovered.insert(hash, offset);
            }) {
                Ok(_) => {}
                Err(journal::JournalError::BadMagic) => {
                    warn!("'{filename}' does not look like a result-cache file");
                    return false;
                }
                Err(e) => {
                    warn!("scan of '{filename}' stopped early: {e}");
                }
            }

            if !recovered.is_empty() {
                info!(
                    "loaded {} entries from the disk-backed cache ({filename})",
                    recovered.len()
                );
                inner.index = recovered;
                inner.trim_index();
            } else if read_only {
                inner.journal_path = None;
                return false;
            }
        }

        if !read_only {
            let opened = JournalWriter::open(path, !existed).and_then(|mut writer| {
                writer.write_guard()?;
                Ok(writer)
            });

            match opened {
                Ok(writer) => {
                    if !existed {
                        info!("created new disk-backed cache ({filename})");
                    }
                    inner.journal = Some(writer);
                }
                Err(e) => {
                    warn!("failed to start writing cache file '{filename}': {e}");
                    return false;
                }
            }
        }

        true
    }

    /// `(hits, lookups)` for the memory tier.
    pub fn hit_rate(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.lookups.load(Ordering::Relaxed),
        )
    }

    pub fn dump_stats(&self) {
        let hits = self.hits.load(Ordering::Relaxed);
        let file_hits = self.file_hits.load(Ordering::Relaxed);
        let lookups = self.lookups.load(Ordering::Relaxed);
        let inserts = self.inserts.load(Ordering::Relaxed);

        let inner = self.inner.read().unwrap();
        info!(
            "cache memory: {}/{} hits/lookups = {:.1}% hitrate, {} inserts, {} entries",
            hits,
            lookups,
            100.0 * hits as f64 / (lookups + 1) as f64,
            inserts,
            inner.cache.len()
        );
        info!(
            "cache file: {}/{} hits/lookups = {:.1}% hitrate, {} inserts, {} entries",
            file_hits,
            lookups,
            100.0 * file_hits as f64 / (lookups + 1) as f64,
            inserts,
            inner.index.len()
        );
    }

    /// Rough memory consumption in bytes.
    pub fn get_estimated_size(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.cache.len() * ENTRY_SIZE + inner.index.len() * INDEX_SLOT_DIVISOR
    }

    #[cfg(test)]
    fn tier_sizes(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        (inner.cache.len(), inner.index.len())
    }

    #[cfg(test)]
    fn budgets(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        (inner.max_cache_size, inner.max_index_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::NUM_INTERSECTIONS;

    fn sample_result(seed: u64) -> Netresult {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut result = Netresult::default();
        for _ in 0..25 {
            result.policy[rng.usize(..NUM_INTERSECTIONS)] = rng.f32();
        }
        result.policy_pass = rng.f32();
        result.winrate = rng.f32() * 2.0 - 1.0;
        result
    }

    fn quantized(result: &Netresult) -> Netresult {
        CompressedEntry::from_netresult(result).decode().unwrap()
    }

    #[test]
    fn test_insert_then_lookup() {
        let cache = NNCache::new(MIN_CACHE_COUNT);
        let result = sample_result(1);

        assert!(cache.lookup(0x1234).is_none());
        cache.insert(0x1234, &result);

        let found = cache.lookup(0x1234).unwrap();
        assert_eq!(found, quantized(&result));
        assert_eq!(found.policy_pass, result.policy_pass);
        assert_eq!(found.winrate, result.winrate);

        assert_eq!(cache.hit_rate(), (1, 2));
    }

    #[test]
    fn test_reinsert_is_a_noop() {
        let cache = NNCache::new(MIN_CACHE_COUNT);
        cache.insert(1, &sample_result(1));
        cache.insert(1, &sample_result(2));

        // The first result wins.
        assert_eq!(cache.lookup(1).unwrap(), quantized(&sample_result(1)));
    }

    #[test]
    fn test_oldest_entry_is_evicted() {
        let cache = NNCache::new(MIN_CACHE_COUNT);
        let result = sample_result(3);

        for hash in 0..=MIN_CACHE_COUNT as u64 {
            cache.insert(hash, &result);
        }

        assert!(cache.lookup(0).is_none());
        for hash in 1..=MIN_CACHE_COUNT as u64 {
            assert!(cache.lookup(hash).is_some(), "hash {hash} missing");
        }

        let (in_memory, _) = cache.tier_sizes();
        assert_eq!(in_memory, MIN_CACHE_COUNT);
    }

    #[test]
    fn test_budget_split_with_and_without_journal() {
        let cache = NNCache::new(MAX_CACHE_COUNT);
        assert_eq!(cache.budgets(), (MAX_CACHE_COUNT, 0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        assert!(cache.load_cachefile(path.to_str().unwrap(), false));

        let cache_budget = MIN_CACHE_COUNT + (MAX_CACHE_COUNT - MIN_CACHE_COUNT) / 2;
        let index_budget = (MAX_CACHE_COUNT - cache_budget) * ENTRY_SIZE / 32;
        assert_eq!(cache.budgets(), (cache_budget, index_budget));
    }

    #[test]
    fn test_set_size_from_playouts() {
        let cache = NNCache::new(MAX_CACHE_COUNT);

        cache.set_size_from_playouts(100);
        assert_eq!(cache.budgets(), (MIN_CACHE_COUNT, 0));

        cache.set_size_from_playouts(10_000);
        assert_eq!(cache.budgets(), (30_000, 0));

        cache.set_size_from_playouts(usize::MAX);
        assert_eq!(cache.budgets(), (MAX_CACHE_COUNT, 0));
    }

    #[test]
    fn test_reserved_hash_stays_out_of_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let cache = NNCache::new(MAX_CACHE_COUNT);
        assert!(cache.load_cachefile(path.to_str().unwrap(), false));

        cache.insert(RESERVED_HASH, &sample_result(1));
        let (in_memory, indexed) = cache.tier_sizes();
        assert_eq!((in_memory, indexed), (1, 0));

        // Still served from the memory tier.
        assert!(cache.lookup(RESERVED_HASH).is_some());
    }

    #[test]
    fn test_rehydration_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let filename = path.to_str().unwrap();

        {
            let cache = NNCache::new(MAX_CACHE_COUNT);
            assert!(cache.load_cachefile(filename, false));
            for hash in 1..=2000u64 {
                cache.insert(hash, &sample_result(hash));
            }
        }

        let reloaded = NNCache::new(MAX_CACHE_COUNT);
        assert!(reloaded.load_cachefile(filename, true));

        let (in_memory, indexed) = reloaded.tier_sizes();
        assert_eq!(in_memory, 0);
        assert_eq!(indexed, 2000);

        for hash in 1..=2000u64 {
            let found = reloaded.lookup(hash).unwrap();
            assert_eq!(found, quantized(&sample_result(hash)));
        }

        let (_, lookups) = reloaded.hit_rate();
        assert_eq!(lookups, 2000);
    }

    #[test]
    fn test_truncated_journal_still_rehydrates_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let filename = path.to_str().unwrap();

        {
            let cache = NNCache::new(MAX_CACHE_COUNT);
            assert!(cache.load_cachefile(filename, false));
            for hash in 1..=100u64 {
                cache.insert(hash, &sample_result(hash));
            }
        }

        // Tear off the tail, as an interrupted write would.
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 1]).unwrap();

        let reloaded = NNCache::new(MAX_CACHE_COUNT);
        assert!(reloaded.load_cachefile(filename, true));

        let (_, indexed) = reloaded.tier_sizes();
        assert_eq!(indexed, 99);
        for hash in 1..=99u64 {
            assert!(reloaded.lookup(hash).is_some(), "hash {hash} missing");
        }
    }

    #[test]
    fn test_read_only_load_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-file");

        let cache = NNCache::new(MAX_CACHE_COUNT);
        assert!(!cache.load_cachefile(path.to_str().unwrap(), true));
    }

    #[test]
    fn test_load_of_foreign_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign");
        std::fs::write(&path, b"definitely not a cache journal").unwrap();

        let cache = NNCache::new(MAX_CACHE_COUNT);
        assert!(!cache.load_cachefile(path.to_str().unwrap(), false));
    }

    #[test]
    fn test_estimated_size_tracks_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let cache = NNCache::new(MAX_CACHE_COUNT);
        assert!(cache.load_cachefile(path.to_str().unwrap(), false));

        for hash in 1..=10u64 {
            cache.insert(hash, &sample_result(hash));
        }

        assert_eq!(cache.get_estimated_size(), 10 * ENTRY_SIZE + 10 * 32);
    }
}
