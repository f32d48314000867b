//! In-memory image tier with cost-based LRU eviction.

use crate::cache::types::MemoryStats;
use crate::decoded::CachedImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Entry in the memory tier.
struct MemoryEntry {
    image: CachedImage,
    cost: u64,
    /// Last access time for LRU eviction
    last_accessed: Instant,
}

struct Inner {
    entries: HashMap<String, MemoryEntry>,
    total_cost: u64,
}

/// Bounded associative store from cache key to decoded image.
///
/// Enforces both a total-cost ceiling and an entry-count ceiling; when
/// either is exceeded on insertion, least-recently-accessed entries are
/// evicted until the store is back within both. A ceiling of zero means
/// unlimited. The store flushes entirely on a memory-pressure purge.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_cost: u64,
    max_count: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Create a memory tier with the given ceilings (0 = unlimited).
    pub fn new(max_cost: u64, max_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_cost: 0,
            }),
            max_cost,
            max_count,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Non-blocking read. Updates the entry's access time on hit.
    pub fn get(&self, key: &str) -> Option<CachedImage> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_accessed = Instant::now();
            let image = entry.image.clone();
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(image)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert or replace an entry, evicting as needed afterwards.
    pub fn put(&self, key: impl Into<String>, image: CachedImage, cost: u64) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();

        if let Some(previous) = inner.entries.insert(
            key,
            MemoryEntry {
                image,
                cost,
                last_accessed: Instant::now(),
            },
        ) {
            inner.total_cost = inner.total_cost.saturating_sub(previous.cost);
        }
        inner.total_cost += cost;

        self.evict_locked(&mut inner);
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }

    /// Flush the entire tier (explicit clear or memory-pressure purge).
    pub fn remove_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let flushed = inner.entries.len();
        inner.entries.clear();
        inner.total_cost = 0;
        if flushed > 0 {
            debug!(entries = flushed, "memory tier flushed");
        }
    }

    /// Whether a key is present, without touching access time.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.contains_key(key)
    }

    /// Current number of entries.
    pub fn entry_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.len()
    }

    /// Current total cost.
    pub fn total_cost(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.total_cost
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock().unwrap();
        MemoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: inner.entries.len(),
            total_cost: inner.total_cost,
        }
    }

    fn over_limit(&self, inner: &Inner) -> bool {
        (self.max_cost > 0 && inner.total_cost > self.max_cost)
            || (self.max_count > 0 && inner.entries.len() > self.max_count)
    }

    /// Evict least-recently-accessed entries until within both ceilings.
    fn evict_locked(&self, inner: &mut Inner) {
        if !self.over_limit(inner) {
            return;
        }

        let mut order: Vec<(String, Instant, u64)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.cost))
            .collect();
        order.sort_by_key(|(_, accessed, _)| *accessed);

        let mut evicted = 0u64;
        for (key, _, cost) in order {
            if !self.over_limit(inner) {
                break;
            }
            inner.entries.remove(&key);
            inner.total_cost = inner.total_cost.saturating_sub(cost);
            evicted += 1;
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(
                evicted,
                remaining = inner.entries.len(),
                total_cost = inner.total_cost,
                "memory tier eviction"
            );
        }
    }
}
