//! # Memory Cache
//!
//! Bounded in-process store of decoded entries with strict LRU eviction.
//! Total cost (sum of `byte_size`) and entry count stay within the configured
//! limits after every mutation. Recency ties are impossible: every insert and
//! hit takes a fresh tick, so insertion order breaks what would otherwise tie.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::key::CacheKey;
use crate::cache::types::CacheEntry;

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

struct LruState {
    entries: HashMap<CacheKey, Slot>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    total_cost: u64,
    max_cost: u64,
    max_count: usize,
}

impl LruState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        self.total_cost -= slot.entry.byte_size;
        Some(slot.entry)
    }

    fn over_limits(&self) -> bool {
        (self.max_cost > 0 && self.total_cost > self.max_cost)
            || (self.max_count > 0 && self.entries.len() > self.max_count)
    }

    fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_limits() {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&key) {
                self.total_cost -= slot.entry.byte_size;
                evicted += 1;
            }
        }
        evicted
    }
}

/// Thread-safe LRU cache of [`CacheEntry`] values.
pub struct MemoryCache {
    state: Mutex<LruState>,
}

impl MemoryCache {
    /// Create a memory cache. A limit of 0 means unlimited.
    pub fn new(max_cost: u64, max_count: usize) -> Self {
        debug!(max_cost, max_count, "Memory cache created");
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                total_cost: 0,
                max_cost,
                max_count,
            }),
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let tick = state.bump();
        let slot = state.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        slot.entry.last_accessed_at = SystemTime::now();
        let entry = slot.entry.clone();

        state.order.remove(&old_tick);
        state.order.insert(tick, key.clone());
        Some(entry)
    }

    /// Check presence without touching recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Insert or replace an entry, evicting least recently used entries until
    /// the limits hold. An entry larger than the cost limit is not stored.
    pub fn set(&self, entry: CacheEntry) {
        let mut state = self.state.lock();
        state.remove(&entry.key);

        if state.max_cost > 0 && entry.byte_size > state.max_cost {
            debug!(
                key = %entry.key,
                size = entry.byte_size,
                max_cost = state.max_cost,
                "Entry too large for memory cache, skipping"
            );
            return;
        }

        let tick = state.bump();
        let key = entry.key.clone();
        state.total_cost += entry.byte_size;
        state.order.insert(tick, key.clone());
        state.entries.insert(key, Slot { entry, tick });

        let evicted = state.evict_to_limits();
        if evicted > 0 {
            debug!(
                evicted,
                total_cost = state.total_cost,
                "Evicted least recently used memory entries"
            );
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.total_cost = 0;
        debug!("Memory cache cleared");
    }

    pub fn current_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_cost(&self) -> u64 {
        self.state.lock().max_cost
    }

    /// Change the limits, evicting immediately if they shrank.
    pub fn set_limits(&self, max_cost: u64, max_count: usize) {
        let mut state = self.state.lock();
        state.max_cost = max_cost;
        state.max_count = max_count;
        state.evict_to_limits();
    }
}
