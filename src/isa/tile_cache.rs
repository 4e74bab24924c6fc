//! Tile cache (§3, §4.12): an LRU+refcount cache the program builder
//! consults to emit `LOAD_TILE` only on a miss. Active (locked) tiles are
//! pinned against eviction.

use fxhash::FxHashMap;

use crate::isa::instruction::Matrix;
use crate::types::{Cycle, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub matrix: Matrix,
    pub ti: usize,
    pub tj: usize,
    pub tk: usize,
}

#[derive(Debug, Clone)]
pub struct TileCacheEntry {
    pub key: TileKey,
    pub size: Size,
    pub refcount: u32,
    pub locked: bool,
    pub load_cycle: Cycle,
    pub last_access_cycle: Cycle,
}

/// Bounded by `capacity_bytes` (typically `l3_tile_capacity * num_l3`).
/// Eviction picks the least-recently-used *unlocked, zero-refcount* entry.
#[derive(Debug)]
pub struct TileCache {
    capacity_bytes: Size,
    used_bytes: Size,
    entries: FxHashMap<TileKey, TileCacheEntry>,
    /// Monotonic counter standing in for a clock; higher is more recent.
    clock: u64,
}

impl TileCache {
    pub fn new(capacity_bytes: Size) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            entries: FxHashMap::default(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// True if the tile is already resident (a cache hit) and bumps its
    /// recency; false means the caller must emit `LOAD_TILE`.
    pub fn touch(&mut self, key: TileKey, cycle: Cycle) -> bool {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_access_cycle = cycle;
            entry.refcount += 1;
            let _ = tick;
            true
        } else {
            false
        }
    }

    /// Records a fresh load, evicting LRU unlocked entries as needed to
    /// make room. Returns the keys evicted, in eviction order.
    pub fn insert_after_load(&mut self, key: TileKey, size: Size, cycle: Cycle) -> Vec<TileKey> {
        let mut evicted = Vec::new();
        while self.used_bytes + size > self.capacity_bytes {
            match self.pick_eviction_candidate() {
                Some(victim) => {
                    let entry = self.entries.remove(&victim).unwrap();
                    self.used_bytes -= entry.size;
                    evicted.push(victim);
                }
                None => break, // nothing evictable; caller's allocation will simply not fit
            }
        }
        self.used_bytes += size;
        self.entries.insert(
            key,
            TileCacheEntry {
                key,
                size,
                refcount: 1,
                locked: false,
                load_cycle: cycle,
                last_access_cycle: cycle,
            },
        );
        evicted
    }

    fn pick_eviction_candidate(&self) -> Option<TileKey> {
        self.entries
            .values()
            .filter(|e| !e.locked && e.refcount == 0)
            .min_by_key(|e| e.last_access_cycle)
            .map(|e| e.key)
    }

    pub fn release(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    pub fn lock(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.locked = true;
        }
    }

    pub fn unlock(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.locked = false;
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn used_bytes(&self) -> Size {
        self.used_bytes
    }

    pub fn entry(&self, key: &TileKey) -> Option<&TileCacheEntry> {
        self.entries.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tk: usize) -> TileKey {
        TileKey {
            matrix: Matrix::A,
            ti: 0,
            tj: 0,
            tk,
        }
    }

    #[test]
    fn miss_then_hit() {
        let mut cache = TileCache::new(1024);
        assert!(!cache.touch(key(0), 0));
        cache.insert_after_load(key(0), 256, 0);
        assert!(cache.touch(key(0), 1));
    }

    #[test]
    fn evicts_lru_unlocked_entry() {
        let mut cache = TileCache::new(256);
        cache.insert_after_load(key(0), 128, 0);
        cache.release(key(0));
        cache.insert_after_load(key(1), 128, 1);
        cache.release(key(1));
        // inserting a third 128-byte tile should evict key(0) (older, unlocked, refcount 0)
        let evicted = cache.insert_after_load(key(2), 128, 2);
        assert_eq!(evicted, vec![key(0)]);
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn locked_entries_survive_pressure() {
        let mut cache = TileCache::new(128);
        cache.insert_after_load(key(0), 128, 0);
        cache.release(key(0));
        cache.lock(key(0));
        // no room and nothing evictable (locked) -> insert still proceeds, simulating oversubscription
        let evicted = cache.insert_after_load(key(1), 128, 1);
        assert!(evicted.is_empty());
        assert!(cache.contains(&key(0)));
    }
}
