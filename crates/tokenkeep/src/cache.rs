//! In-memory cache for token-request blobs.
//!
//! Fixed-capacity second-chance (CLOCK) cache: each slot carries a
//! referenced bit that is set on read; the eviction hand rotates through
//! the ring, clearing bits until it finds an unreferenced slot to evict.
//! The cache is a latency optimization only; it is filled after successful
//! backend reads and writes and never consulted on an error path.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default capacity of the token-request cache.
pub const DEFAULT_REQUEST_CACHE_CAPACITY: usize = 1000;

struct CacheSlot {
    value: Vec<u8>,
    referenced: AtomicBool,
}

/// Thread-safe second-chance cache keyed by transaction id.
pub struct SecondChanceCache {
    map: Arc<DashMap<String, CacheSlot>>,
    ring: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl SecondChanceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Arc::new(DashMap::with_capacity(capacity)),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Look a key up, granting it a second chance on the next eviction
    /// sweep.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let slot = self.map.get(key);
        let hit = slot.is_some();
        tokenkeep_core::observe::record_cache_lookup(hit);
        let slot = slot?;
        slot.referenced.store(true, Ordering::Relaxed);
        Some(slot.value.clone())
    }

    /// Insert or update a key. At capacity, the clock hand evicts the
    /// first unreferenced slot, clearing referenced bits as it passes.
    pub fn add(&self, key: String, value: Vec<u8>) {
        if let Some(slot) = self.map.get(&key) {
            slot.referenced.store(true, Ordering::Relaxed);
            drop(slot);
            self.map.insert(
                key,
                CacheSlot {
                    value,
                    referenced: AtomicBool::new(true),
                },
            );
            return;
        }

        let mut ring = self.ring.lock();
        if self.map.len() >= self.capacity {
            self.evict_one(&mut ring);
        }
        self.map.insert(
            key.clone(),
            CacheSlot {
                value,
                referenced: AtomicBool::new(false),
            },
        );
        ring.push_back(key);
    }

    /// Remove a key.
    pub fn delete(&self, key: &str) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_one(&self, ring: &mut VecDeque<String>) {
        // Each pass clears one referenced bit, so the sweep terminates
        // after at most two rotations.
        let mut remaining = ring.len() * 2 + 1;
        while remaining > 0 {
            remaining -= 1;
            let Some(key) = ring.pop_front() else {
                return;
            };
            match self.map.get(&key) {
                None => continue, // stale ring entry, deleted out of band
                Some(slot) => {
                    if slot.referenced.swap(false, Ordering::Relaxed) {
                        drop(slot);
                        ring.push_back(key);
                    } else {
                        drop(slot);
                        self.map.remove(&key);
                        return;
                    }
                }
            }
        }
    }
}

impl Default for SecondChanceCache {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_CACHE_CAPACITY)
    }
}
