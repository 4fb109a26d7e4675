//! Byte-budgeted content store.
//!
//! **Why**: The frame cache only does bookkeeping; the bytes themselves live
//! in a store that knows its capacity and what is resident. The real store is
//! owned by the host application; `MemoryStore` is the in-process reference
//! implementation used by tests and the simulator.
//!
//! **Used by**: FrameCache (residency checks, insert/remove during eviction)

use log::{debug, info, warn};
use std::collections::HashMap;
use sysinfo::System;

use super::types::ItemId;

/// Store primitive the frame cache consumes.
///
/// Implementations must be `Send` since the cache hands its state to worker
/// threads behind a mutex. That mutex is the only synchronization the store
/// gets.
pub trait ContentStore: Send {
    /// Byte budget.
    fn capacity(&self) -> usize;

    /// Bytes currently resident.
    fn used(&self) -> usize;

    /// Bytes still available under the budget.
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Is the id resident?
    fn contains(&self, id: &ItemId) -> bool {
        self.size_of(id).is_some()
    }

    /// Size of a resident item.
    fn size_of(&self, id: &ItemId) -> Option<usize>;

    /// Make an item resident. `false` means allocation failed.
    ///
    /// Inserting past the budget is allowed; the cache decides when to do so.
    fn insert(&mut self, id: ItemId, bytes: usize) -> bool;

    /// Drop an item, returning its size if it was resident.
    fn remove(&mut self, id: &ItemId) -> Option<usize>;

    /// Change the byte budget.
    fn set_capacity(&mut self, bytes: usize);

    /// Ids of all resident items (diagnostics).
    fn resident_ids(&self) -> Vec<ItemId>;
}

/// In-memory store with byte accounting.
///
/// `hard_limit` models the allocator: inserts that would push usage past it
/// fail regardless of the budget, which is how allocation failure shows up
/// when the budget is configured too high.
#[derive(Debug)]
pub struct MemoryStore {
    items: HashMap<ItemId, usize>,
    memory_usage: usize,
    max_memory_bytes: usize,
    hard_limit: Option<usize>,
}

impl MemoryStore {
    /// Store with a fixed byte budget.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            memory_usage: 0,
            max_memory_bytes: capacity,
            hard_limit: None,
        }
    }

    /// Store sized from available system memory.
    ///
    /// # Arguments
    ///
    /// * `mem_fraction` - Fraction of available memory (0.0-1.0, e.g. 0.75 = 75%)
    /// * `reserve_gb` - Reserve memory for system (GB, e.g. 2.0 = 2GB)
    pub fn from_system(mem_fraction: f64, reserve_gb: f64) -> Self {
        let limit = system_budget(mem_fraction, reserve_gb);
        info!(
            "MemoryStore init: limit={} MB ({}%)",
            limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
        Self::new(limit)
    }

    /// Fail inserts once usage would exceed `bytes`.
    pub fn with_hard_limit(mut self, bytes: usize) -> Self {
        self.hard_limit = Some(bytes);
        self
    }

    /// Number of resident items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict an item behind the cache's back (drift simulation, external pressure).
    pub fn evict_external(&mut self, id: &ItemId) -> bool {
        let removed = self.remove(id).is_some();
        if removed {
            debug!("MemoryStore: external eviction of {}", id);
        }
        removed
    }
}

impl ContentStore for MemoryStore {
    fn capacity(&self) -> usize {
        self.max_memory_bytes
    }

    fn used(&self) -> usize {
        self.memory_usage
    }

    fn size_of(&self, id: &ItemId) -> Option<usize> {
        self.items.get(id).copied()
    }

    fn insert(&mut self, id: ItemId, bytes: usize) -> bool {
        if self.items.contains_key(&id) {
            return true;
        }
        if let Some(limit) = self.hard_limit {
            if self.memory_usage + bytes > limit {
                warn!(
                    "MemoryStore: allocation of {} bytes for {} failed ({} / {} used)",
                    bytes, id, self.memory_usage, limit
                );
                return false;
            }
        }
        self.items.insert(id, bytes);
        self.memory_usage += bytes;
        true
    }

    fn remove(&mut self, id: &ItemId) -> Option<usize> {
        let removed = self.items.remove(id);
        if let Some(bytes) = removed {
            self.memory_usage = self.memory_usage.saturating_sub(bytes);
        }
        removed
    }

    fn set_capacity(&mut self, bytes: usize) {
        self.max_memory_bytes = bytes;
        info!("Memory limit updated: {} MB", bytes / 1024 / 1024);
    }

    fn resident_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.items.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Byte budget from available system memory minus a reserve.
pub fn system_budget(mem_fraction: f64, reserve_gb: f64) -> usize {
    let mut sys = System::new_all();
    sys.refresh_memory();

    let available = sys.available_memory() as usize;
    let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
    let usable = available.saturating_sub(reserve);
    (usable as f64 * mem_fraction.clamp(0.0, 1.0)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tracking() {
        let mut store = MemoryStore::new(1024 * 1024);

        assert!(store.insert(ItemId::new("a"), 512 * 1024));
        assert_eq!(store.used(), 512 * 1024);
        assert_eq!(store.available(), 512 * 1024);

        // Re-insert is a no-op
        assert!(store.insert(ItemId::new("a"), 512 * 1024));
        assert_eq!(store.used(), 512 * 1024);

        assert_eq!(store.remove(&ItemId::new("a")), Some(512 * 1024));
        assert_eq!(store.used(), 0);
        assert_eq!(store.remove(&ItemId::new("a")), None);
    }

    #[test]
    fn test_insert_past_budget_allowed() {
        let mut store = MemoryStore::new(100);
        assert!(store.insert(ItemId::new("a"), 80));
        assert!(store.insert(ItemId::new("b"), 80));
        assert_eq!(store.used(), 160);
        assert_eq!(store.available(), 0);
    }

    #[test]
    fn test_hard_limit_fails_allocation() {
        let mut store = MemoryStore::new(1000).with_hard_limit(150);
        assert!(store.insert(ItemId::new("a"), 100));
        assert!(!store.insert(ItemId::new("b"), 100));
        assert!(!store.contains(&ItemId::new("b")));
        assert_eq!(store.used(), 100);
    }

    #[test]
    fn test_from_system_budget() {
        let store = MemoryStore::from_system(0.5, 1.0);
        assert_eq!(store.used(), 0);
        assert!(store.is_empty());
    }
}
