//! Per-producer shadow slots.
//!
//! Each upstream producer (graph node) owns one slot holding the id of the
//! item it most recently cached. The slot keeps that item alive through a
//! shadow reference on the index entry, so a producer can check "is my last
//! output still valid" without a frame lookup. When the graph tears a
//! producer down, `FrameCache::flush_per_node_cache` drops the slot.
//!
//! Slots only record ids. Reference counting lives in `FrameIndex`, one
//! shadow ref per slot, so two producers that end up with the same id each
//! hold their own reference and releasing one never frees the other's item.
//!
//! The shadow cache also keeps the set of named cachable output items that
//! output nodes register for the caching threads to pick up.

use std::collections::{BTreeSet, HashMap};

use super::types::{ItemId, ProducerId};

/// Outcome of replacing a producer's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    /// Slot content actually changed
    pub changed: bool,
    /// Id that lost its shadow reference
    pub released: Option<ItemId>,
}

#[derive(Debug, Default)]
pub struct ShadowCache {
    slots: HashMap<ProducerId, ItemId>,
    cachable_items: BTreeSet<String>,
}

impl ShadowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `id` in the producer's slot (or clear it with `None`).
    ///
    /// Setting the id already held is a no-op.
    pub fn replace(&mut self, producer: ProducerId, id: Option<ItemId>) -> SlotChange {
        if let (Some(current), Some(new)) = (self.slots.get(&producer), id.as_ref()) {
            if current == new {
                return SlotChange { changed: false, released: None };
            }
        }

        let released = match id {
            Some(new) => self.slots.insert(producer, new),
            None => self.slots.remove(&producer),
        };
        SlotChange {
            changed: true,
            released,
        }
    }

    pub fn slot(&self, producer: ProducerId) -> Option<&ItemId> {
        self.slots.get(&producer)
    }

    /// Does the producer's slot still hold `id`?
    pub fn is_current(&self, producer: ProducerId, id: &ItemId) -> bool {
        self.slots.get(&producer) == Some(id)
    }

    /// Clear every slot holding `id`, returning the producers affected.
    pub fn release_id(&mut self, id: &ItemId) -> Vec<ProducerId> {
        let producers: Vec<ProducerId> = self
            .slots
            .iter()
            .filter(|(_, held)| *held == id)
            .map(|(p, _)| *p)
            .collect();
        for p in &producers {
            self.slots.remove(p);
        }
        producers
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push_cachable_item(&mut self, name: impl Into<String>) {
        self.cachable_items.insert(name.into());
    }

    /// Take the first registered cachable item, in name order.
    pub fn pop_cachable_item(&mut self) -> Option<String> {
        self.cachable_items.pop_first()
    }
}
