//! Frame <-> item bookkeeping with per-item reference counts.
//!
//! Structure:
//! - `frames`: frame -> ids used by that frame (ordered, so range scans and
//!   diagnostics come out sorted)
//! - `items`: id -> entry holding size, referencing frames and shadow refs
//! - `trash`: resident ids nobody references any more, oldest release first
//!
//! An item's reference count is the store baseline (1) plus one per
//! referencing frame plus one per shadow slot. Dropping to the baseline puts
//! the id in the trash; the cache purges trash before evicting frames. No
//! store calls happen here: `FrameIndex` is pure bookkeeping and is only
//! touched under the cache lock.

use indexmap::IndexSet;
use log::trace;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::types::{Frame, ItemId, ProducerId};

#[derive(Debug, Clone)]
pub struct ItemEntry {
    pub bytes: usize,
    pub frames: BTreeSet<Frame>,
    /// Number of producer shadow slots pointing at this item
    pub shadow_refs: usize,
    pub producer: Option<ProducerId>,
}

impl ItemEntry {
    fn is_unreferenced(&self) -> bool {
        self.frames.is_empty() && self.shadow_refs == 0
    }
}

#[derive(Debug, Default)]
pub struct FrameIndex {
    frames: BTreeMap<Frame, BTreeSet<ItemId>>,
    items: HashMap<ItemId, ItemEntry>,
    /// IndexSet keeps release order with O(1) lookup
    trash: IndexSet<ItemId>,
}

impl FrameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry for a newly resident item. Starts unreferenced.
    pub fn register_item(&mut self, id: &ItemId, bytes: usize, producer: Option<ProducerId>) {
        if self.items.contains_key(id) {
            return;
        }
        self.items.insert(
            id.clone(),
            ItemEntry {
                bytes,
                frames: BTreeSet::new(),
                shadow_refs: 0,
                producer,
            },
        );
        self.trash.insert(id.clone());
    }

    pub fn item(&self, id: &ItemId) -> Option<&ItemEntry> {
        self.items.get(id)
    }

    pub fn knows_item(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    /// Associate a known item with a frame. False if unknown or already linked.
    pub fn reference(&mut self, frame: Frame, id: &ItemId) -> bool {
        let Some(entry) = self.items.get_mut(id) else {
            return false;
        };
        if !entry.frames.insert(frame) {
            return false;
        }
        self.frames.entry(frame).or_default().insert(id.clone());
        self.trash.shift_remove(id);
        trace!("ref {} -> {} ({} frames)", frame, id, entry.frames.len());
        true
    }

    /// Remove one association. Returns true if it existed.
    ///
    /// Empty frame entries are dropped; the caller checks `is_frame_cached`
    /// afterwards to keep its range bookkeeping in step.
    pub fn dereference(&mut self, frame: Frame, id: &ItemId) -> bool {
        let Some(ids) = self.frames.get_mut(&frame) else {
            return false;
        };
        if !ids.remove(id) {
            return false;
        }
        if ids.is_empty() {
            self.frames.remove(&frame);
        }
        if let Some(entry) = self.items.get_mut(id) {
            entry.frames.remove(&frame);
            if entry.is_unreferenced() {
                self.trash.insert(id.clone());
            }
            trace!("deref {} -> {} ({} frames left)", frame, id, entry.frames.len());
        }
        true
    }

    pub fn add_shadow_ref(&mut self, id: &ItemId) -> bool {
        let Some(entry) = self.items.get_mut(id) else {
            return false;
        };
        entry.shadow_refs += 1;
        self.trash.shift_remove(id);
        true
    }

    pub fn drop_shadow_ref(&mut self, id: &ItemId) {
        if let Some(entry) = self.items.get_mut(id) {
            entry.shadow_refs = entry.shadow_refs.saturating_sub(1);
            if entry.is_unreferenced() {
                self.trash.insert(id.clone());
            }
        }
    }

    /// Drop an item and every association to it.
    ///
    /// Returns the item size and the frames whose entry became empty.
    pub fn forget_item(&mut self, id: &ItemId) -> Option<(usize, Vec<Frame>)> {
        let entry = self.items.remove(id)?;
        self.trash.shift_remove(id);

        let mut emptied = Vec::new();
        for frame in &entry.frames {
            if let Some(ids) = self.frames.get_mut(frame) {
                ids.remove(id);
                if ids.is_empty() {
                    self.frames.remove(frame);
                    emptied.push(*frame);
                }
            }
        }
        Some((entry.bytes, emptied))
    }

    /// 1 (store baseline) + frames + shadow slots; 0 if unknown.
    pub fn ref_count(&self, id: &ItemId) -> usize {
        self.items
            .get(id)
            .map(|e| 1 + e.frames.len() + e.shadow_refs)
            .unwrap_or(0)
    }

    pub fn frame_ids(&self, frame: Frame) -> Option<&BTreeSet<ItemId>> {
        self.frames.get(&frame)
    }

    pub fn is_frame_cached(&self, frame: Frame) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn frames(&self) -> impl Iterator<Item = (Frame, &BTreeSet<ItemId>)> {
        self.frames.iter().map(|(f, ids)| (*f, ids))
    }

    pub fn cached_frames(&self) -> Vec<Frame> {
        self.frames.keys().copied().collect()
    }

    pub fn items(&self) -> impl Iterator<Item = (&ItemId, &ItemEntry)> {
        self.items.iter()
    }

    pub fn items_of_producer(&self, producer: ProducerId) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .items
            .iter()
            .filter(|(_, e)| e.producer == Some(producer))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Oldest unreferenced item, without removing it.
    pub fn oldest_trash(&self) -> Option<&ItemId> {
        self.trash.first()
    }

    pub fn trash_len(&self) -> usize {
        self.trash.len()
    }

    pub fn trash_ids(&self) -> Vec<ItemId> {
        self.trash.iter().cloned().collect()
    }

    /// Remove link halves that have no counterpart (item lists a frame that
    /// does not list it back, or the reverse). Returns number of fixes.
    pub fn repair_links(&mut self) -> usize {
        let mut fixed = 0;

        for (id, entry) in self.items.iter_mut() {
            let before = entry.frames.len();
            entry
                .frames
                .retain(|f| self.frames.get(f).is_some_and(|ids| ids.contains(id)));
            fixed += before - entry.frames.len();
        }

        for ids in self.frames.values_mut() {
            let before = ids.len();
            ids.retain(|id| self.items.contains_key(id));
            fixed += before - ids.len();
        }
        self.frames.retain(|_, ids| !ids.is_empty());

        for (id, entry) in &self.items {
            if entry.is_unreferenced() && !self.trash.contains(id) {
                self.trash.insert(id.clone());
                fixed += 1;
            }
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ItemId {
        ItemId::new(s)
    }

    #[test]
    fn test_shared_item_refcount() {
        let mut index = FrameIndex::new();
        index.register_item(&id("A"), 100, None);
        assert_eq!(index.ref_count(&id("A")), 1);
        assert!(index.trash_ids().contains(&id("A")));

        assert!(index.reference(5, &id("A")));
        assert!(index.reference(6, &id("A")));
        assert!(!index.reference(6, &id("A")));
        assert_eq!(index.ref_count(&id("A")), 3);
        assert!(!index.trash_ids().contains(&id("A")));

        assert!(index.dereference(5, &id("A")));
        assert!(!index.is_frame_cached(5));
        assert!(!index.trash_ids().contains(&id("A")));
        assert_eq!(index.ref_count(&id("A")), 2);

        assert!(index.dereference(6, &id("A")));
        assert!(index.trash_ids().contains(&id("A")));
        assert_eq!(index.ref_count(&id("A")), 1);
    }

    #[test]
    fn test_reference_unknown_item() {
        let mut index = FrameIndex::new();
        assert!(!index.reference(1, &id("missing")));
        assert!(!index.is_frame_cached(1));
    }

    #[test]
    fn test_forget_item_reports_emptied_frames() {
        let mut index = FrameIndex::new();
        index.register_item(&id("A"), 10, None);
        index.register_item(&id("B"), 10, None);
        index.reference(1, &id("A"));
        index.reference(2, &id("A"));
        index.reference(2, &id("B"));

        let (bytes, emptied) = index.forget_item(&id("A")).expect("known item");
        assert_eq!(bytes, 10);
        assert_eq!(emptied, vec![1]);
        assert!(index.is_frame_cached(2));
        assert_eq!(index.item_count(), 1);
    }

    #[test]
    fn test_trash_release_order() {
        let mut index = FrameIndex::new();
        for name in ["a", "b", "c"] {
            index.register_item(&id(name), 1, None);
            index.reference(0, &id(name));
        }
        assert_eq!(index.trash_len(), 0);

        index.dereference(0, &id("b"));
        index.dereference(0, &id("a"));
        assert_eq!(index.oldest_trash(), Some(&id("b")));

        // Shadow ref revives it
        index.add_shadow_ref(&id("b"));
        assert_eq!(index.oldest_trash(), Some(&id("a")));
        index.drop_shadow_ref(&id("b"));
        assert_eq!(index.trash_ids(), vec![id("a"), id("b")]);
    }

    #[test]
    fn test_repair_links() {
        let mut index = FrameIndex::new();
        index.register_item(&id("a"), 1, None);
        index.reference(3, &id("a"));
        // Break one half of the link
        index.frames.get_mut(&3).map(|ids| ids.remove(&id("a")));

        assert!(index.repair_links() >= 2);
        assert!(!index.is_frame_cached(3));
        assert!(index.trash_ids().contains(&id("a")));
        assert_eq!(index.ref_count(&id("a")), 1);
    }
}
