//! Frame-aware cache: association bookkeeping on top of a content store.
//!
//! **Why**: Playback needs to know which frames can be shown right now and
//! which content to keep when memory runs out. Content is shared between
//! frames (held frames, unchanged layers), so eviction works on reference
//! counts rather than on frames directly.
//!
//! **Used by**: caching workers (add, scheduling), display thread
//! (frame_items), playback controller (setters, stats)
//!
//! # Locking
//!
//! `FrameCache` owns one mutex around `CacheState`. `FrameCache::lock()`
//! hands out the guard so multi-step sequences (`test_in_cache` followed by
//! `promote_frame`) run atomically. Stats have their own lock, see `stats`.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use super::frame_index::FrameIndex;
use super::ranges::{compute_look_ahead_seconds_stat, RangeTracker};
use super::scheduler::{Booking, CacheTarget, InFlight, DEFAULT_IN_FLIGHT_TIMEOUT};
use super::shadow::ShadowCache;
use super::stats::{CacheStats, StatsAggregator};
use super::store::ContentStore;
use super::types::{Frame, IdTree, Item, ItemId, ProducerId, TreeResult};
use super::utility::{
    EvictionPolicy, FreeMode, LookaheadPolicy, PlaybackState, UtilityMode,
};

/// Drift between index and store found by `check_metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataReport {
    /// Indexed items the store no longer holds
    pub missing_items: Vec<ItemId>,
    /// Resident items the index does not know
    pub unindexed_items: Vec<ItemId>,
    /// Frame/item link halves without a counterpart
    pub broken_links: usize,
    /// Range tracker disagrees with the frame map
    pub stale_ranges: bool,
}

impl MetadataReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_items.is_empty()
            && self.unindexed_items.is_empty()
            && self.broken_links == 0
            && !self.stale_ranges
    }
}

/// Everything guarded by the main cache lock.
#[derive(Debug)]
pub struct CacheState<S: ContentStore> {
    pub(crate) store: S,
    pub(crate) index: FrameIndex,
    pub(crate) ranges: RangeTracker,
    pub(crate) playback: PlaybackState,
    pub(crate) policy: Box<dyn EvictionPolicy>,
    pub(crate) shadow: ShadowCache,
    pub(crate) in_flight: HashMap<Frame, InFlight>,
    pub(crate) scheduled_for_freeing: BTreeSet<Frame>,
    pub(crate) in_flight_timeout: Duration,
    /// Last booking ticket handed out
    pub(crate) next_ticket: u64,
    /// Usage at the last overflow; 0 = never overflowed
    pub(crate) overflow_boundary: usize,
    /// Store refusals since construction
    alloc_failures: u64,
    generation: Arc<AtomicU64>,
}

impl<S: ContentStore> CacheState<S> {
    pub fn new(store: S, policy: Box<dyn EvictionPolicy>, generation: Arc<AtomicU64>) -> Self {
        Self {
            store,
            index: FrameIndex::new(),
            ranges: RangeTracker::new(),
            playback: PlaybackState::default(),
            policy,
            shadow: ShadowCache::new(),
            in_flight: HashMap::new(),
            scheduled_for_freeing: BTreeSet::new(),
            in_flight_timeout: DEFAULT_IN_FLIGHT_TIMEOUT,
            next_ticket: 0,
            overflow_boundary: 0,
            alloc_failures: 0,
            generation,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct store access, bypassing the index (external eviction, tests).
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Invalidate the stats snapshot.
    pub(crate) fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Frame utility under the current playback state.
    ///
    /// In-flight frames are worth nothing more for caching.
    pub fn utility(&self, frame: Frame, mode: UtilityMode) -> f32 {
        if mode == UtilityMode::ForCaching && self.in_flight.contains_key(&frame) {
            return 0.0;
        }
        self.policy.utility(&self.playback, frame, mode)
    }

    // ---------------------------------------------------------------------
    // Bookkeeping primitives
    // ---------------------------------------------------------------------

    fn link(&mut self, frame: Frame, id: &ItemId) -> bool {
        if !self.index.reference(frame, id) {
            return false;
        }
        self.ranges.insert(frame);
        self.mark_dirty();
        true
    }

    fn unlink(&mut self, frame: Frame, id: &ItemId) -> bool {
        if !self.index.dereference(frame, id) {
            return false;
        }
        if !self.index.is_frame_cached(frame) {
            self.ranges.remove(frame);
        }
        self.mark_dirty();
        true
    }

    /// Drop every association of a frame. Items go to the trash once
    /// unreferenced; nothing leaves the store here.
    pub(crate) fn release_frame(&mut self, frame: Frame) -> bool {
        let Some(ids) = self.index.frame_ids(frame).cloned() else {
            return false;
        };
        for id in &ids {
            self.index.dereference(frame, id);
        }
        self.ranges.remove(frame);
        self.mark_dirty();
        true
    }

    /// Evict trash, oldest first, until `bytes` have been freed.
    pub(crate) fn purge_trash(&mut self, bytes: usize) -> usize {
        let mut freed = 0;
        let mut count = 0;
        while freed < bytes {
            let Some(id) = self.index.oldest_trash().cloned() else {
                break;
            };
            self.index.forget_item(&id);
            freed += self.store.remove(&id).unwrap_or(0);
            count += 1;
        }
        if count > 0 {
            debug!("purged {} trash items ({} bytes)", count, freed);
            self.mark_dirty();
        }
        freed
    }

    pub(crate) fn purge_all_trash(&mut self) -> usize {
        self.purge_trash(usize::MAX)
    }

    /// Remove an item from index, shadow slots and store.
    fn drop_item(&mut self, id: &ItemId) -> bool {
        let held_by = self.shadow.release_id(id);
        let known = match self.index.forget_item(id) {
            Some((_, emptied)) => {
                for frame in emptied {
                    self.ranges.remove(frame);
                }
                true
            }
            None => false,
        };
        let resident = self.store.remove(id).is_some();
        if known || resident {
            debug!("flushed {} (shadow slots: {})", id, held_by.len());
            self.mark_dirty();
        }
        known || resident
    }

    pub(crate) fn rebuild_ranges(&mut self) {
        self.ranges.clear();
        for frame in self.index.cached_frames() {
            self.ranges.insert(frame);
        }
    }

    fn record_overflow(&mut self) {
        let used = self.store.used();
        if self.overflow_boundary == 0 || used < self.overflow_boundary {
            debug!("overflow boundary set at {} bytes", used);
            self.overflow_boundary = used;
        }
    }

    // ---------------------------------------------------------------------
    // Frame index operations
    // ---------------------------------------------------------------------

    /// Associate `item` with `frame`, inserting it into the store if needed.
    ///
    /// Over budget, trash goes first, then frames with lower utility than
    /// `frame` (respecting the free mode). `force`, a partially cached frame
    /// or an empty cache skip the eviction and let usage overflow. Returns
    /// false when there was no room or the store refused the allocation;
    /// the caller should retry later.
    pub fn add(&mut self, item: &Item, frame: Frame, force: bool) -> bool {
        self.add_item(item, frame, force, None)
    }

    fn add_item(&mut self, item: &Item, frame: Frame, force: bool, producer: Option<ProducerId>) -> bool {
        let id = &item.id;
        let linked = self.index.frame_ids(frame).is_some_and(|ids| ids.contains(id));

        if let Some(bytes) = self.store.size_of(id) {
            if linked {
                return true;
            }
            if !self.index.knows_item(id) {
                self.index.register_item(id, bytes, producer);
            }
            return self.link(frame, id);
        }
        if self.index.knows_item(id) {
            // Evicted behind the index: bring the bytes back, keep every
            // frame that still records the item.
            debug!("add: {} was evicted behind the index, re-inserting", id);
        }

        let partial = self.has_partial_frame_cache(frame);
        let capacity = self.store.capacity();
        if self.store.used() + item.bytes > capacity {
            self.purge_trash(self.store.used() + item.bytes - capacity);

            if self.store.used() + item.bytes > capacity {
                self.record_overflow();

                let may_overflow = force || partial || self.index.item_count() == 0;
                if !may_overflow {
                    let missing = self.store.used() + item.bytes - capacity;
                    let target = self.policy.utility(&self.playback, frame, UtilityMode::ForCaching);
                    if !self.free_bytes_below(missing, target) {
                        debug!("add: no room for {} at frame {} ({} bytes short)", id, frame, missing);
                        return false;
                    }
                }
            }
        }

        if !self.store.insert(id.clone(), item.bytes) {
            self.record_overflow();
            self.alloc_failures += 1;
            warn!(
                "add: store refused {} ({} bytes) for frame {}, used {}",
                id,
                item.bytes,
                frame,
                self.store.used()
            );
            self.mark_dirty();
            return false;
        }

        // Eviction above may have purged a trashed entry for this id
        self.index.register_item(id, item.bytes, producer);
        if self.index.frame_ids(frame).is_some_and(|ids| ids.contains(id)) {
            self.mark_dirty();
            return true;
        }
        self.link(frame, id)
    }

    /// `add`, then record the item in the producer's shadow slot.
    pub fn add_from(&mut self, item: &Item, frame: Frame, producer: ProducerId) -> bool {
        self.add_item(item, frame, false, Some(producer)) && self.fill_slot(item, producer)
    }

    /// `add_from` for the display thread: never refused for lack of room.
    pub fn force_add_from(&mut self, item: &Item, frame: Frame, producer: ProducerId) -> bool {
        self.add_item(item, frame, true, Some(producer)) && self.fill_slot(item, producer)
    }

    fn fill_slot(&mut self, item: &Item, producer: ProducerId) -> bool {
        let change = self.shadow.replace(producer, Some(item.id.clone()));
        if change.changed {
            self.index.add_shadow_ref(&item.id);
            if let Some(old) = change.released {
                self.index.drop_shadow_ref(&old);
            }
            self.mark_dirty();
        }
        true
    }

    /// Reuse a resident item for another frame. False if the pair already
    /// exists or the item is not resident.
    pub fn reference_frame(&mut self, frame: Frame, id: &ItemId) -> bool {
        let Some(bytes) = self.store.size_of(id) else {
            return false;
        };
        if !self.index.knows_item(id) {
            self.index.register_item(id, bytes, None);
        }
        self.link(frame, id)
    }

    /// Remove one association. The item only becomes evictable once no
    /// frame or shadow slot references it.
    pub fn dereference_frame(&mut self, frame: Frame, id: &ItemId) -> bool {
        self.unlink(frame, id)
    }

    /// Items recorded for `frame`, verified against the store.
    ///
    /// `all_present` is false if anything recorded is gone, or nothing is
    /// recorded. The index is not repaired here.
    pub fn frame_items(&self, frame: Frame) -> (bool, Vec<Item>) {
        let Some(ids) = self.index.frame_ids(frame) else {
            return (false, Vec::new());
        };
        let mut missed = false;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.size_of(id) {
                Some(bytes) => items.push(Item { id: id.clone(), bytes }),
                None => missed = true,
            }
        }
        (!missed && !items.is_empty(), items)
    }

    /// Bookkeeping only; content is not verified.
    pub fn is_frame_cached(&self, frame: Frame) -> bool {
        self.index.is_frame_cached(frame)
    }

    /// Frame has associations but is incomplete: still being produced, or
    /// some recorded item has left the store.
    pub fn has_partial_frame_cache(&self, frame: Frame) -> bool {
        let Some(ids) = self.index.frame_ids(frame) else {
            return false;
        };
        self.in_flight.contains_key(&frame) || ids.iter().any(|id| !self.store.contains(id))
    }

    pub fn test_in_cache(&self, tree: &IdTree) -> TreeResult {
        let (mut found, mut total) = (0, 0);
        for id in tree.leaves() {
            total += 1;
            if self.store.contains(id) {
                found += 1;
            }
        }
        match found {
            0 => TreeResult::HasNoIds,
            n if n == total => TreeResult::HasAllIds,
            _ => TreeResult::HasSomeIds,
        }
    }

    /// Build frame associations from resident items without re-producing.
    pub fn promote_frame(&mut self, frame: Frame, tree: &IdTree) -> bool {
        if self.test_in_cache(tree) != TreeResult::HasAllIds {
            return false;
        }
        for id in tree.leaves() {
            if !self.index.knows_item(id) {
                let bytes = self.store.size_of(id).unwrap_or(0);
                self.index.register_item(id, bytes, None);
            }
            self.link(frame, id);
        }
        debug!("promoted frame {} ({} items)", frame, tree.leaf_count());
        true
    }

    /// Drop associations of `frame` that are not in `keep`. Returns count.
    pub fn trim_frame(&mut self, frame: Frame, keep: &[ItemId]) -> usize {
        let Some(ids) = self.index.frame_ids(frame) else {
            return 0;
        };
        let stale: Vec<ItemId> = ids.iter().filter(|id| !keep.contains(id)).cloned().collect();
        for id in &stale {
            self.unlink(frame, id);
        }
        if !stale.is_empty() {
            debug!("trimmed {} stale items from frame {}", stale.len(), frame);
        }
        stale.len()
    }

    /// Remove an item everywhere, including the store.
    pub fn flush(&mut self, id: &ItemId) -> bool {
        self.drop_item(id)
    }

    /// Flush every known or resident item whose id contains any of the
    /// patterns (source reload). Returns count flushed.
    pub fn flush_matching(&mut self, patterns: &[&str]) -> usize {
        let matches = |id: &ItemId| patterns.iter().any(|p| id.as_str().contains(p));
        let mut ids: BTreeSet<ItemId> = self.index.items().map(|(id, _)| id.clone()).filter(|id| matches(id)).collect();
        ids.extend(self.store.resident_ids().into_iter().filter(|id| matches(id)));

        let count = ids.iter().filter(|id| self.drop_item(id)).count();
        if count > 0 {
            info!("flushed {} items matching {:?}", count, patterns);
        }
        count
    }

    /// Release every frame but `frame`, ignoring the free mode. With `force`
    /// the released items are evicted too.
    pub fn clear_all_but_frame(&mut self, frame: Frame, force: bool) {
        for f in self.index.cached_frames() {
            if f != frame {
                self.release_frame(f);
            }
        }
        if force {
            self.purge_all_trash();
        }
        debug!(
            "cleared all but frame {} (force {}), {} frames left",
            frame,
            force,
            self.index.frame_count()
        );
    }

    /// Drop all frame-level state: associations, in-flight bookkeeping,
    /// overflow boundary. Shadow-held items stay resident.
    pub fn clear_frame_caches(&mut self) {
        for f in self.index.cached_frames() {
            self.release_frame(f);
        }
        self.purge_all_trash();
        self.in_flight.clear();
        self.scheduled_for_freeing.clear();
        self.overflow_boundary = 0;
        info!("frame caches cleared, {} bytes still resident", self.store.used());
    }

    pub fn ref_count(&self, id: &ItemId) -> usize {
        self.index.ref_count(id)
    }

    pub fn frame_count(&self) -> usize {
        self.index.frame_count()
    }

    pub fn item_count(&self) -> usize {
        self.index.item_count()
    }

    pub fn trash_len(&self) -> usize {
        self.index.trash_len()
    }

    /// Times the store refused an allocation. Workers compare it around a
    /// produce call to detect out-of-memory.
    pub fn alloc_failures(&self) -> u64 {
        self.alloc_failures
    }

    pub fn cached_ranges(&self) -> Vec<(Frame, Frame)> {
        self.ranges.compute_cached_ranges_stat()
    }

    // ---------------------------------------------------------------------
    // Shadow cache
    // ---------------------------------------------------------------------

    /// Producer teardown: drop its slot and every item it produced.
    pub fn flush_per_node_cache(&mut self, producer: ProducerId) {
        if let Some(old) = self.shadow.replace(producer, None).released {
            self.index.drop_shadow_ref(&old);
        }
        let ids = self.index.items_of_producer(producer);
        for id in &ids {
            self.drop_item(id);
        }
        debug!("producer {} torn down, {} items flushed", producer, ids.len());
        self.mark_dirty();
    }

    /// Item in the producer's slot, if still resident.
    pub fn per_node_cache_contents(&self, producer: ProducerId) -> Option<Item> {
        let id = self.shadow.slot(producer)?;
        let bytes = self.store.size_of(id)?;
        Some(Item { id: id.clone(), bytes })
    }

    pub fn is_current(&self, producer: ProducerId, id: &ItemId) -> bool {
        self.shadow.is_current(producer, id) && self.store.contains(id)
    }

    pub fn push_cachable_output_item(&mut self, name: impl Into<String>) {
        self.shadow.push_cachable_item(name);
    }

    pub fn pop_cachable_output_item(&mut self) -> Option<String> {
        self.shadow.pop_cachable_item()
    }

    // ---------------------------------------------------------------------
    // Playback state
    // ---------------------------------------------------------------------

    fn update_playback(&mut self, apply: impl FnOnce(&mut PlaybackState)) {
        let before = self.playback.clone();
        apply(&mut self.playback);
        if self.playback != before {
            self.mark_dirty();
        }
    }

    pub fn set_display_frame(&mut self, frame: Frame) {
        self.update_playback(|p| p.display_frame = frame);
    }

    pub fn set_display_inc(&mut self, inc: i32) {
        self.update_playback(|p| p.display_inc = inc.signum());
    }

    pub fn set_display_fps(&mut self, fps: f32) {
        self.update_playback(|p| p.display_fps = fps);
    }

    /// Loop range and absolute extents, all inclusive.
    pub fn set_in_out_frames(&mut self, in_frame: Frame, out_frame: Frame, min_frame: Frame, max_frame: Frame) {
        self.update_playback(|p| {
            p.in_frame = in_frame;
            p.out_frame = out_frame;
            p.min_frame = min_frame;
            p.max_frame = max_frame;
        });
    }

    /// Bookkeeping for the caching threads; utility does not depend on it.
    pub fn set_cache_frame(&mut self, frame: Frame) {
        self.playback.cache_frame = frame;
    }

    pub fn set_cache_wrap_frame(&mut self, frame: Frame) {
        self.playback.cache_wrap_frame = frame;
    }

    pub fn set_free_mode(&mut self, mode: FreeMode) {
        self.update_playback(|p| p.free_mode = mode);
    }

    pub fn set_look_behind_fraction(&mut self, fraction: f32) {
        self.update_playback(|p| p.look_behind_fraction = fraction.clamp(0.0, 1.0));
    }

    pub fn enable_active_tail_caching(&mut self, enabled: bool) {
        self.update_playback(|p| p.active_tail_caching = enabled);
    }

    pub fn set_cache_outside_region(&mut self, enabled: bool) {
        self.update_playback(|p| p.cache_outside_region = enabled);
    }

    pub fn set_policy(&mut self, policy: Box<dyn EvictionPolicy>) {
        info!("eviction policy: {} -> {}", self.policy.name(), policy.name());
        self.policy = policy;
    }

    /// New byte budget. Forgets the overflow boundary.
    pub fn set_capacity(&mut self, bytes: usize) {
        if bytes == self.store.capacity() {
            return;
        }
        self.store.set_capacity(bytes);
        self.overflow_boundary = 0;
        self.mark_dirty();
    }

    pub fn set_in_flight_timeout(&mut self, timeout: Duration) {
        self.in_flight_timeout = timeout;
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    pub fn compute_stats(&self) -> CacheStats {
        let cached_ranges = self.ranges.compute_cached_ranges_stat();
        CacheStats {
            capacity: self.store.capacity(),
            used: self.store.used(),
            look_ahead_seconds: compute_look_ahead_seconds_stat(&cached_ranges, &self.playback),
            cached_ranges,
        }
    }

    /// Compare index and store. Reports drift, never repairs it.
    pub fn check_metadata(&self) -> MetadataReport {
        let mut report = MetadataReport::default();

        for (id, entry) in self.index.items() {
            if !self.store.contains(id) {
                report.missing_items.push(id.clone());
            }
            report.broken_links += entry
                .frames
                .iter()
                .filter(|f| !self.index.frame_ids(**f).is_some_and(|ids| ids.contains(id)))
                .count();
        }
        for (frame, ids) in self.index.frames() {
            report.broken_links += ids
                .iter()
                .filter(|id| !self.index.item(id).is_some_and(|e| e.frames.contains(&frame)))
                .count();
            if !self.ranges.contains(frame) {
                report.stale_ranges = true;
            }
        }
        report.stale_ranges |= self.ranges.frame_count() != self.index.frame_count();
        report.unindexed_items = self
            .store
            .resident_ids()
            .into_iter()
            .filter(|id| !self.index.knows_item(id))
            .collect();
        report.missing_items.sort();

        if !report.is_consistent() {
            warn!(
                "metadata drift: {} missing, {} unindexed, {} broken links, stale ranges {}",
                report.missing_items.len(),
                report.unindexed_items.len(),
                report.broken_links,
                report.stale_ranges
            );
        }
        report
    }

    /// Human-readable dump of frames, ranges and trash.
    pub fn show_cache_contents(&self) -> String {
        let mut out = String::new();
        let capacity = self.store.capacity();
        let used = self.store.used();
        let pct = if capacity > 0 { used as f64 * 100.0 / capacity as f64 } else { 0.0 };
        let _ = writeln!(
            out,
            "cache: {} / {} bytes ({:.1}%), {} frames, {} items, {} trash, policy {}",
            used,
            capacity,
            pct,
            self.index.frame_count(),
            self.index.item_count(),
            self.index.trash_len(),
            self.policy.name()
        );

        let ranges: Vec<String> = self
            .ranges
            .runs()
            .map(|(s, e)| if s == e { s.to_string() } else { format!("{}-{}", s, e) })
            .collect();
        let _ = writeln!(out, "ranges: [{}]", ranges.join(", "));

        for (frame, ids) in self.index.frames() {
            let names: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
            let mark = if frame == self.playback.display_frame { " *" } else { "" };
            let _ = writeln!(out, "  {:>6}{}: {}", frame, mark, names.join(" "));
        }

        if !self.shadow.is_empty() {
            let _ = writeln!(out, "shadow slots: {}", self.shadow.len());
        }
        if self.index.trash_len() > 0 {
            let trash: Vec<String> = self.index.trash_ids().iter().map(|id| id.to_string()).collect();
            let _ = writeln!(out, "trash: {}", trash.join(" "));
        }
        if !self.in_flight.is_empty() {
            let mut frames: Vec<Frame> = self.in_flight.keys().copied().collect();
            frames.sort_unstable();
            let _ = writeln!(out, "in flight: {:?}", frames);
        }
        out
    }
}

/// Shared handle to the cache. Passed explicitly to the playback
/// controller and the caching workers.
#[derive(Debug)]
pub struct FrameCache<S: ContentStore> {
    state: Mutex<CacheState<S>>,
    stats: StatsAggregator,
    /// Bumped on playback changes so idle workers pick up new targets
    epoch: Arc<AtomicU64>,
}

impl<S: ContentStore> FrameCache<S> {
    pub fn new(store: S) -> Self {
        Self::with_policy(store, Box::new(LookaheadPolicy))
    }

    pub fn with_policy(store: S, policy: Box<dyn EvictionPolicy>) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        info!(
            "FrameCache: capacity {} MB, policy {}",
            store.capacity() / 1024 / 1024,
            policy.name()
        );
        Self {
            state: Mutex::new(CacheState::new(store, policy, Arc::clone(&generation))),
            stats: StatsAggregator::new(generation),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Main lock. Hold the guard across multi-step sequences.
    pub fn lock(&self) -> MutexGuard<'_, CacheState<S>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, CacheState<S>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn playback_changed(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // Producer / display side

    pub fn add(&self, item: &Item, frame: Frame, force: bool) -> bool {
        self.lock().add(item, frame, force)
    }

    pub fn add_from(&self, item: &Item, frame: Frame, producer: ProducerId) -> bool {
        self.lock().add_from(item, frame, producer)
    }

    pub fn reference_frame(&self, frame: Frame, id: &ItemId) -> bool {
        self.lock().reference_frame(frame, id)
    }

    pub fn dereference_frame(&self, frame: Frame, id: &ItemId) -> bool {
        self.lock().dereference_frame(frame, id)
    }

    pub fn frame_items(&self, frame: Frame) -> (bool, Vec<Item>) {
        self.lock().frame_items(frame)
    }

    pub fn is_frame_cached(&self, frame: Frame) -> bool {
        self.lock().is_frame_cached(frame)
    }

    pub fn flush_per_node_cache(&self, producer: ProducerId) {
        self.lock().flush_per_node_cache(producer)
    }

    pub fn complete_caching_of_frame(&self, booking: Booking) -> bool {
        self.lock().complete_caching_of_frame(booking)
    }

    pub fn initiate_caching_of_best_frame_group(&self, max_group: usize) -> Vec<Booking> {
        self.lock().initiate_caching_of_best_frame_group(max_group)
    }

    pub fn find_best_cache_target(&self) -> Option<CacheTarget> {
        self.lock().find_best_cache_target()
    }

    // Playback controller

    pub fn set_display_frame(&self, frame: Frame) {
        self.lock().set_display_frame(frame);
        self.playback_changed();
    }

    pub fn set_display_inc(&self, inc: i32) {
        self.lock().set_display_inc(inc);
        self.playback_changed();
    }

    pub fn set_display_fps(&self, fps: f32) {
        self.lock().set_display_fps(fps);
        self.playback_changed();
    }

    pub fn set_in_out_frames(&self, in_frame: Frame, out_frame: Frame, min_frame: Frame, max_frame: Frame) {
        self.lock().set_in_out_frames(in_frame, out_frame, min_frame, max_frame);
        self.playback_changed();
    }

    pub fn set_cache_frame(&self, frame: Frame) {
        self.lock().set_cache_frame(frame);
    }

    pub fn set_cache_wrap_frame(&self, frame: Frame) {
        self.lock().set_cache_wrap_frame(frame);
    }

    pub fn set_free_mode(&self, mode: FreeMode) {
        self.lock().set_free_mode(mode);
        self.playback_changed();
    }

    pub fn set_look_behind_fraction(&self, fraction: f32) {
        self.lock().set_look_behind_fraction(fraction);
        self.playback_changed();
    }

    pub fn enable_active_tail_caching(&self, enabled: bool) {
        self.lock().enable_active_tail_caching(enabled);
        self.playback_changed();
    }

    pub fn set_capacity(&self, bytes: usize) {
        self.lock().set_capacity(bytes);
        self.playback_changed();
    }

    pub fn set_cache_outside_region(&self, enabled: bool) {
        self.lock().set_cache_outside_region(enabled);
        self.playback_changed();
    }

    pub fn set_policy(&self, policy: Box<dyn EvictionPolicy>) {
        self.lock().set_policy(policy);
        self.playback_changed();
    }

    pub fn set_in_flight_timeout(&self, timeout: Duration) {
        self.lock().set_in_flight_timeout(timeout);
    }

    /// Source reload: drop everything whose id matches.
    pub fn flush_matching(&self, patterns: &[&str]) -> usize {
        let count = self.lock().flush_matching(patterns);
        self.playback_changed();
        count
    }

    pub fn clear_frame_caches(&self) {
        self.lock().clear_frame_caches();
        self.playback_changed();
    }

    // Diagnostics

    pub fn overflowing(&self) -> bool {
        self.lock().overflowing()
    }

    pub fn emergency_free(&self) {
        self.lock().emergency_free()
    }

    pub fn garbage_collect(&self, force: bool) -> usize {
        self.lock().garbage_collect(force)
    }

    pub fn alloc_failures(&self) -> u64 {
        self.lock().alloc_failures()
    }

    pub fn check_metadata(&self) -> MetadataReport {
        self.lock().check_metadata()
    }

    pub fn show_cache_contents(&self) -> String {
        self.lock().show_cache_contents()
    }

    /// Non-blocking stats query.
    ///
    /// False (with `out` untouched) if another thread is reading or
    /// refreshing stats; callers retry. A busy cache serves the last
    /// snapshot.
    pub fn cache_stats(&self, out: &mut CacheStats) -> bool {
        self.stats
            .query(out, || self.try_lock().map(|state| state.compute_stats()))
    }

    /// Refresh the stats snapshot if anything changed. Blocks on the main
    /// lock, never while holding the stats lock.
    pub fn update_stats_if_dirty(&self) -> bool {
        self.stats.refresh_if_dirty(|| self.lock().compute_stats())
    }

    pub fn set_stats_disabled(&self, disabled: bool) {
        self.stats.set_disabled(disabled);
    }
}
