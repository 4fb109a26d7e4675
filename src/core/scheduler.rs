//! Cache scheduling: which frame to cache next and which to give up for it.
//!
//! Steady-state cycle run by the caching workers:
//! 1. `find_best_cache_target` - highest utility frame that is not cached,
//!    in flight, scheduled for freeing, or the display frame
//! 2. `find_best_free_target` - lowest utility victim strictly worse than
//!    the target, obeying the free mode
//! 3. `init_cache_free_pair` - book both so other workers skip them
//! 4. producer renders and calls `add`, worker calls
//!    `complete_caching_of_frame` with its booking
//!
//! Candidates come from the range tracker: utility extrema over a set of
//! cached frames lie on the display frame, the loop/extent bounds, or the
//! edge of a cached run. Scanning those keeps a cycle O(#runs).

use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::cache::CacheState;
use super::store::ContentStore;
use super::types::{Frame, ItemId};
use super::utility::UtilityMode;

/// In-flight entries older than this are considered abandoned.
pub const DEFAULT_IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bookkeeping for a frame a worker is producing.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    /// Victim booked to make room for it
    pub free_frame: Option<Frame>,
    pub started: Instant,
    pub ticket: u64,
}

/// A worker's claim on an in-flight frame.
///
/// Once a booking has expired the frame may be booked again; completing the
/// old booking then leaves the new one alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub frame: Frame,
    pub ticket: u64,
}

/// Scheduler pick: a frame, its utility and the direction to keep going in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheTarget {
    pub frame: Frame,
    pub utility: f32,
    pub inc: i32,
}

/// Does `a` rank before `b`? Utility first (higher wins when caching, lower
/// when freeing), then closer to the display frame, then lower frame.
fn outranks(a: (Frame, f32), b: (Frame, f32), display: Frame, prefer_high: bool) -> bool {
    if a.1 != b.1 {
        return if prefer_high { a.1 > b.1 } else { a.1 < b.1 };
    }
    let da = (a.0 as i64 - display as i64).abs();
    let db = (b.0 as i64 - display as i64).abs();
    if da != db {
        return da < db;
    }
    a.0 < b.0
}

impl<S: ContentStore> CacheState<S> {
    fn blocked_for_caching(&self, frame: Frame) -> bool {
        self.in_flight.contains_key(&frame)
            || self.scheduled_for_freeing.contains(&frame)
            || frame == self.playback.display_frame
    }

    /// First frame from `start` in direction `dir` that can be cached,
    /// jumping over cached runs.
    fn walk_to_uncached(&self, start: Frame, dir: i32) -> Option<Frame> {
        let mut f = start;
        while self.playback.in_extents(f) {
            if let Some((s, e)) = self.ranges.run_of(f) {
                f = if dir > 0 { e.checked_add(1)? } else { s.checked_sub(1)? };
                continue;
            }
            if !self.blocked_for_caching(f) {
                return Some(f);
            }
            f = f.checked_add(dir)?;
        }
        None
    }

    fn cache_seeds(&self) -> Vec<Frame> {
        let p = &self.playback;
        let mut seeds = vec![p.display_frame, p.in_frame, p.out_frame, p.min_frame, p.max_frame];
        for (s, e) in self.ranges.runs() {
            seeds.push(s.saturating_sub(1));
            seeds.push(e.saturating_add(1));
        }
        seeds
    }

    /// Cached frames worth considering as victims: each run's outermost
    /// frames not excluded, plus cached bounds and display neighbours.
    fn free_candidates(&self, excluded: impl Fn(Frame) -> bool) -> BTreeSet<Frame> {
        let mut out = BTreeSet::new();
        for (s, e) in self.ranges.runs() {
            if let Some(f) = (s..=e).find(|f| !excluded(*f)) {
                out.insert(f);
            }
            if let Some(f) = (s..=e).rev().find(|f| !excluded(*f)) {
                out.insert(f);
            }
        }

        let p = &self.playback;
        let extra = [
            p.display_frame.saturating_sub(1),
            p.display_frame.saturating_add(1),
            p.in_frame,
            p.out_frame,
            p.min_frame,
            p.max_frame,
        ];
        for f in extra {
            if self.index.is_frame_cached(f) && !excluded(f) {
                out.insert(f);
            }
        }
        out
    }

    /// Lowest-utility victim strictly below `threshold`.
    fn pick_victim(&self, threshold: f32, excluded: impl Fn(Frame) -> bool) -> Option<CacheTarget> {
        let display = self.playback.display_frame;
        let mut best: Option<CacheTarget> = None;

        for f in self.free_candidates(|f| f == display || self.in_flight.contains_key(&f) || excluded(f)) {
            if !self.playback.may_free(f) {
                continue;
            }
            let u = self.utility(f, UtilityMode::ForFreeing);
            if u >= threshold {
                continue;
            }
            if best.is_none_or(|b| outranks((f, u), (b.frame, b.utility), display, false)) {
                let inc = if self.playback.is_tail(f) { -self.playback.display_inc } else { self.playback.display_inc };
                best = Some(CacheTarget { frame: f, utility: u, inc });
            }
        }
        best
    }

    /// Best frame to cache next; None when there is nothing worth caching.
    pub fn find_best_cache_target(&mut self) -> Option<CacheTarget> {
        self.expire_stale_in_flight();

        let display = self.playback.display_frame;
        let mut best: Option<CacheTarget> = None;

        for seed in self.cache_seeds() {
            for dir in [-1, 1] {
                let Some(f) = self.walk_to_uncached(seed, dir) else {
                    continue;
                };
                let u = self.utility(f, UtilityMode::ForCaching);
                if u <= 0.0 {
                    continue;
                }
                if best.is_none_or(|b| outranks((f, u), (b.frame, b.utility), display, true)) {
                    best = Some(CacheTarget { frame: f, utility: u, inc: dir });
                }
            }
        }

        if let Some(t) = best {
            trace!("cache target {} utility {:.3} inc {}", t.frame, t.utility, t.inc);
        }
        best
    }

    /// Victim for `target`: lowest `ForFreeing` utility strictly below the
    /// target's, allowed by the free mode, not booked by another worker.
    pub fn find_best_free_target(&self, target: &CacheTarget) -> Option<CacheTarget> {
        let threshold = self.utility(target.frame, UtilityMode::ForFreeing);
        self.pick_victim(threshold, |f| self.scheduled_for_freeing.contains(&f))
    }

    pub fn init_cache_free_pair(&mut self, cache_frame: Frame, free_frame: Option<Frame>) -> Booking {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let previous = self.in_flight.insert(
            cache_frame,
            InFlight {
                free_frame,
                started: Instant::now(),
                ticket,
            },
        );
        if let Some(victim) = previous.and_then(|e| e.free_frame) {
            self.scheduled_for_freeing.remove(&victim);
        }
        if let Some(f) = free_frame {
            self.scheduled_for_freeing.insert(f);
        }
        trace!(
            "caching {} (victim {:?}), {} in flight, {} scheduled for freeing",
            cache_frame,
            free_frame,
            self.in_flight.len(),
            self.scheduled_for_freeing.len()
        );
        Booking { frame: cache_frame, ticket }
    }

    /// Would a target get room? While overflowing, only with a victim.
    fn may_cache(&self, victim: Option<&CacheTarget>) -> bool {
        victim.is_some() || !self.overflowing()
    }

    /// Book up to `max_group` contiguous frames in the target's direction.
    ///
    /// Returns the bookings in descending frame order; empty when saturated
    /// or overflowing without a victim.
    pub fn initiate_caching_of_best_frame_group(&mut self, max_group: usize) -> Vec<Booking> {
        let Some(target) = self.find_best_cache_target() else {
            return Vec::new();
        };
        let victim = self.find_best_free_target(&target);
        if !self.may_cache(victim.as_ref()) {
            return Vec::new();
        }
        let mut bookings = vec![self.init_cache_free_pair(target.frame, victim.map(|v| v.frame))];
        let mut next = target.frame;
        while bookings.len() < max_group.max(1) {
            let Some(f) = next.checked_add(target.inc) else {
                break;
            };
            next = f;
            if !self.playback.in_extents(f) || self.index.is_frame_cached(f) || self.blocked_for_caching(f) {
                break;
            }
            let u = self.utility(f, UtilityMode::ForCaching);
            if u <= 0.0 {
                break;
            }
            let candidate = CacheTarget { frame: f, utility: u, inc: target.inc };
            let victim = self.find_best_free_target(&candidate);
            if !self.may_cache(victim.as_ref()) {
                break;
            }
            bookings.push(self.init_cache_free_pair(f, victim.map(|v| v.frame)));
        }

        bookings.sort_unstable_by(|a, b| b.frame.cmp(&a.frame));
        debug!("caching group {:?}", bookings.iter().map(|b| b.frame).collect::<Vec<_>>());
        bookings
    }

    /// Worker finished (or gave up on) a booked frame. False if the booking
    /// expired and the frame was booked again since.
    pub fn complete_caching_of_frame(&mut self, booking: Booking) -> bool {
        let current = self
            .in_flight
            .get(&booking.frame)
            .is_some_and(|e| e.ticket == booking.ticket);
        if !current {
            trace!("booking {:?} no longer current", booking);
            return false;
        }
        self.clear_in_flight(booking.frame);
        true
    }

    fn clear_in_flight(&mut self, frame: Frame) {
        if let Some(entry) = self.in_flight.remove(&frame) {
            if let Some(victim) = entry.free_frame {
                self.scheduled_for_freeing.remove(&victim);
            }
        }
        self.mark_dirty();
    }

    /// Drop in-flight entries older than the timeout. Returns count.
    pub fn expire_stale_in_flight(&mut self) -> usize {
        let timeout = self.in_flight_timeout;
        let stale: Vec<Frame> = self
            .in_flight
            .iter()
            .filter(|(_, e)| e.started.elapsed() >= timeout)
            .map(|(f, _)| *f)
            .collect();
        for f in &stale {
            warn!("frame {} in flight for over {:?}, dropping", f, timeout);
            self.clear_in_flight(*f);
        }
        stale.len()
    }

    /// Make `bytes` available, evicting frames with `ForFreeing` utility
    /// below `target_utility` (free mode respected).
    pub(crate) fn free_bytes_below(&mut self, bytes: usize, target_utility: f32) -> bool {
        let capacity = self.store.capacity();
        if self.store.used() + bytes <= capacity {
            return true;
        }
        let goal = capacity.saturating_sub(bytes);
        self.purge_trash(self.store.used() - goal);

        let mut tried = BTreeSet::new();
        while self.store.used() > goal {
            let Some(victim) = self.pick_victim(target_utility, |f| tried.contains(&f)) else {
                break;
            };
            tried.insert(victim.frame);
            debug!(
                "freeing frame {} (utility {:.3} < {:.3})",
                victim.frame, victim.utility, target_utility
            );
            self.release_frame(victim.frame);

            let used = self.store.used();
            if used > goal {
                self.purge_trash(used - goal);
            }
        }
        self.store.used() <= goal
    }

    /// Make `bytes` available if the free mode allows it.
    pub fn free_bytes(&mut self, bytes: usize) -> bool {
        self.free_bytes_below(bytes, f32::MAX)
    }

    /// Usage reached the last overflow point and there is no trash to
    /// reclaim.
    pub fn overflowing(&self) -> bool {
        self.overflow_boundary != 0
            && self.store.used() >= self.overflow_boundary
            && self.index.trash_len() == 0
    }

    /// Allocation failed: keep only the display frame, whatever the free mode.
    pub fn emergency_free(&mut self) {
        self.overflow_boundary = self.store.used();
        let display = self.playback.display_frame;

        let mut released = 0;
        for f in self.index.cached_frames() {
            if f != display && self.release_frame(f) {
                released += 1;
            }
        }
        let freed = self.purge_all_trash();
        self.scheduled_for_freeing.clear();
        self.mark_dirty();

        warn!(
            "emergency free: released {} frames, {} bytes freed, {} bytes in use (boundary {})",
            released,
            freed,
            self.store.used(),
            self.overflow_boundary
        );
    }

    /// Heal index/store drift and reclaim memory.
    ///
    /// Drops broken links and entries for items the store lost, purges the
    /// trash, then frees down to capacity per free mode. `force` clears
    /// everything but the display frame regardless of free mode. Returns
    /// bytes freed.
    pub fn garbage_collect(&mut self, force: bool) -> usize {
        let before = self.store.used();

        let repaired = self.index.repair_links();
        let lost: Vec<ItemId> = self
            .index
            .items()
            .filter(|(id, _)| !self.store.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            self.shadow.release_id(id);
            self.index.forget_item(id);
        }
        if repaired > 0 || !lost.is_empty() || self.ranges.frame_count() != self.index.frame_count() {
            warn!(
                "garbage collect: repaired {} links, dropped {} lost items",
                repaired,
                lost.len()
            );
            self.rebuild_ranges();
        }

        self.purge_all_trash();
        if force {
            self.clear_all_but_frame(self.playback.display_frame, true);
        } else if self.store.used() > self.store.capacity() {
            self.free_bytes_below(0, f32::MAX);
        }
        self.mark_dirty();

        let freed = before.saturating_sub(self.store.used());
        debug!("garbage collect (force {}): {} bytes freed", force, freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::core::types::Item;
    use crate::core::utility::{FreeMode, LookaheadPolicy};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn state(store: MemoryStore) -> CacheState<MemoryStore> {
        CacheState::new(store, Box::new(LookaheadPolicy), Arc::new(AtomicU64::new(0)))
    }

    fn frame_item(f: Frame) -> Item {
        Item::new(format!("f{}", f), 100)
    }

    fn frames(bookings: &[Booking]) -> Vec<Frame> {
        bookings.iter().map(|b| b.frame).collect()
    }

    /// Run scheduler cycles one frame at a time until idle. Returns frames
    /// successfully cached, in order.
    fn run_to_steady_state(c: &mut CacheState<MemoryStore>, max_cycles: usize) -> Vec<Frame> {
        let mut cached = Vec::new();
        for _ in 0..max_cycles {
            let bookings = c.initiate_caching_of_best_frame_group(1);
            if bookings.is_empty() {
                break;
            }
            for b in bookings {
                if c.add(&frame_item(b.frame), b.frame, false) {
                    cached.push(b.frame);
                }
                assert!(c.complete_caching_of_frame(b));
            }
        }
        cached
    }

    #[test]
    fn test_forward_caching_reaches_display_before_tail() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(1, 20, 1, 20);
        c.set_look_behind_fraction(0.0);
        c.set_display_inc(1);
        c.set_display_frame(10);

        // Display thread renders the current frame
        assert!(c.add(&frame_item(10), 10, false));
        let order = run_to_steady_state(&mut c, 100);

        assert_eq!(order, (11..=19).collect::<Vec<_>>());
        assert!((1..10).all(|f| !c.is_frame_cached(f)));
        assert_eq!(c.cached_ranges(), vec![(10, 19)]);
        assert!(c.overflowing());
    }

    #[test]
    fn test_reverse_scrub_splits_budget() {
        let mut c = state(MemoryStore::new(50 * 100));
        c.set_in_out_frames(1, 1000, 1, 1000);
        c.set_look_behind_fraction(0.2);
        c.enable_active_tail_caching(true);
        c.set_display_inc(-1);
        c.set_display_frame(50);
        assert!(c.add(&frame_item(50), 50, false));

        run_to_steady_state(&mut c, 500);

        let frames = c.index.cached_frames();
        let head = frames.iter().filter(|f| **f < 50).count();
        let tail = frames.iter().filter(|f| **f > 50).count();
        assert_eq!(head + tail + 1, 50);
        assert!((35..=45).contains(&head), "head {} tail {}", head, tail);
        let share = head as f32 / (head + tail) as f32;
        assert!((0.7..=0.9).contains(&share), "head share {}", share);
        // Both sides stay contiguous around the display frame
        assert_eq!(c.cached_ranges().len(), 1);
    }

    #[test]
    fn test_emergency_free_keeps_display_frame() {
        let mut c = state(MemoryStore::new(2000).with_hard_limit(1000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_display_inc(1);
        c.set_display_frame(5);
        for f in 0..10 {
            assert!(c.add(&frame_item(f), f, false));
        }
        assert!(!c.overflowing());

        // Allocation fails even when forced
        assert!(!c.add(&frame_item(10), 10, true));
        assert_eq!(c.alloc_failures(), 1);
        assert!(c.overflowing());

        c.emergency_free();
        assert_eq!(c.store().resident_ids(), vec![ItemId::new("f5")]);
        assert_eq!(c.frame_items(5), (true, vec![frame_item(5)]));
        assert_eq!(c.frame_count(), 1);
        assert!(!c.overflowing());

        // Below the recorded boundary caching resumes
        assert!(c.add(&frame_item(6), 6, false));
        assert!(!c.overflowing());
    }

    #[test]
    fn test_emergency_free_ignores_free_mode() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(0, 10, 0, 10);
        c.set_display_frame(3);
        c.add(&frame_item(3), 3, false);
        c.add(&frame_item(4), 4, false);
        c.add(&Item::new("shared", 100), 4, false);
        c.reference_frame(3, &ItemId::new("shared"));

        c.emergency_free();
        assert!(!c.is_frame_cached(4));
        assert!(c.store().contains(&ItemId::new("shared")));
        assert_eq!(c.store().used(), 200);
    }

    #[test]
    fn test_conservative_never_frees_loop_range() {
        let mut c = state(MemoryStore::new(1_000_000));
        c.set_in_out_frames(10, 20, 0, 40);
        c.set_display_inc(1);
        c.set_display_frame(15);
        for f in 0..=40 {
            c.add(&frame_item(f), f, true);
        }
        c.release_frame(16);
        let target = CacheTarget {
            frame: 16,
            utility: c.utility(16, UtilityMode::ForCaching),
            inc: 1,
        };

        while let Some(victim) = c.find_best_free_target(&target) {
            assert!(!(10..=20).contains(&victim.frame), "freed {}", victim.frame);
            c.release_frame(victim.frame);
        }
        let left = c.index.cached_frames();
        assert_eq!(left.first(), Some(&10));
        assert_eq!(left.last(), Some(&20));
        assert_eq!(left.len(), 10);
    }

    #[test]
    fn test_active_mode_frees_tail_only() {
        let mut c = state(MemoryStore::new(1_000_000));
        c.set_in_out_frames(0, 40, 0, 40);
        c.set_free_mode(FreeMode::Active);
        c.set_display_inc(1);
        c.set_display_frame(20);
        for f in 10..=30 {
            c.add(&frame_item(f), f, true);
        }
        let target = CacheTarget { frame: 31, utility: 10.0, inc: 1 };
        let victim = c.find_best_free_target(&target).expect("tail victim");
        assert!(victim.frame < 20);
        assert_eq!(victim.frame, 10);
    }

    #[test]
    fn test_free_target_strictly_worse() {
        let mut c = state(MemoryStore::new(1_000_000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_free_mode(FreeMode::Greedy);
        c.set_display_inc(1);
        c.set_display_frame(0);
        for f in 0..=5 {
            c.add(&frame_item(f), f, false);
        }
        // Every cached frame is worth more than 6
        let target = CacheTarget { frame: 6, utility: 1.0, inc: 1 };
        assert_eq!(c.find_best_free_target(&target), None);

        let far = CacheTarget { frame: 3, utility: 1.0, inc: 1 };
        c.release_frame(3);
        let victim = c.find_best_free_target(&far).expect("victim");
        assert_eq!(victim.frame, 5);
    }

    #[test]
    fn test_group_caching_descending() {
        let mut c = state(MemoryStore::new(1_000_000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_display_inc(1);
        c.set_display_frame(0);
        c.add(&frame_item(0), 0, false);

        let first = c.initiate_caching_of_best_frame_group(4);
        assert_eq!(frames(&first), vec![4, 3, 2, 1]);
        assert_eq!(frames(&c.initiate_caching_of_best_frame_group(4)), vec![8, 7, 6, 5]);
        assert_eq!(c.in_flight.len(), 8);

        // In-flight frames are worth nothing more
        assert_eq!(c.utility(3, UtilityMode::ForCaching), 0.0);
        assert!(c.complete_caching_of_frame(first[1]));
        assert!(c.utility(3, UtilityMode::ForCaching) > 1.0);

        c.set_display_inc(-1);
        c.set_display_frame(50);
        c.add(&frame_item(50), 50, false);
        assert_eq!(frames(&c.initiate_caching_of_best_frame_group(3)), vec![49, 48, 47]);
    }

    #[test]
    fn test_pair_booking_and_timeout() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_display_inc(1);
        c.set_display_frame(0);

        c.init_cache_free_pair(1, Some(40));
        let target = c.find_best_cache_target().expect("target");
        assert_eq!(target.frame, 2);
        assert!(c.scheduled_for_freeing.contains(&40));

        c.set_in_flight_timeout(Duration::ZERO);
        assert_eq!(c.expire_stale_in_flight(), 1);
        assert!(c.in_flight.is_empty());
        assert!(c.scheduled_for_freeing.is_empty());
    }

    #[test]
    fn test_late_completion_keeps_rebooked_frame() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_display_inc(1);
        c.set_display_frame(0);

        let slow = c.init_cache_free_pair(1, Some(40));
        c.set_in_flight_timeout(Duration::ZERO);
        assert_eq!(c.expire_stale_in_flight(), 1);

        c.set_in_flight_timeout(DEFAULT_IN_FLIGHT_TIMEOUT);
        let retry = c.init_cache_free_pair(1, Some(41));
        assert_ne!(slow, retry);

        // The abandoned worker finishes late
        assert!(!c.complete_caching_of_frame(slow));
        assert!(c.in_flight.contains_key(&1));
        assert!(c.scheduled_for_freeing.contains(&41));

        assert!(c.complete_caching_of_frame(retry));
        assert!(c.in_flight.is_empty());
        assert!(c.scheduled_for_freeing.is_empty());
    }

    #[test]
    fn test_equal_utility_prefers_closer_then_lower_frame() {
        // Same utility: closer to display wins, then the lower frame
        assert!(outranks((52, 2.0), (47, 2.0), 50, true));
        assert!(!outranks((47, 2.0), (52, 2.0), 50, false));
        assert!(outranks((48, 2.0), (52, 2.0), 50, true));
        assert!(outranks((48, 2.0), (52, 2.0), 50, false));

        // Stopped playhead: both neighbours score the same
        let mut c = state(MemoryStore::new(1_000_000));
        c.set_in_out_frames(0, 100, 0, 100);
        c.set_display_inc(0);
        c.set_display_frame(50);
        c.add(&frame_item(50), 50, false);
        assert_eq!(
            c.utility(49, UtilityMode::ForCaching),
            c.utility(51, UtilityMode::ForCaching)
        );
        let target = c.find_best_cache_target().expect("target");
        assert_eq!(target.frame, 49);

        // Victims: 48 and 52 tie at the run ends
        c.set_free_mode(FreeMode::Greedy);
        for f in [48, 49, 51, 52] {
            c.add(&frame_item(f), f, true);
        }
        assert_eq!(
            c.utility(48, UtilityMode::ForFreeing),
            c.utility(52, UtilityMode::ForFreeing)
        );
        let victim = c.pick_victim(f32::MAX, |_| false).expect("victim");
        assert_eq!(victim.frame, 48);
    }

    #[test]
    fn test_nothing_outside_extents() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(0, 2, 0, 2);
        c.set_display_inc(1);
        c.set_display_frame(0);
        c.add(&frame_item(0), 0, false);
        let order = run_to_steady_state(&mut c, 20);
        assert_eq!(order, vec![1, 2]);
        assert_eq!(c.find_best_cache_target(), None);
    }

    #[test]
    fn test_garbage_collect_heals_drift() {
        let mut c = state(MemoryStore::new(1000));
        c.add(&frame_item(1), 1, false);
        c.add(&frame_item(2), 2, false);
        c.add(&Item::new("loose", 100), 3, false);
        c.dereference_frame(3, &ItemId::new("loose"));

        c.store_mut().evict_external(&ItemId::new("f2"));
        assert!(!c.check_metadata().is_consistent());

        let freed = c.garbage_collect(false);
        assert_eq!(freed, 100);
        assert!(c.check_metadata().is_consistent());
        assert!(!c.is_frame_cached(2));
        assert_eq!(c.cached_ranges(), vec![(1, 1)]);
        assert_eq!(c.trash_len(), 0);
    }

    #[test]
    fn test_garbage_collect_force() {
        let mut c = state(MemoryStore::new(1000));
        c.set_in_out_frames(0, 10, 0, 10);
        c.set_display_frame(4);
        for f in 0..6 {
            c.add(&frame_item(f), f, false);
        }
        c.garbage_collect(true);
        assert_eq!(c.index.cached_frames(), vec![4]);
        assert_eq!(c.store().used(), 100);
    }

    #[test]
    fn test_free_bytes_respects_free_mode() {
        let mut c = state(MemoryStore::new(300));
        c.set_in_out_frames(0, 10, 0, 20);
        c.set_display_inc(1);
        c.set_display_frame(2);
        c.add(&frame_item(2), 2, false);
        c.add(&frame_item(3), 3, false);
        c.add(&frame_item(15), 15, false);

        assert!(c.free_bytes(100));
        assert!(!c.is_frame_cached(15));
        assert!(!c.free_bytes(200));
        assert!(c.is_frame_cached(3));
    }
}
