//! Contiguous cached-frame intervals, maintained incrementally.
//!
//! Every cached frame belongs to exactly one maximal run `[start, end]`.
//! Insert merges with neighbours, remove splits, both O(log n). The run
//! endpoints double as the "edges" the scheduler scans for cache and free
//! candidates, so target selection never walks every cached frame.

use std::collections::BTreeMap;

use super::types::{Frame, FrameRange};
use super::utility::PlaybackState;

#[derive(Debug, Default, Clone)]
pub struct RangeTracker {
    /// start -> end (inclusive)
    runs: BTreeMap<Frame, Frame>,
    frames: usize,
}

impl RangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run containing `frame`, if any.
    pub fn run_of(&self, frame: Frame) -> Option<FrameRange> {
        self.runs
            .range(..=frame)
            .next_back()
            .filter(|(_, end)| **end >= frame)
            .map(|(s, e)| (*s, *e))
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.run_of(frame).is_some()
    }

    /// Mark frame cached. Returns false if it already was.
    pub fn insert(&mut self, frame: Frame) -> bool {
        if self.contains(frame) {
            return false;
        }

        let left = frame
            .checked_sub(1)
            .and_then(|f| self.run_of(f))
            .filter(|(_, end)| *end == frame - 1);
        let right_end = frame.checked_add(1).and_then(|f| self.runs.get(&f).copied());

        let start = match left {
            Some((s, _)) => s,
            None => frame,
        };
        let end = match right_end {
            Some(e) => {
                self.runs.remove(&(frame + 1));
                e
            }
            None => frame,
        };
        self.runs.insert(start, end);
        self.frames += 1;
        true
    }

    /// Mark frame uncached. Returns false if it was not cached.
    pub fn remove(&mut self, frame: Frame) -> bool {
        let Some((start, end)) = self.run_of(frame) else {
            return false;
        };

        self.runs.remove(&start);
        if start < frame {
            self.runs.insert(start, frame - 1);
        }
        if frame < end {
            self.runs.insert(frame + 1, end);
        }
        self.frames -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.runs.clear();
        self.frames = 0;
    }

    /// Number of cached frames
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Iterate runs in frame order.
    pub fn runs(&self) -> impl Iterator<Item = FrameRange> + '_ {
        self.runs.iter().map(|(s, e)| (*s, *e))
    }

    /// Maximal cached runs, ascending.
    pub fn compute_cached_ranges_stat(&self) -> Vec<FrameRange> {
        self.runs().collect()
    }
}

/// Seconds of uninterrupted cached playback from the display frame in the
/// play direction.
///
/// `ranges` must be maximal and ascending (as produced by the tracker), so
/// the run containing the display frame is the whole look-ahead.
pub fn compute_look_ahead_seconds_stat(ranges: &[FrameRange], state: &PlaybackState) -> f32 {
    if state.display_inc == 0 || state.display_fps <= 0.0 || ranges.is_empty() {
        return 0.0;
    }
    let display = state.display_frame;

    let Some(&(start, end)) = ranges.iter().find(|(s, e)| *s <= display && display <= *e) else {
        return 0.0;
    };

    let frames = if state.display_inc > 0 { end - display } else { display - start };
    frames as f32 / state.display_fps
}
