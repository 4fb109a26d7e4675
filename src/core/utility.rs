//! Frame utility: how much a frame is worth caching, or how little it is
//! worth keeping.
//!
//! **Why**: Playback needs the frames just ahead of the playhead more than
//! anything else, a smaller share behind it for reverse scrubbing, and the
//! rest of the loop range after that. A single scalar per frame lets the
//! scheduler compare any cache candidate against any eviction victim.
//!
//! **Used by**: Scheduler (target selection), FrameCache (eviction during add)
//!
//! # Lookahead utility
//!
//! Inside the loop range, utility is `1 + 1/d` where `d` is the shortest
//! weighted distance from the display frame: direct, or wrapping round
//! either end of the loop. Distance in the play direction ("head") is scaled
//! by `fact = look_behind_fraction`, distance against it ("tail") by
//! `1 - fact`. At equilibrium a head frame at distance `h` ties with a tail
//! frame at `t` when `h * fact == t * (1 - fact)`, so the tail ends up
//! holding about `look_behind_fraction` of the budget and past that its
//! utility falls off faster than the head's.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::Frame;

/// Policy controlling whether frames inside the loop range may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FreeMode {
    /// Never frees inside the in/out range
    #[default]
    Conservative,
    /// Frees inside the in/out range, behind the display frame only
    Active,
    /// Frees anywhere inside the in/out range
    Greedy,
}

/// Which side of the ranking a utility value is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilityMode {
    ForCaching,
    ForFreeing,
}

/// Playback position and policy knobs the utility depends on.
///
/// All frame bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub display_frame: Frame,
    /// Play direction: -1, 0 (stopped) or +1
    pub display_inc: i32,
    pub display_fps: f32,
    pub in_frame: Frame,
    pub out_frame: Frame,
    pub min_frame: Frame,
    pub max_frame: Frame,
    /// Frame the caching threads last started on
    pub cache_frame: Frame,
    /// Frame where caching wrapped round the loop range
    pub cache_wrap_frame: Frame,
    pub free_mode: FreeMode,
    /// Share of the budget reserved behind the playhead (0.0-1.0)
    pub look_behind_fraction: f32,
    pub active_tail_caching: bool,
    /// Keep caching outside the in/out range once it is full
    pub cache_outside_region: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            display_frame: 0,
            display_inc: 0,
            display_fps: 24.0,
            in_frame: 0,
            out_frame: 0,
            min_frame: 0,
            max_frame: 0,
            cache_frame: 0,
            cache_wrap_frame: 0,
            free_mode: FreeMode::Conservative,
            look_behind_fraction: 0.25,
            active_tail_caching: false,
            cache_outside_region: false,
        }
    }
}

impl PlaybackState {
    pub fn in_extents(&self, frame: Frame) -> bool {
        frame >= self.min_frame && frame <= self.max_frame
    }

    pub fn in_loop(&self, frame: Frame) -> bool {
        frame >= self.in_frame && frame <= self.out_frame
    }

    /// True if `frame` lies behind the display frame relative to play direction.
    pub fn is_tail(&self, frame: Frame) -> bool {
        if self.display_inc < 0 {
            frame > self.display_frame
        } else {
            frame < self.display_frame
        }
    }

    /// Does the free mode allow evicting this frame?
    pub fn may_free(&self, frame: Frame) -> bool {
        if !self.in_loop(frame) {
            return true;
        }
        match self.free_mode {
            FreeMode::Conservative => false,
            FreeMode::Active => self.is_tail(frame),
            FreeMode::Greedy => true,
        }
    }

    /// Signed distance along the play direction (negative = tail).
    pub fn signed_distance(&self, frame: Frame) -> i64 {
        let d = frame as i64 - self.display_frame as i64;
        if self.display_inc < 0 { -d } else { d }
    }
}

/// Strategy computing frame utility. Injected into the cache at construction.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Utility in `[0, f32::MAX]`; 0 means never cache.
    fn utility(&self, state: &PlaybackState, frame: Frame, mode: UtilityMode) -> f32;
}

/// Utility outside the loop range: small but positive when caching outside
/// the region is enabled.
fn outside_region(state: &PlaybackState, frame: Frame) -> f32 {
    if !state.cache_outside_region {
        return 0.0;
    }
    let dist = if frame < state.in_frame {
        state.in_frame - frame
    } else {
        frame - state.out_frame
    };
    1.0 / (1.0 + dist as f32)
}

/// Buffer cache around the playhead (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct LookaheadPolicy;

impl EvictionPolicy for LookaheadPolicy {
    fn name(&self) -> &'static str {
        "lookahead"
    }

    fn utility(&self, state: &PlaybackState, frame: Frame, mode: UtilityMode) -> f32 {
        if !state.in_extents(frame) {
            return 0.0;
        }
        if frame == state.display_frame {
            return f32::MAX;
        }
        if !state.in_loop(frame) {
            return outside_region(state, frame);
        }

        let first = state.in_frame as f32;
        let last = state.out_frame as f32;

        // Without active tail caching the workers only chase the head.
        let fact = if mode == UtilityMode::ForCaching && !state.active_tail_caching {
            0.001
        } else {
            state.look_behind_fraction.clamp(0.001, 0.999)
        };

        // Display frame outside the loop: playback will restart at the in point.
        let test = if state.in_loop(state.display_frame) {
            state.display_frame
        } else {
            state.in_frame
        };
        let forward = frame > test;
        let ffact = if (state.display_inc < 0 && forward) || (state.display_inc > 0 && !forward) {
            1.0 - fact
        } else {
            fact
        };

        let f = frame as f32;
        let t = test as f32;
        let mut d = ffact * (f - t).abs();

        // Distances wrapping round the loop, +1 for the wrap step itself.
        let mut round_front = 1.0 + t - first + last - f;
        let mut round_back = 1.0 + last - t + f - first;
        if state.display_inc < 0 {
            round_front *= fact;
            round_back *= 1.0 - fact;
        } else {
            round_front *= 1.0 - fact;
            round_back *= fact;
        }

        d = d.min(round_front).min(round_back);
        if d <= 0.0 {
            return f32::MAX;
        }
        1.0 + 1.0 / d
    }
}

/// Greedy region cache: fill the in/out range from the in point onwards,
/// regardless of the playhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionPolicy;

impl EvictionPolicy for RegionPolicy {
    fn name(&self) -> &'static str {
        "region"
    }

    fn utility(&self, state: &PlaybackState, frame: Frame, _mode: UtilityMode) -> f32 {
        if !state.in_extents(frame) {
            return 0.0;
        }
        if !state.in_loop(frame) {
            return outside_region(state, frame);
        }
        if frame == state.in_frame {
            return f32::MAX;
        }
        1.0 + 1.0 / (frame - state.in_frame) as f32
    }
}

/// Policy selector for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CachingMode {
    #[default]
    Lookahead,
    Region,
}

impl CachingMode {
    pub fn policy(self) -> Box<dyn EvictionPolicy> {
        match self {
            CachingMode::Lookahead => Box::new(LookaheadPolicy),
            CachingMode::Region => Box::new(RegionPolicy),
        }
    }
}
