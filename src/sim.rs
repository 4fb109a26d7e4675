//! Synthetic playback: a layered frame source and a display loop.
//!
//! `SyntheticSource` stands in for the evaluation graph. Each layer is one
//! producer; a layer with `hold > 1` repeats the same item over blocks of
//! frames (held plates, still backgrounds), so items get shared between
//! frames the way real composites share unchanged inputs.

use log::{debug, info};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::cache::FrameCache;
use crate::core::stats::CacheStats;
use crate::core::store::ContentStore;
use crate::core::types::{Frame, IdTree, Item, ItemId, ProducerId};
use crate::core::workers::{CacheWorkers, FrameProducer};

#[derive(Debug, Clone)]
pub struct Layer {
    pub producer: ProducerId,
    pub name: String,
    /// Frames sharing one item
    pub hold: i32,
    pub bytes: usize,
}

impl Layer {
    pub fn new(name: impl Into<String>, hold: i32, bytes: usize) -> Self {
        Self {
            producer: Uuid::new_v4(),
            name: name.into(),
            hold: hold.max(1),
            bytes,
        }
    }

    pub fn item_id(&self, frame: Frame) -> ItemId {
        ItemId::new(format!("{}.{}", self.name, frame.div_euclid(self.hold)))
    }

    pub fn item(&self, frame: Frame) -> Item {
        Item {
            id: self.item_id(frame),
            bytes: self.bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    layers: Vec<Layer>,
    /// Simulated render cost per frame
    render_time: Duration,
}

impl SyntheticSource {
    pub fn new(layers: Vec<Layer>, render_time: Duration) -> Self {
        Self { layers, render_time }
    }

    /// Background held for 24 frames, a plate and a per-frame overlay.
    pub fn layered(layer_bytes: usize, render_time: Duration) -> Self {
        Self::new(
            vec![
                Layer::new("bg", 24, layer_bytes),
                Layer::new("plate", 1, layer_bytes),
                Layer::new("overlay", 1, layer_bytes / 4),
            ],
            render_time,
        )
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Bytes of one frame's items.
    pub fn frame_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.bytes).sum()
    }

    fn render<S: ContentStore>(&self, frame: Frame, cache: &FrameCache<S>, force: bool) -> bool {
        if !self.render_time.is_zero() {
            thread::sleep(self.render_time);
        }
        for layer in &self.layers {
            let item = layer.item(frame);
            let ok = if force {
                cache.lock().force_add_from(&item, frame, layer.producer)
            } else {
                cache.add_from(&item, frame, layer.producer)
            };
            if !ok {
                debug!("render of frame {} stopped at layer {}", frame, layer.name);
                return false;
            }
        }
        true
    }

    /// Display thread path: render the current frame whatever the budget.
    pub fn render_display<S: ContentStore>(&self, frame: Frame, cache: &FrameCache<S>) -> bool {
        self.render(frame, cache, true)
    }

    /// Producer teardown.
    pub fn shutdown<S: ContentStore>(&self, cache: &FrameCache<S>) {
        for layer in &self.layers {
            cache.flush_per_node_cache(layer.producer);
        }
    }
}

impl<S: ContentStore> FrameProducer<S> for SyntheticSource {
    fn id_tree(&self, frame: Frame) -> IdTree {
        IdTree(self.layers.iter().map(|l| vec![l.item_id(frame)]).collect())
    }

    fn produce(&self, frame: Frame, cache: &FrameCache<S>) -> bool {
        self.render(frame, cache, false)
    }
}

/// Looping playhead over an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playhead {
    pub frame: Frame,
    pub inc: i32,
    pub in_frame: Frame,
    pub out_frame: Frame,
}

impl Playhead {
    pub fn new(frame: Frame, inc: i32, in_frame: Frame, out_frame: Frame) -> Self {
        Self {
            frame: frame.clamp(in_frame, out_frame),
            inc: inc.signum(),
            in_frame,
            out_frame,
        }
    }

    /// Step one frame, wrapping at the loop ends.
    pub fn advance(&mut self) -> Frame {
        let next = self.frame + self.inc;
        self.frame = if next > self.out_frame {
            self.in_frame
        } else if next < self.in_frame {
            self.out_frame
        } else {
            next
        };
        self.frame
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub shown: u64,
    /// Frames found complete in the cache
    pub hits: u64,
    /// Frames the display thread had to render itself
    pub misses: u64,
    pub produced_by_workers: u64,
}

impl PlaybackReport {
    pub fn hit_rate(&self) -> f32 {
        if self.shown == 0 {
            return 0.0;
        }
        self.hits as f32 / self.shown as f32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackOptions {
    pub fps: f32,
    pub duration: Duration,
    pub workers: usize,
    pub group_size: usize,
    /// Stats print interval; None = silent
    pub report_every: Option<Duration>,
}

/// Play `playhead` for `opts.duration` with caching workers in the
/// background. The display thread shows each frame from the cache or
/// renders it on a miss.
pub fn play<S>(
    cache: &Arc<FrameCache<S>>,
    source: &Arc<SyntheticSource>,
    mut playhead: Playhead,
    opts: PlaybackOptions,
    mut on_stats: impl FnMut(&CacheStats),
) -> PlaybackReport
where
    S: ContentStore + 'static,
{
    let display: &FrameCache<S> = cache;
    let mut report = PlaybackReport::default();
    let frame_time = Duration::from_secs_f32(1.0 / opts.fps.max(0.001));

    cache.set_in_out_frames(playhead.in_frame, playhead.out_frame, playhead.in_frame, playhead.out_frame);
    cache.set_display_fps(opts.fps);
    cache.set_display_inc(playhead.inc);
    cache.set_display_frame(playhead.frame);
    source.render_display(playhead.frame, display);

    let workers = CacheWorkers::new(opts.workers, opts.group_size, Arc::clone(cache), Arc::clone(source));
    info!("Playback: {} workers, {:.1} fps, {:?}", workers.len(), opts.fps, opts.duration);

    let start = Instant::now();
    let mut next_report = opts.report_every.map(|every| start + every);
    let mut stats = CacheStats::default();

    while start.elapsed() < opts.duration {
        let tick = Instant::now();
        let frame = playhead.advance();
        cache.set_display_frame(frame);
        cache.set_cache_frame(frame);

        let (complete, _) = cache.frame_items(frame);
        if complete {
            report.hits += 1;
        } else {
            report.misses += 1;
            source.render_display(frame, display);
        }
        report.shown += 1;
        workers.wake();

        if let Some(at) = next_report {
            if Instant::now() >= at && cache.cache_stats(&mut stats) {
                on_stats(&stats);
                next_report = opts.report_every.map(|every| at + every);
            }
        }

        if let Some(rest) = frame_time.checked_sub(tick.elapsed()) {
            thread::sleep(rest);
        }
    }

    report.produced_by_workers = workers.produced();
    drop(workers);
    cache.update_stats_if_dirty();
    report
}
