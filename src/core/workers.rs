//! Background caching threads.
//!
//! Each worker runs the steady-state cycle against a shared `FrameCache`:
//! book a group of frames, let the producer render them, complete them.
//! When there is nothing worth caching the worker parks on the wake channel
//! for a millisecond at a time, so playback changes are picked up quickly.
//!
//! Epoch mechanism: playback setters bump the cache epoch. Frames booked
//! under an older epoch are released without producing them, which keeps
//! workers from rendering stale targets during fast scrubbing.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::cache::FrameCache;
use super::store::ContentStore;
use super::types::{Frame, IdTree, TreeResult};

/// Upstream evaluation graph, as seen by the caching threads.
pub trait FrameProducer<S: ContentStore>: Send + Sync {
    /// Item ids the frame is composed of.
    fn id_tree(&self, frame: Frame) -> IdTree;

    /// Render/decode `frame` and `add` its items to the cache.
    /// False means try again later.
    fn produce(&self, frame: Frame, cache: &FrameCache<S>) -> bool;
}

impl<S: ContentStore, T: FrameProducer<S> + ?Sized> FrameProducer<S> for Arc<T> {
    fn id_tree(&self, frame: Frame) -> IdTree {
        (**self).id_tree(frame)
    }

    fn produce(&self, frame: Frame, cache: &FrameCache<S>) -> bool {
        (**self).produce(frame, cache)
    }
}

/// Pool of caching threads.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(FrameCache::new(MemoryStore::new(budget)));
/// let workers = CacheWorkers::new(4, 4, Arc::clone(&cache), Arc::new(source));
/// cache.set_display_frame(10);
/// workers.wake();
/// ```
pub struct CacheWorkers {
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    /// Frames produced or promoted since start
    produced: Arc<AtomicU64>,
}

struct WorkerCtx<S: ContentStore, P> {
    cache: Arc<FrameCache<S>>,
    producer: Arc<P>,
    shutdown: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
    produced: Arc<AtomicU64>,
    group_size: usize,
}

impl<S, P> WorkerCtx<S, P>
where
    S: ContentStore,
    P: FrameProducer<S>,
{
    fn run(&self, worker_id: usize) {
        trace!("Cache worker {} started", worker_id);

        while !self.shutdown.load(Ordering::Relaxed) {
            let epoch = self.cache.epoch();
            let bookings = self.cache.initiate_caching_of_best_frame_group(self.group_size);

            if bookings.is_empty() {
                self.cache.update_stats_if_dirty();
                // Idle: wait for a wake-up or poll again shortly
                match self.wake_rx.recv_timeout(Duration::from_millis(1)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            for booking in bookings {
                // Booked frames are always completed, even when skipped
                if self.cache.epoch() == epoch && !self.shutdown.load(Ordering::Relaxed) {
                    self.cache_frame(booking.frame);
                } else {
                    trace!("Worker {}: frame {} stale (epoch {}), skipped", worker_id, booking.frame, epoch);
                }
                if !self.cache.complete_caching_of_frame(booking) {
                    debug!("Worker {}: frame {} was re-booked after timing out", worker_id, booking.frame);
                }
            }
            self.cache.update_stats_if_dirty();
        }

        trace!("Cache worker {} stopped", worker_id);
    }

    fn cache_frame(&self, frame: Frame) {
        // Content may already be resident under other frames
        let tree = self.producer.id_tree(frame);
        {
            let mut state = self.cache.lock();
            if state.test_in_cache(&tree) == TreeResult::HasAllIds && state.promote_frame(frame, &tree) {
                self.produced.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let failures = self.cache.lock().alloc_failures();
        if self.producer.produce(frame, &self.cache) {
            self.produced.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut state = self.cache.lock();
        if state.alloc_failures() > failures {
            state.emergency_free();
        }
    }
}

impl CacheWorkers {
    /// Spawn `num_threads` caching workers.
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` (leave 25% for the display thread).
    ///
    /// # Arguments
    ///
    /// * `num_threads` - Number of worker threads
    /// * `group_size` - Max contiguous frames booked per cycle
    /// * `cache` - Shared cache handle
    /// * `producer` - Renders frames into the cache
    pub fn new<S, P>(num_threads: usize, group_size: usize, cache: Arc<FrameCache<S>>, producer: Arc<P>) -> Self
    where
        S: ContentStore + 'static,
        P: FrameProducer<S> + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let produced = Arc::new(AtomicU64::new(0));
        let (wake_tx, wake_rx) = unbounded();
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let ctx = WorkerCtx {
                cache: Arc::clone(&cache),
                producer: Arc::clone(&producer),
                shutdown: Arc::clone(&shutdown),
                wake_rx: wake_rx.clone(),
                produced: Arc::clone(&produced),
                group_size: group_size.max(1),
            };

            let spawned = thread::Builder::new()
                .name(format!("playa-cache-{}", worker_id))
                .spawn(move || ctx.run(worker_id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn cache worker {}: {}", worker_id, e),
            }
        }

        trace!("Cache workers initialized: {} threads", handles.len());

        Self {
            handles,
            shutdown,
            wake_tx,
            produced,
        }
    }

    /// Wake idle workers (after a playback change).
    pub fn wake(&self) {
        for _ in &self.handles {
            let _ = self.wake_tx.send(());
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

impl Drop for CacheWorkers {
    fn drop(&mut self) {
        use std::time::Instant;

        let num_threads = self.handles.len();
        trace!("Cache workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();

        // Wait with timeout (500ms total for all threads)
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} cache workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::core::types::{Item, ItemId};
    use crate::core::utility::FreeMode;
    use std::time::Instant;

    struct Counter;

    impl FrameProducer<MemoryStore> for Counter {
        fn id_tree(&self, frame: Frame) -> IdTree {
            IdTree::single([ItemId::new(format!("f{}", frame))])
        }

        fn produce(&self, frame: Frame, cache: &FrameCache<MemoryStore>) -> bool {
            cache.add(&Item::new(format!("f{}", frame), 100), frame, false)
        }
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_workers_fill_head() {
        let cache = Arc::new(FrameCache::new(MemoryStore::new(20 * 100)));
        cache.set_in_out_frames(0, 100, 0, 100);
        cache.set_free_mode(FreeMode::Greedy);
        cache.set_display_inc(1);
        cache.set_display_frame(0);
        cache.add(&Item::new("f0", 100), 0, false);

        let workers = CacheWorkers::new(4, 1, Arc::clone(&cache), Arc::new(Counter));
        assert_eq!(workers.len(), 4);

        let filled = wait_for(Duration::from_secs(5), || {
            let state = cache.lock();
            state.cached_ranges() == vec![(0, 19)] && state.in_flight.is_empty()
        });
        drop(workers);

        assert!(filled, "{}", cache.show_cache_contents());
        assert!(cache.check_metadata().is_consistent());
        assert!(cache.lock().store().used() <= 20 * 100);
    }

    #[test]
    fn test_playhead_move_recaches() {
        let cache = Arc::new(FrameCache::new(MemoryStore::new(10 * 100)));
        cache.set_in_out_frames(0, 1000, 0, 1000);
        cache.set_free_mode(FreeMode::Greedy);
        cache.set_display_inc(1);
        cache.set_display_frame(0);
        cache.add(&Item::new("f0", 100), 0, false);

        let workers = CacheWorkers::new(2, 2, Arc::clone(&cache), Arc::new(Counter));
        assert!(wait_for(Duration::from_secs(5), || cache.lock().cached_ranges() == vec![(0, 9)]));

        // Jump ahead: display thread renders the new frame, workers follow
        cache.set_display_frame(500);
        cache.add(&Item::new("f500", 100), 500, true);
        workers.wake();
        let moved = wait_for(Duration::from_secs(5), || {
            cache.lock().cached_ranges() == vec![(500, 509)]
        });
        assert!(workers.produced() >= 18);
        drop(workers);

        assert!(moved, "{}", cache.show_cache_contents());
    }
}
