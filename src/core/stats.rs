//! Lazily recomputed cache statistics.
//!
//! Writers bump a shared generation counter (same idea as the epoch used to
//! cancel stale loads). Readers compare the generation their snapshot was
//! built from against the current one and only recompute when behind.
//!
//! The snapshot has its own mutex, independent of the cache lock, so UI
//! polling never stalls caching. Lock order is stats -> cache, and the query
//! path only ever try-locks the cache.

use log::trace;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use super::types::FrameRange;

/// Derived, never authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub used: usize,
    pub look_ahead_seconds: f32,
    pub cached_ranges: Vec<FrameRange>,
}

#[derive(Debug, Default)]
struct Snapshot {
    stats: CacheStats,
    /// Generation the stats were computed at; None = never computed
    observed: Option<u64>,
}

#[derive(Debug)]
pub struct StatsAggregator {
    generation: Arc<AtomicU64>,
    snapshot: Mutex<Snapshot>,
    disabled: AtomicBool,
}

impl StatsAggregator {
    pub fn new(generation: Arc<AtomicU64>) -> Self {
        Self {
            generation,
            snapshot: Mutex::new(Snapshot::default()),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Non-blocking query.
    ///
    /// Returns false (leaving `out` untouched) if another thread holds the
    /// snapshot. When the snapshot is stale, `recompute` is tried; it returns
    /// None when the cache is busy, in which case the old snapshot is served.
    pub fn query<F>(&self, out: &mut CacheStats, recompute: F) -> bool
    where
        F: FnOnce() -> Option<CacheStats>,
    {
        let mut snap = match self.snapshot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };

        if !self.is_disabled() {
            let current = self.generation();
            if snap.observed != Some(current) {
                if let Some(stats) = recompute() {
                    snap.stats = stats;
                    snap.observed = Some(current);
                } else {
                    trace!("stats: cache busy, serving generation {:?}", snap.observed);
                }
            }
        }

        out.clone_from(&snap.stats);
        true
    }

    /// Refresh the snapshot if stale. Returns true if a recompute happened.
    ///
    /// `recompute` may block on the cache lock, so it runs before the
    /// snapshot is locked; queries keep being served meanwhile.
    pub fn refresh_if_dirty<F>(&self, recompute: F) -> bool
    where
        F: FnOnce() -> CacheStats,
    {
        if self.is_disabled() {
            return false;
        }
        let current = self.generation();
        let stale = |snap: &Snapshot| snap.observed.is_none_or(|seen| seen < current);
        if !stale(&self.snapshot.lock().unwrap_or_else(|e| e.into_inner())) {
            return false;
        }

        let stats = recompute();

        let mut snap = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        if stale(&snap) {
            snap.stats = stats;
            snap.observed = Some(current);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(used: usize) -> CacheStats {
        CacheStats {
            capacity: 100,
            used,
            ..Default::default()
        }
    }

    #[test]
    fn test_recompute_only_when_behind() {
        let generation = Arc::new(AtomicU64::new(0));
        let agg = StatsAggregator::new(Arc::clone(&generation));
        let mut out = CacheStats::default();

        let mut calls = 0;
        assert!(agg.query(&mut out, || {
            calls += 1;
            Some(stats(10))
        }));
        assert_eq!(out.used, 10);

        assert!(agg.query(&mut out, || {
            calls += 1;
            Some(stats(20))
        }));
        assert_eq!(calls, 1);
        assert_eq!(out.used, 10);

        generation.fetch_add(1, Ordering::AcqRel);
        assert!(agg.refresh_if_dirty(|| stats(30)));
        assert!(!agg.refresh_if_dirty(|| stats(40)));
        assert!(agg.query(&mut out, || Some(stats(50))));
        assert_eq!(out.used, 30);
    }

    #[test]
    fn test_busy_cache_serves_last_snapshot() {
        let generation = Arc::new(AtomicU64::new(0));
        let agg = StatsAggregator::new(Arc::clone(&generation));
        let mut out = CacheStats::default();
        agg.query(&mut out, || Some(stats(5)));

        generation.fetch_add(1, Ordering::AcqRel);
        assert!(agg.query(&mut out, || None));
        assert_eq!(out.used, 5);
    }

    #[test]
    fn test_busy_stats_lock_leaves_out_untouched() {
        let agg = Arc::new(StatsAggregator::new(Arc::new(AtomicU64::new(0))));
        let held = agg.snapshot.lock().unwrap();

        let agg2 = Arc::clone(&agg);
        let handle = std::thread::spawn(move || {
            let mut out = stats(99);
            let ok = agg2.query(&mut out, || Some(stats(1)));
            (ok, out)
        });
        let (ok, out) = handle.join().unwrap();
        drop(held);

        assert!(!ok);
        assert_eq!(out.used, 99);
    }

    #[test]
    fn test_slow_refresh_does_not_block_queries() {
        let generation = Arc::new(AtomicU64::new(0));
        let agg = Arc::new(StatsAggregator::new(Arc::clone(&generation)));
        let mut out = CacheStats::default();
        agg.query(&mut out, || Some(stats(5)));
        generation.fetch_add(1, Ordering::AcqRel);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let agg2 = Arc::clone(&agg);
        let handle = std::thread::spawn(move || {
            agg2.refresh_if_dirty(|| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                stats(7)
            })
        });

        // Refresh is stuck computing; queries still get the last snapshot
        started_rx.recv().unwrap();
        for _ in 0..10 {
            assert!(agg.query(&mut out, || None));
            assert_eq!(out.used, 5);
        }
        release_tx.send(()).unwrap();
        assert!(handle.join().unwrap());

        assert!(agg.query(&mut out, || Some(stats(9))));
        assert_eq!(out.used, 7);
    }
}
