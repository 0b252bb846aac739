//! Run-wide statistics.
//!
//! A single [`Stats`] handle is created by the engine and passed explicitly
//! to every stage; there are no module-global counters. Counters are lock-free
//! atomics safe to bump from any worker; stage timings are recorded by RAII
//! guards so elapsed time lands in the ledger on every exit path, including
//! early returns and panics unwinding through a worker.

mod layer_stats;
mod progress;

pub use layer_stats::{FieldType, LayerMeta, LayerStats};
pub use progress::ProgressLogger;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Shared, thread-safe counters for one run.
#[derive(Debug, Default)]
pub struct Stats {
    pub nodes_indexed: AtomicU64,
    pub relations_indexed: AtomicU64,
    pub features_read: AtomicU64,
    pub features_rendered: AtomicU64,
    pub tiles_written: AtomicU64,
    pub tile_bytes_written: AtomicU64,
    pub missing_node_refs: AtomicU64,
    pub geometry_invalid: AtomicU64,
    pub profile_rejected: AtomicU64,
    pub blocks_skipped: AtomicU64,
    timings: Mutex<Vec<(&'static str, Duration)>>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a named timing span; elapsed time is recorded when the guard
    /// drops, on every exit path.
    pub fn time(self: &Arc<Self>, stage: &'static str) -> TimerGuard {
        TimerGuard {
            stats: Arc::clone(self),
            stage,
            started: Instant::now(),
        }
    }

    pub fn record_timing(&self, stage: &'static str, elapsed: Duration) {
        self.timings.lock().push((stage, elapsed));
    }

    /// Recorded `(stage, elapsed)` pairs in completion order.
    pub fn timings(&self) -> Vec<(&'static str, Duration)> {
        self.timings.lock().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nodes_indexed: self.nodes_indexed.load(Ordering::Relaxed),
            relations_indexed: self.relations_indexed.load(Ordering::Relaxed),
            features_read: self.features_read.load(Ordering::Relaxed),
            features_rendered: self.features_rendered.load(Ordering::Relaxed),
            tiles_written: self.tiles_written.load(Ordering::Relaxed),
            tile_bytes_written: self.tile_bytes_written.load(Ordering::Relaxed),
            missing_node_refs: self.missing_node_refs.load(Ordering::Relaxed),
            geometry_invalid: self.geometry_invalid.load(Ordering::Relaxed),
            profile_rejected: self.profile_rejected.load(Ordering::Relaxed),
            blocks_skipped: self.blocks_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub nodes_indexed: u64,
    pub relations_indexed: u64,
    pub features_read: u64,
    pub features_rendered: u64,
    pub tiles_written: u64,
    pub tile_bytes_written: u64,
    pub missing_node_refs: u64,
    pub geometry_invalid: u64,
    pub profile_rejected: u64,
    pub blocks_skipped: u64,
}

/// Scoped timing; see [`Stats::time`].
pub struct TimerGuard {
    stats: Arc<Stats>,
    stage: &'static str,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.stats
            .record_timing(self.stage, self.started.elapsed());
    }
}

/// Counts an error kind and logs the first few occurrences plus every
/// ten-thousandth after, so a flood of bad features cannot drown the log.
pub fn count_and_warn(counter: &AtomicU64, message: impl Fn() -> String) {
    let seen = counter.fetch_add(1, Ordering::Relaxed);
    if seen < 5 || seen % 10_000 == 0 {
        tracing::warn!("{}", message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_across_threads() {
        let stats = Stats::new();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let stats = Arc::clone(&stats);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        stats.features_read.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(stats.snapshot().features_read, 4000);
    }

    #[test]
    fn test_timer_guard_records_on_drop() {
        let stats = Stats::new();
        {
            let _guard = stats.time("sort");
        }
        let timings = stats.timings();
        assert_eq!(timings.len(), 1);
        assert_eq!(timings[0].0, "sort");
    }

    #[test]
    fn test_timer_guard_records_on_early_exit() {
        let stats = Stats::new();
        let run = |fail: bool| -> Result<(), ()> {
            let _guard = stats.time("stage");
            if fail {
                return Err(());
            }
            Ok(())
        };
        let _ = run(true);
        assert_eq!(stats.timings().len(), 1);
    }

    #[test]
    fn test_count_and_warn_always_counts() {
        let counter = AtomicU64::new(0);
        for _ in 0..100 {
            count_and_warn(&counter, || "bad".to_string());
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }
}
