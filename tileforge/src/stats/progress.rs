//! Periodic progress logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use super::Stats;
use crate::error::{PipelineError, Result};

/// Background thread that logs a progress line every interval until stopped.
///
/// The line reflects whatever stage is active; counters that have not moved
/// yet simply read zero. Dropping the logger stops the thread.
pub struct ProgressLogger {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressLogger {
    pub fn start(stats: Arc<Stats>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                // Sleep in short slices so shutdown is prompt even with long
                // log intervals.
                let slice = Duration::from_millis(200).min(interval);
                let mut elapsed = Duration::ZERO;
                loop {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    std::thread::sleep(slice);
                    elapsed += slice;
                    if elapsed >= interval {
                        elapsed = Duration::ZERO;
                        let s = stats.snapshot();
                        info!(
                            nodes = s.nodes_indexed,
                            features = s.features_rendered,
                            tiles = s.tiles_written,
                            missing_node_refs = s.missing_node_refs,
                            invalid_geoms = s.geometry_invalid,
                            "progress"
                        );
                    }
                }
            })
            .map_err(|e| PipelineError::Internal(format!("spawn progress thread: {}", e)))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_joins_promptly() {
        let stats = Stats::new();
        let logger = ProgressLogger::start(stats, Duration::from_secs(3600)).unwrap();
        let started = std::time::Instant::now();
        logger.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_drop_also_stops() {
        let stats = Stats::new();
        let logger = ProgressLogger::start(stats, Duration::from_secs(3600)).unwrap();
        drop(logger);
    }
}
