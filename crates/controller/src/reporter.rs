//! Periodic metrics reporter.
//!
//! A single consumer snapshots the lock-free counters and logs a summary
//! line per interval. This is the session's standard metrics channel;
//! fatal errors are logged separately by the drain, exactly once.

use ada_fabric::{Fabric, MetricsSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Reporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Spawn the reporter thread.
    pub fn spawn(fabric: Arc<Fabric>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("ada-reporter".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    let snap = snapshot(&fabric);
                    log::info!(
                        "session {:?}: captured={} dropped={} rings={} cycles={} \
                         fallback={} threads={} mode={}",
                        fabric.session(),
                        snap.events_captured,
                        snap.events_dropped_total(),
                        snap.rings_drained,
                        snap.drain_cycles,
                        snap.fallback_records,
                        snap.threads.len(),
                        snap.mode,
                    );
                }
            })
            .expect("spawn reporter thread");

        Self { stop, handle: Some(handle) }
    }

    /// Stop and join.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Snapshot helper shared by the reporter and the session API.
pub(crate) fn snapshot(fabric: &Fabric) -> MetricsSnapshot {
    MetricsSnapshot::collect(fabric.control(), &fabric.registry(), &fabric.pool())
}
