//! Controller session lifecycle.
//!
//! The controller owns segment creation and destruction. `create` builds
//! the fabric, `start` spawns the drain (and publishes `registry_ready`),
//! and `stop` requests shutdown, joins the drain after its final pass, and
//! unlinks the segments.

use crate::drain::{DrainConfig, DrainEngine, DrainStats};
use crate::reporter::{snapshot, Reporter};
use crate::writer::{TraceWriter, WriterError};
use ada_fabric::{Fabric, FabricError, MetricsSnapshot, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Controller-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error("trace writer failed: {0}")]
    Writer(#[from] WriterError),
    #[error("drain thread panicked")]
    DrainPanicked,
    #[error("session already started")]
    AlreadyStarted,
}

/// Session-wide configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerConfig {
    pub drain: DrainConfig,
    /// Reporter cadence; `None` disables the reporter thread.
    pub reporter_interval: Option<Duration>,
}

/// One tracing session, controller side.
pub struct ControllerSession {
    fabric: Arc<Fabric>,
    config: ControllerConfig,
    drain: Option<JoinHandle<Result<(), WriterError>>>,
    drain_stats: Option<Arc<DrainStats>>,
    drain_pause: Option<Arc<AtomicBool>>,
    reporter: Option<Reporter>,
}

impl ControllerSession {
    /// Create the session segments. Fails with `SegmentExists` when a
    /// previous session was not cleaned up.
    pub fn create(session: SessionId, config: ControllerConfig) -> Result<Self, ControllerError> {
        let fabric = Arc::new(Fabric::create(session)?);
        Ok(Self {
            fabric,
            config,
            drain: None,
            drain_stats: None,
            drain_pause: None,
            reporter: None,
        })
    }

    /// Spawn the drain thread over `writer` and publish `registry_ready`.
    pub fn start<W: TraceWriter + 'static>(&mut self, writer: W) -> Result<(), ControllerError> {
        if self.drain.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        let mut engine = DrainEngine::new(Arc::clone(&self.fabric), writer, self.config.drain);
        self.drain_stats = Some(engine.stats());
        self.drain_pause = Some(engine.pause_switch());

        let handle = std::thread::Builder::new()
            .name("ada-drain".into())
            .spawn(move || engine.run())
            .expect("spawn drain thread");
        self.drain = Some(handle);

        if let Some(interval) = self.config.reporter_interval {
            self.reporter = Some(Reporter::spawn(Arc::clone(&self.fabric), interval));
        }

        // Agents may now leave global_only.
        self.fabric.control().registry_ready.store(1, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.fabric.session()
    }

    /// Drain counters (present once started).
    pub fn drain_stats(&self) -> Option<&Arc<DrainStats>> {
        self.drain_stats.as_ref()
    }

    /// Pause switch for the drain loop: while set, no cycles run and the
    /// heartbeat freezes. Used to exercise agent degradation.
    pub fn drain_pause(&self) -> Option<&Arc<AtomicBool>> {
        self.drain_pause.as_ref()
    }

    /// Invalidate every agent slot cache and force re-registration. The
    /// retired slots are drained and reclaimed by the drain thread.
    pub fn bump_epoch(&self) {
        let control = self.fabric.control();
        control.registry_version.fetch_add(1, Ordering::Relaxed);
        let epoch = control.registry_epoch.fetch_add(1, Ordering::Release) + 1;
        log::info!("registry epoch bumped to {epoch}");
    }

    /// Ask producers and the drain to wind down.
    pub fn request_shutdown(&self) {
        self.fabric.control().shutdown_requested.store(1, Ordering::Release);
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        snapshot(&self.fabric)
    }

    /// Stop everything: request shutdown, join the drain after its final
    /// pass, stop the reporter, snapshot, and unlink the segments.
    pub fn stop(mut self) -> Result<MetricsSnapshot, ControllerError> {
        self.request_shutdown();

        let result = match self.drain.take() {
            Some(handle) => handle.join().map_err(|_| ControllerError::DrainPanicked)?,
            None => Ok(()),
        };
        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }

        let snap = snapshot(&self.fabric);
        result?;
        Ok(snap)
        // Dropping the last Arc<Fabric> unmaps and unlinks the segments.
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        // A session abandoned without `stop` still winds its drain down;
        // otherwise the thread would hold the fabric mapping forever.
        self.request_shutdown();
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }
}
