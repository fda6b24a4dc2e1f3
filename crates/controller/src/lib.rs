//! ada-controller - out-of-process side of the ada tracing fabric.
//!
//! Owns the session segments, runs the drain engine that consumes every
//! lane fairly, hands finalized rings to a [`TraceWriter`], and reports
//! metrics. The traced process attaches with `ada-agent`.
//!
//! # Example
//!
//! ```no_run
//! use ada_controller::{ControllerConfig, ControllerSession, FileWriter};
//! use ada_fabric::SessionId;
//!
//! let session = SessionId { host_pid: 4242, session_id: 1 };
//! let mut controller = ControllerSession::create(session, ControllerConfig::default())?;
//! controller.start(FileWriter::create("/tmp/trace-4242")?)?;
//!
//! // ... injector loads the agent, target runs ...
//!
//! let metrics = controller.stop()?;
//! println!("captured {} events", metrics.events_captured);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod drain;
mod reporter;
mod session;
mod writer;

pub use drain::{DrainConfig, DrainEngine, DrainStats, IdleStrategy};
pub use reporter::Reporter;
pub use session::{ControllerConfig, ControllerError, ControllerSession};
pub use writer::{
    FileWriter, JsonManifestWriter, NullWriter, RingMeta, RingSource, TraceWriter, WriterError,
};
