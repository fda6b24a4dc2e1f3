//! ada-fabric - Shared-Memory Tracing Fabric
//!
//! The core of an in-process execution tracer: a traced process (the
//! agent) streams call/return and register/stack records to an
//! out-of-process controller through three named shared-memory segments,
//! with no locks anywhere on the producer path.
//!
//! # Key pieces
//!
//! - A 4 KiB control segment holding the [`layout::ControlBlock`]:
//!   magic/version, coordination words, heartbeat, epoch, aggregates.
//! - A 64 KiB registry segment of 64 [`layout::ThreadLaneSet`] slots,
//!   claimed by producer threads on first touch.
//! - A 16 MiB rings segment: a pool of SPSC byte rings ferried between
//!   producers and the drain through per-lane submit/free handle queues.
//! - A marking policy plus persistence windows that decide which detail
//!   rings are worth keeping.
//! - A mode state machine that lets the agent come up before the
//!   controller, survive drain stalls, and recover.
//!
//! # Example
//!
//! ```no_run
//! use ada_fabric::{Fabric, FabricConfig, SessionId};
//!
//! let session = SessionId { host_pid: 4242, session_id: 1 };
//!
//! // Controller side:
//! let fabric = Fabric::create(session)?;
//!
//! // Agent side (usually another process):
//! let agent_view = Fabric::attach(session, &FabricConfig::default())?;
//! agent_view.control().agent_attached.store(1, std::sync::atomic::Ordering::Release);
//! # Ok::<(), ada_fabric::FabricError>(())
//! ```

mod backoff;
mod clock;
mod config;
mod error;
mod fallback;
mod invariants;
pub mod layout;
mod metrics;
mod mode;
mod policy;
mod pool;
mod queue;
pub mod record;
mod registry;
mod ring;
mod segment;
mod session;
mod window;

pub use backoff::Backoff;
pub use clock::monotonic_ns;
pub use config::{FabricConfig, PATIENT_ATTACH_CONFIG, QUICK_ATTACH_CONFIG};
pub use error::{FabricError, Result};
pub use fallback::FallbackRing;
pub use layout::LaneKind;
pub use metrics::{LaneCounters, MetricsSnapshot, ThreadCounters};
pub use mode::{AgentMode, ModeEvent, ModeMachine, ModeParams};
pub use policy::{MarkingPolicy, MatchKind, PatternSpec, PatternTarget, Probe};
pub use pool::RingPool;
pub use registry::Registry;
pub use ring::{DrainCount, PushError, RingRef};
pub use segment::{cleanup_stale_sessions, ShmSegment};
pub use session::{Fabric, Role, SegmentKind, SessionId};
pub use window::{PersistenceWindow, WindowConfig, WindowSnapshot};
