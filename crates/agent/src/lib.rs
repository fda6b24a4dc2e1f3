//! ada-agent - in-process side of the ada tracing fabric.
//!
//! Loaded into the traced process by the injector, which then calls
//! [`agent_init`] with the session identity it negotiated with the
//! controller. From there, every traced thread self-registers on its
//! first hook hit and streams records through its per-thread lanes; the
//! mode state machine keeps events flowing through the global fallback
//! ring while the controller is not (or no longer) keeping up.
//!
//! # Example
//!
//! ```no_run
//! use ada_agent::{agent_init, hooks, AgentConfig};
//! use ada_fabric::{PatternSpec, Probe};
//!
//! let mut config = AgentConfig::default();
//! config.patterns = vec![PatternSpec::symbol_literal("open")];
//!
//! let agent = agent_init(4242, 1, config)?;
//!
//! // From a hook trampoline:
//! hooks::on_enter(
//!     agent,
//!     0x1000,
//!     &hooks::RegSnapshot::default(),
//!     &[],
//!     &Probe { symbol: "open", module: "libc.so", message: "" },
//! );
//! hooks::on_leave(agent, 0x1000, 0);
//! # Ok::<(), ada_fabric::FabricError>(())
//! ```

mod agent;
mod emit;
pub mod hooks;
mod startup;
mod tls;

pub use agent::{Agent, AgentConfig, MODE_TICK_EVENT_INTERVAL};
pub use startup::StartupBudget;

use ada_fabric::{FabricError, SessionId};
use std::sync::OnceLock;

static GLOBAL_AGENT: OnceLock<Agent> = OnceLock::new();

/// Agent entry point, called once by the injector with the identifiers
/// from its payload. Attaches to the session fabric and emits the ready
/// signal.
///
/// A second call fails with [`FabricError::AlreadyInitialized`].
pub fn agent_init(
    host_pid: u32,
    session_id: u32,
    config: AgentConfig,
) -> Result<&'static Agent, FabricError> {
    if GLOBAL_AGENT.get().is_some() {
        return Err(FabricError::AlreadyInitialized);
    }
    let agent = Agent::attach(SessionId { host_pid, session_id }, config)?;
    let agent = GLOBAL_AGENT.get_or_init(|| agent);
    agent.publish_ready();
    Ok(agent)
}

/// The installed agent, if [`agent_init`] has run.
pub fn global_agent() -> Option<&'static Agent> {
    GLOBAL_AGENT.get()
}
