//! The agent: attach, coordination ticking, and lifecycle.

use crate::startup::StartupBudget;
use ada_fabric::{
    monotonic_ns, AgentMode, Fabric, FabricConfig, FabricError, MarkingPolicy, ModeEvent,
    ModeMachine, ModeParams, PatternSpec, SessionId, WindowConfig,
};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Emits between coordination ticks. Power of two; the tick itself reads
/// four control words, so per-record evaluation would dominate the fast
/// path.
pub const MODE_TICK_EVENT_INTERVAL: u64 = 1024;

/// Everything the injector decides for a session.
pub struct AgentConfig {
    pub fabric: FabricConfig,
    pub window: WindowConfig,
    pub mode: ModeParams,
    /// Marking patterns; empty means the detail lane never persists.
    pub patterns: Vec<PatternSpec>,
    /// Hooked-symbol count, used only to size the attach budget.
    pub symbol_count_hint: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            fabric: FabricConfig::default(),
            window: WindowConfig::default(),
            mode: ModeParams::default(),
            patterns: Vec::new(),
            symbol_count_hint: 0,
        }
    }
}

/// Process-local hot state shared by all producer threads.
pub(crate) struct Shared {
    /// Current mode word, read on every emit.
    pub(crate) mode: CachePadded<AtomicU32>,
    /// Last applied registry epoch; TLS caches compare against this.
    pub(crate) epoch: CachePadded<AtomicU64>,
    /// Set once `shutdown_requested` is observed; emits become no-ops.
    pub(crate) halted: AtomicBool,
    pub(crate) events_since_tick: CachePadded<AtomicU64>,
    /// The mode machine proper. Contended ticks are skipped, never waited
    /// on: `try_lock` only.
    machine: Mutex<ModeMachine>,
}

/// In-process side of a tracing session.
///
/// One `Agent` serves every thread of the traced process; the emit paths
/// are lock-free and the coordination tick is amortized and skip-on-
/// contention, so no producer ever blocks on another.
pub struct Agent {
    pub(crate) fabric: Fabric,
    pub(crate) policy: MarkingPolicy,
    pub(crate) window: WindowConfig,
    pub(crate) prefetch: usize,
    pub(crate) shared: Shared,
}

impl Agent {
    /// Attach to an existing session.
    ///
    /// The attach deadline is the configured timeout stretched by the
    /// `ADA_STARTUP_*` environment variables. A missing or slow controller
    /// surfaces as a retryable error; magic/version trouble is fatal.
    pub fn attach(session: SessionId, config: AgentConfig) -> Result<Self, FabricError> {
        let budget = StartupBudget::from_env();
        let mut fabric_config = config.fabric;
        fabric_config.attach_timeout =
            budget.attach_timeout(fabric_config.attach_timeout, config.symbol_count_hint);

        let policy = MarkingPolicy::new(config.patterns)?;
        let fabric = Fabric::attach(session, &fabric_config)?;

        let initial_epoch = fabric.control().registry_epoch.load(Ordering::Acquire);
        let shared = Shared {
            mode: CachePadded::new(AtomicU32::new(AgentMode::GlobalOnly as u32)),
            epoch: CachePadded::new(AtomicU64::new(initial_epoch)),
            halted: AtomicBool::new(false),
            events_since_tick: CachePadded::new(AtomicU64::new(0)),
            machine: Mutex::new(ModeMachine::new(config.mode, initial_epoch)),
        };

        log::info!(
            "agent attached: pid={} session={}",
            session.host_pid,
            session.session_id
        );
        Ok(Self {
            fabric,
            policy,
            window: config.window,
            prefetch: fabric_config.prefetch(),
            shared,
        })
    }

    /// Ready signal: hooks are installed, tracing may begin.
    pub fn publish_ready(&self) {
        self.fabric.control().agent_attached.store(1, Ordering::Release);
    }

    #[inline]
    pub fn mode(&self) -> AgentMode {
        AgentMode::from_u32(self.shared.mode.load(Ordering::Relaxed))
            .unwrap_or(AgentMode::GlobalOnly)
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.fabric.session()
    }

    /// The underlying fabric views (used by tests and adapters).
    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Amortized coordination check, called from the emit paths.
    #[inline]
    pub(crate) fn bump_tick(&self) {
        let n = self.shared.events_since_tick.fetch_add(1, Ordering::Relaxed);
        if n & (MODE_TICK_EVENT_INTERVAL - 1) == 0 {
            self.force_tick();
        }
    }

    /// One observation of the control block. Safe from any thread; a
    /// concurrent tick makes this a no-op instead of a wait.
    pub fn force_tick(&self) -> Option<ModeEvent> {
        let Ok(mut machine) = self.shared.machine.try_lock() else {
            return None;
        };

        let control = self.fabric.control();
        if control.shutdown_requested.load(Ordering::Acquire) == 1 {
            self.shared.halted.store(true, Ordering::Release);
        }

        let now = monotonic_ns();
        let ready = control.registry_ready.load(Ordering::Acquire) == 1;
        let heartbeat = control.drain_heartbeat_ns.load(Ordering::Acquire);
        let epoch = control.registry_epoch.load(Ordering::Acquire);

        let event = machine.tick(now, ready, heartbeat, epoch);
        let mode = machine.mode() as u32;
        drop(machine);

        self.shared.mode.store(mode, Ordering::Release);
        self.fabric.control().registry_mode.store(mode, Ordering::Release);

        if let Some(ModeEvent::EpochChanged { epoch }) = event {
            self.shared.epoch.store(epoch, Ordering::Release);
            log::debug!("registry epoch moved to {epoch}; slot caches invalidated");
        }
        event
    }
}
