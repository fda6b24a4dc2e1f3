//! Agent mode state machine.
//!
//! The agent comes up before the controller is ready, so producers start
//! on the global fallback ring (`global_only`), move to writing both the
//! per-thread lanes and the fallback once the registry is ready
//! (`dual_write`), and settle on per-thread lanes alone after the drain
//! heartbeat has looked healthy long enough (`per_thread_only`). A stalled
//! heartbeat walks the same path backwards; an epoch bump restarts the
//! climb from `dual_write` after re-registration.
//!
//! The machine is pure: `tick` consumes sampled control-block values and
//! the caller applies the returned event. That keeps every transition
//! unit-testable without shared memory.

use crate::layout::{MODE_DUAL_WRITE, MODE_GLOBAL_ONLY, MODE_PER_THREAD_ONLY};

/// Where producers write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AgentMode {
    /// Fallback ring only. Initial state, and the floor after a stall.
    GlobalOnly = MODE_GLOBAL_ONLY,
    /// Per-thread lanes and the fallback, both.
    DualWrite = MODE_DUAL_WRITE,
    /// Per-thread lanes only. Steady state.
    PerThreadOnly = MODE_PER_THREAD_ONLY,
}

impl AgentMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            MODE_GLOBAL_ONLY => Some(Self::GlobalOnly),
            MODE_DUAL_WRITE => Some(Self::DualWrite),
            MODE_PER_THREAD_ONLY => Some(Self::PerThreadOnly),
            _ => None,
        }
    }
}

/// Timing knobs for the machine.
#[derive(Debug, Clone, Copy)]
pub struct ModeParams {
    /// Heartbeat older than this is a stall.
    pub stall_threshold_ns: u64,
    /// Consecutive healthy observations before `dual_write` promotes.
    pub healthy_ticks_required: u32,
    /// Continuous unhealthy time before a state degrades one step.
    pub degrade_after_ns: u64,
}

impl ModeParams {
    /// Stall threshold is twice the expected drain interval.
    pub fn for_drain_interval(expected_interval_ns: u64) -> Self {
        Self {
            stall_threshold_ns: expected_interval_ns.saturating_mul(2),
            healthy_ticks_required: 3,
            degrade_after_ns: 500_000_000, // 500 ms per step
        }
    }
}

impl Default for ModeParams {
    fn default() -> Self {
        // Expected drain interval of 10 ms unless the session says otherwise.
        Self::for_drain_interval(10_000_000)
    }
}

/// What a tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    /// Registry became ready: leave `global_only`.
    BecameDual,
    /// Heartbeat healthy long enough: settle on per-thread lanes.
    BecamePerThread,
    /// Stall: step down from `per_thread_only`.
    DegradedToDual,
    /// Stall persisted: fall back to the global ring alone.
    DegradedToGlobal,
    /// The registry epoch moved; the caller must drop cached slot pointers
    /// and re-register before the next emit.
    EpochChanged { epoch: u64 },
}

/// Per-agent mode state.
#[derive(Debug)]
pub struct ModeMachine {
    mode: AgentMode,
    params: ModeParams,
    healthy_ticks: u32,
    last_seen_epoch: u64,
    last_healthy_heartbeat_ns: u64,
    /// Start of the current continuous unhealthy stretch, per state.
    unhealthy_since_ns: Option<u64>,
    /// Set when `global_only` was re-entered by degradation: recovery then
    /// waits for a healthy heartbeat, not just `registry_ready`, so a
    /// stalled session does not flap between the two lower states.
    degraded: bool,
}

impl ModeMachine {
    pub fn new(params: ModeParams, initial_epoch: u64) -> Self {
        Self {
            mode: AgentMode::GlobalOnly,
            params,
            healthy_ticks: 0,
            last_seen_epoch: initial_epoch,
            last_healthy_heartbeat_ns: 0,
            unhealthy_since_ns: None,
            degraded: false,
        }
    }

    #[inline]
    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    #[inline]
    pub fn last_seen_epoch(&self) -> u64 {
        self.last_seen_epoch
    }

    /// Heartbeat value of the most recent healthy observation.
    #[inline]
    pub fn last_healthy_heartbeat_ns(&self) -> u64 {
        self.last_healthy_heartbeat_ns
    }

    /// Evaluate one observation of the control block.
    pub fn tick(
        &mut self,
        now_ns: u64,
        registry_ready: bool,
        heartbeat_ns: u64,
        epoch: u64,
    ) -> Option<ModeEvent> {
        if epoch != self.last_seen_epoch {
            self.last_seen_epoch = epoch;
            self.healthy_ticks = 0;
            self.unhealthy_since_ns = None;
            self.degraded = false;
            self.mode = if registry_ready { AgentMode::DualWrite } else { AgentMode::GlobalOnly };
            return Some(ModeEvent::EpochChanged { epoch });
        }

        let healthy = now_ns.saturating_sub(heartbeat_ns) <= self.params.stall_threshold_ns;
        if healthy {
            self.last_healthy_heartbeat_ns = heartbeat_ns;
        }

        match self.mode {
            AgentMode::GlobalOnly => {
                if registry_ready && (!self.degraded || healthy) {
                    self.mode = AgentMode::DualWrite;
                    self.healthy_ticks = 0;
                    self.unhealthy_since_ns = None;
                    return Some(ModeEvent::BecameDual);
                }
            }
            AgentMode::DualWrite => {
                if healthy {
                    self.unhealthy_since_ns = None;
                    self.healthy_ticks += 1;
                    if self.healthy_ticks >= self.params.healthy_ticks_required {
                        self.mode = AgentMode::PerThreadOnly;
                        self.degraded = false;
                        return Some(ModeEvent::BecamePerThread);
                    }
                } else {
                    self.healthy_ticks = 0;
                    let since = *self.unhealthy_since_ns.get_or_insert(now_ns);
                    if now_ns.saturating_sub(since) >= self.params.degrade_after_ns {
                        self.mode = AgentMode::GlobalOnly;
                        self.degraded = true;
                        self.unhealthy_since_ns = None;
                        return Some(ModeEvent::DegradedToGlobal);
                    }
                }
            }
            AgentMode::PerThreadOnly => {
                if healthy {
                    self.unhealthy_since_ns = None;
                } else {
                    let since = *self.unhealthy_since_ns.get_or_insert(now_ns);
                    if now_ns.saturating_sub(since) >= self.params.degrade_after_ns {
                        self.mode = AgentMode::DualWrite;
                        self.degraded = true;
                        self.healthy_ticks = 0;
                        self.unhealthy_since_ns = None;
                        return Some(ModeEvent::DegradedToDual);
                    }
                }
            }
        }
        None
    }
}
