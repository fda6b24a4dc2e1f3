//! Adapters between the interceptor's hook callbacks and the emit paths.
//!
//! The function-hooking machinery lives outside this crate; it resolves
//! symbol/module strings for the functions it instrumented and calls these
//! adapters from its trampolines.

use crate::agent::Agent;
use ada_fabric::record::DETAIL_REG_COUNT;
use ada_fabric::Probe;

/// Captured register file at function entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegSnapshot {
    pub regs: [u64; DETAIL_REG_COUNT],
}

/// Entry hook: always records the index event; records a detail event when
/// the interceptor captured a payload for this function.
pub fn on_enter(
    agent: &Agent,
    function_id: u64,
    regs: &RegSnapshot,
    stack: &[u8],
    probe: &Probe<'_>,
) {
    agent.emit_index_enter(function_id);
    agent.emit_detail(function_id, &regs.regs, stack, probe);
}

/// Return hook: index event only.
pub fn on_leave(agent: &Agent, function_id: u64, ret: u64) {
    agent.emit_index_leave(function_id, ret);
}
