//! Lock-free metrics snapshots.
//!
//! Every counter in the fabric is a relaxed atomic with a single logical
//! writer: producer-owned counters live in the registry slots, fallback
//! counters in the pool header, and drain-owned aggregates in the control
//! block. Relaxed is correct here because nothing branches on freshness —
//! the counters guard no data and participate in no handoff; slightly
//! stale reads are fine for observability. The reporter takes whole-fabric
//! snapshots with plain loads.

use crate::layout::{ControlBlock, Lane, ThreadLaneSet, SLOT_ACTIVE, SLOT_RETIRED};
use crate::pool::RingPool;
use crate::registry::Registry;
use std::sync::atomic::Ordering;

/// Counters of one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneCounters {
    pub events: u64,
    pub bytes: u64,
    pub rings_submitted: u64,
    pub drops_ring_full: u64,
    pub drops_pool_exhausted: u64,
    pub overflow_mirrored: u64,
}

impl LaneCounters {
    fn read(lane: &Lane) -> Self {
        Self {
            events: lane.events.load(Ordering::Relaxed),
            bytes: lane.bytes.load(Ordering::Relaxed),
            rings_submitted: lane.rings_submitted.load(Ordering::Relaxed),
            drops_ring_full: lane.drops_ring_full.load(Ordering::Relaxed),
            drops_pool_exhausted: lane.drops_pool_exhausted.load(Ordering::Relaxed),
            overflow_mirrored: lane.overflow_mirrored.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.drops_ring_full + self.drops_pool_exhausted
    }
}

/// Counters of one registered thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCounters {
    pub slot_id: u32,
    pub thread_id: u64,
    pub events_emitted: u64,
    pub marks_seen: u64,
    pub windows_dumped: u64,
    pub windows_discarded: u64,
    pub index: LaneCounters,
    pub detail: LaneCounters,
}

impl ThreadCounters {
    fn read(slot: &ThreadLaneSet) -> Self {
        Self {
            slot_id: slot.slot_id.load(Ordering::Relaxed),
            thread_id: slot.thread_id.load(Ordering::Relaxed),
            events_emitted: slot.events_emitted.load(Ordering::Relaxed),
            marks_seen: slot.marks_seen.load(Ordering::Relaxed),
            windows_dumped: slot.windows_dumped.load(Ordering::Relaxed),
            windows_discarded: slot.windows_discarded.load(Ordering::Relaxed),
            index: LaneCounters::read(&slot.index),
            detail: LaneCounters::read(&slot.detail),
        }
    }
}

/// Whole-fabric counter snapshot.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Drain-owned aggregates (include counters folded in from reclaimed
    // slots).
    pub events_captured: u64,
    pub events_dropped: u64,
    pub bytes_written: u64,
    pub rings_drained: u64,
    pub drain_cycles: u64,
    pub drain_idle_cycles: u64,
    pub final_drains: u64,

    // Fallback lane.
    pub fallback_activations: u64,
    pub fallback_drops: u64,
    pub fallback_records: u64,
    pub fallback_commit_waits: u64,

    // Coordination.
    pub heartbeat_ns: u64,
    pub epoch: u64,
    pub mode: u32,
    pub agent_attached: bool,
    pub shutdown_requested: bool,
    pub free_rings: u32,

    // Live (active or retired-awaiting-reclaim) slots.
    pub threads: Vec<ThreadCounters>,
}

impl MetricsSnapshot {
    /// One pass over the control block, registry, and pool header.
    pub fn collect(control: &ControlBlock, registry: &Registry<'_>, pool: &RingPool<'_>) -> Self {
        let ph = pool.header();
        let mut snap = Self {
            events_captured: control.events_captured.load(Ordering::Relaxed),
            events_dropped: control.events_dropped.load(Ordering::Relaxed),
            bytes_written: control.bytes_written.load(Ordering::Relaxed),
            rings_drained: control.rings_drained.load(Ordering::Relaxed),
            drain_cycles: control.drain_cycles.load(Ordering::Relaxed),
            drain_idle_cycles: control.drain_idle_cycles.load(Ordering::Relaxed),
            final_drains: control.final_drains.load(Ordering::Relaxed),
            fallback_activations: ph.fallback_activations.load(Ordering::Relaxed),
            fallback_drops: ph.fallback_drops.load(Ordering::Relaxed),
            fallback_records: ph.fallback_records.load(Ordering::Relaxed),
            fallback_commit_waits: ph.fallback_commit_waits.load(Ordering::Relaxed),
            heartbeat_ns: control.drain_heartbeat_ns.load(Ordering::Relaxed),
            epoch: control.registry_epoch.load(Ordering::Relaxed),
            mode: control.registry_mode.load(Ordering::Relaxed),
            agent_attached: control.agent_attached.load(Ordering::Relaxed) == 1,
            shutdown_requested: control.shutdown_requested.load(Ordering::Relaxed) == 1,
            free_rings: pool.free_count(),
            threads: Vec::new(),
        };

        for state in [SLOT_ACTIVE, SLOT_RETIRED] {
            for (_, slot) in registry.slots_in_state(state) {
                snap.threads.push(ThreadCounters::read(slot));
            }
        }
        snap
    }

    /// Drops across every source: lane counters, fallback, and the
    /// aggregates folded in from reclaimed slots.
    pub fn events_dropped_total(&self) -> u64 {
        self.events_dropped
            + self.fallback_drops
            + self
                .threads
                .iter()
                .map(|t| t.index.dropped() + t.detail.dropped())
                .sum::<u64>()
    }

    /// Events emitted by live threads plus everything already captured.
    pub fn events_emitted_total(&self) -> u64 {
        self.threads.iter().map(|t| t.events_emitted).sum::<u64>() + self.fallback_records
    }

    /// Fraction of detail windows that were persisted. `None` until a
    /// window has closed.
    pub fn dump_ratio(&self) -> Option<f64> {
        let dumped: u64 = self.threads.iter().map(|t| t.windows_dumped).sum();
        let discarded: u64 = self.threads.iter().map(|t| t.windows_discarded).sum();
        let closed = dumped + discarded;
        (closed > 0).then(|| dumped as f64 / closed as f64)
    }

    /// Fraction of detail events whose probe matched the policy.
    pub fn mark_rate(&self) -> Option<f64> {
        let detail: u64 = self.threads.iter().map(|t| t.detail.events).sum();
        let marks: u64 = self.threads.iter().map(|t| t.marks_seen).sum();
        (detail > 0).then(|| marks as f64 / detail as f64)
    }
}
