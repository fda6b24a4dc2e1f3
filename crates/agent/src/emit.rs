//! Producer emit paths.
//!
//! Index events go out on every call/return; detail events carry the
//! register/stack payload and drive the persistence window. Nothing here
//! blocks, allocates, or takes a lock: backpressure is pool refill, then
//! fallback mirroring, then drop-oldest on the thread's own ring.

use crate::agent::Agent;
use crate::tls::{self, Route};
use ada_fabric::layout::{Lane, LaneKind, ThreadLaneSet, NIL_HANDLE};
use ada_fabric::record::{
    frame_len, DetailEvent, EnterEvent, LeaveEvent, DETAIL_MAX_WIRE_BYTES, DETAIL_REG_COUNT,
    KIND_DETAIL, KIND_ENTER, KIND_LEAVE,
};
use ada_fabric::{monotonic_ns, AgentMode, FabricError, Probe, PushError, RingPool};
use std::sync::atomic::Ordering;

impl Agent {
    // ---------------------------------------------------------------------
    // Index lane
    // ---------------------------------------------------------------------

    /// Record a function entry on the calling thread's index lane.
    #[inline]
    pub fn emit_index_enter(&self, function_id: u64) {
        let wire = EnterEvent { function_id, timestamp_ns: monotonic_ns() }.encode();
        self.emit_index(KIND_ENTER, &wire);
    }

    /// Record a function return on the calling thread's index lane.
    #[inline]
    pub fn emit_index_leave(&self, function_id: u64, ret: u64) {
        let wire = LeaveEvent { function_id, timestamp_ns: monotonic_ns(), ret }.encode();
        self.emit_index(KIND_LEAVE, &wire);
    }

    fn emit_index(&self, kind: u8, wire: &[u8]) {
        if self.is_halted() {
            return;
        }
        self.bump_tick();

        match self.mode() {
            AgentMode::GlobalOnly => self.push_fallback(kind, wire),
            AgentMode::DualWrite => {
                if let Some(slot_idx) = self.route() {
                    // The fallback copy below is the safety net; a lane
                    // miss here needs no mirror of its own.
                    self.push_to_lane(slot_idx, LaneKind::Index, kind, wire, false);
                }
                self.push_fallback(kind, wire);
            }
            AgentMode::PerThreadOnly => match self.route() {
                Some(slot_idx) => self.push_to_lane(slot_idx, LaneKind::Index, kind, wire, true),
                None => self.push_fallback(kind, wire),
            },
        }
    }

    // ---------------------------------------------------------------------
    // Detail lane
    // ---------------------------------------------------------------------

    /// Record a register/stack capture and advance this thread's
    /// persistence window. The probe is evaluated against the marking
    /// policy; a match marks the window for dump.
    pub fn emit_detail(
        &self,
        function_id: u64,
        regs: &[u64; DETAIL_REG_COUNT],
        stack: &[u8],
        probe: &Probe<'_>,
    ) {
        if self.is_halted() {
            return;
        }
        self.bump_tick();

        let now = monotonic_ns();
        let marked = self.policy.matches(probe);
        let event = DetailEvent { function_id, timestamp_ns: now, regs: *regs, stack };
        let mut buf = [0u8; DETAIL_MAX_WIRE_BYTES];
        let len = event.encode_into(&mut buf);
        let wire = &buf[..len];

        match self.mode() {
            AgentMode::GlobalOnly => self.push_fallback(KIND_DETAIL, wire),
            AgentMode::DualWrite => {
                if let Some(slot_idx) = self.route() {
                    self.emit_detail_to_lane(slot_idx, wire, now, marked);
                }
                self.push_fallback(KIND_DETAIL, wire);
            }
            AgentMode::PerThreadOnly => match self.route() {
                Some(slot_idx) => self.emit_detail_to_lane(slot_idx, wire, now, marked),
                None => self.push_fallback(KIND_DETAIL, wire),
            },
        }
    }

    fn emit_detail_to_lane(&self, slot_idx: u32, wire: &[u8], now: u64, marked: bool) {
        let registry = self.fabric.registry();
        let pool = self.fabric.pool();
        let slot = registry.slot(slot_idx as usize);
        let lane = &slot.detail;

        if marked {
            slot.marks_seen.fetch_add(1, Ordering::Relaxed);
        }

        let handle = lane.active_ring.load(Ordering::Relaxed);
        if handle == NIL_HANDLE {
            self.push_fallback(KIND_DETAIL, wire);
            return;
        }
        let ring = pool.ring(handle);

        match ring.push_frame(KIND_DETAIL, wire) {
            Ok(()) => {}
            Err(PushError::Oversize) => {
                lane.drops_ring_full.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(PushError::Full) => {
                // A full ring closes the window: dump it if it earned a
                // mark, discard it in place otherwise.
                let keep = tls::with_window(now, |w| w.mark_seen());
                if !keep {
                    ring.recycle();
                    slot.windows_discarded.fetch_add(1, Ordering::Relaxed);
                    tls::with_window(now, |w| w.restart(now));
                    if ring.push_frame(KIND_DETAIL, wire).is_err() {
                        lane.drops_ring_full.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                } else if let Some(fresh) = self.rotate_ring(slot, lane, &pool) {
                    slot.windows_dumped.fetch_add(1, Ordering::Relaxed);
                    tls::with_window(now, |w| w.restart(now));
                    if pool.ring(fresh).push_frame(KIND_DETAIL, wire).is_err() {
                        lane.drops_ring_full.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                } else {
                    // Marked window but no ring to swap in: shed the oldest
                    // frames (trimming pre-roll) rather than lose the mark.
                    loop {
                        let dropped = ring.drop_oldest();
                        if dropped == 0 {
                            lane.drops_pool_exhausted.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        lane.drops_ring_full.fetch_add(dropped as u64, Ordering::Relaxed);
                        if ring.push_frame(KIND_DETAIL, wire).is_ok() {
                            break;
                        }
                    }
                }
            }
        }

        self.count_lane_write(slot, lane, wire.len());
        let post_roll = self.window.post_roll_ns;
        let ready = tls::with_window(now, |w| {
            w.observe(now, marked);
            w.ready_for_dump(now, post_roll)
        });

        if ready && self.rotate_ring(slot, lane, &pool).is_some() {
            slot.windows_dumped.fetch_add(1, Ordering::Relaxed);
            tls::with_window(now, |w| w.restart(now));
        }
    }

    // ---------------------------------------------------------------------
    // Routing and backpressure
    // ---------------------------------------------------------------------

    /// Resolve the calling thread's slot, registering on first touch and
    /// re-registering after an epoch bump. `None` routes to the fallback.
    fn route(&self) -> Option<u32> {
        let epoch = self.shared.epoch.load(Ordering::Relaxed);
        let cached = tls::cached();
        match cached.route {
            Route::Slot(idx) if cached.epoch == epoch => return Some(idx),
            Route::Orphan if cached.epoch == epoch => return None,
            _ => {}
        }

        // Slow path: first touch, or the epoch moved under us.
        if let Route::Slot(old_idx) = cached.route {
            self.retire_slot(old_idx);
        }

        let registry = self.fabric.registry();
        let pool = self.fabric.pool();
        match registry.register(platform_thread_id(), &pool, epoch, self.prefetch) {
            Ok(idx) => {
                tls::cache(Route::Slot(idx), epoch);
                tls::reset_window();
                Some(idx)
            }
            Err(FabricError::RegistryFull { .. } | FabricError::PoolExhausted) => {
                pool.fallback().count_activation();
                tls::cache(Route::Orphan, epoch);
                None
            }
            Err(_) => None,
        }
    }

    /// Submit this thread's partial rings and hand the old slot to the
    /// drain for reclaim.
    fn retire_slot(&self, slot_idx: u32) {
        let registry = self.fabric.registry();
        let pool = self.fabric.pool();
        let slot = registry.slot(slot_idx as usize);

        for kind in LaneKind::ALL {
            let lane = slot.lane(kind);
            let handle = lane.active_ring.swap(NIL_HANDLE, Ordering::Relaxed);
            if handle == NIL_HANDLE {
                continue;
            }
            let ring = pool.ring(handle);
            if ring.is_empty() {
                pool.push_free(handle);
                continue;
            }
            if lane.submit.push(handle).is_ok() {
                lane.rings_submitted.fetch_add(1, Ordering::Relaxed);
            } else {
                // Submit queue jammed: the partial cannot be handed over.
                // Count its records as drops before recycling.
                let lost = ring.consume_frames(usize::MAX, |_, _| {}).records;
                lane.drops_ring_full.fetch_add(lost as u64, Ordering::Relaxed);
                ring.recycle();
                pool.push_free(handle);
            }
        }
        registry.retire(slot_idx as usize);
        tls::reset_window();
    }

    fn push_to_lane(
        &self,
        slot_idx: u32,
        lane_kind: LaneKind,
        kind: u8,
        wire: &[u8],
        mirror_on_overflow: bool,
    ) {
        let registry = self.fabric.registry();
        let pool = self.fabric.pool();
        let slot = registry.slot(slot_idx as usize);
        let lane = slot.lane(lane_kind);

        let handle = lane.active_ring.load(Ordering::Relaxed);
        if handle == NIL_HANDLE {
            self.push_fallback(kind, wire);
            return;
        }

        match pool.ring(handle).push_frame(kind, wire) {
            Ok(()) => self.count_lane_write(slot, lane, wire.len()),
            Err(PushError::Oversize) => {
                if mirror_on_overflow {
                    lane.drops_ring_full.fetch_add(1, Ordering::Relaxed);
                }
                // In dual write the caller's fallback copy still delivers.
            }
            Err(PushError::Full) => {
                if let Some(fresh) = self.rotate_ring(slot, lane, &pool) {
                    match pool.ring(fresh).push_frame(kind, wire) {
                        Ok(()) => self.count_lane_write(slot, lane, wire.len()),
                        Err(_) => {
                            lane.drops_ring_full.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else if mirror_on_overflow {
                    self.mirror_overflow(slot, lane, handle, kind, wire);
                }
                // As above: without the overflow duty the fallback copy
                // from the caller covers this record.
            }
        }
    }

    /// Pool refill failed: mirror the record to the fallback ring; if that
    /// is full too, make room in the thread's own ring by dropping its
    /// oldest records.
    fn mirror_overflow(
        &self,
        slot: &ThreadLaneSet,
        lane: &Lane,
        handle: u32,
        kind: u8,
        wire: &[u8],
    ) {
        let pool = self.fabric.pool();
        let fallback = pool.fallback();
        if fallback.push_frame(kind, wire).is_ok() {
            lane.overflow_mirrored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        fallback.count_drop();

        let ring = pool.ring(handle);
        loop {
            let dropped = ring.drop_oldest();
            if dropped == 0 {
                lane.drops_pool_exhausted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            lane.drops_ring_full.fetch_add(dropped as u64, Ordering::Relaxed);
            if ring.push_frame(kind, wire).is_ok() {
                self.count_lane_write(slot, lane, wire.len());
                return;
            }
        }
    }

    /// Swap a full active ring for a fresh one: replacement first (lane
    /// free queue, then one-shot global refill), submit second, so the
    /// lane is never left ringless.
    fn rotate_ring(&self, _slot: &ThreadLaneSet, lane: &Lane, pool: &RingPool<'_>) -> Option<u32> {
        // Ring retire is the designated lazy shutdown checkpoint.
        let control = self.fabric.control();
        if control.shutdown_requested.load(Ordering::Acquire) == 1 {
            self.shared.halted.store(true, Ordering::Release);
        }

        let replacement = lane.free.pop().or_else(|| pool.pop_free())?;
        let old = lane.active_ring.load(Ordering::Relaxed);

        match lane.submit.push(old) {
            Ok(()) => {
                lane.rings_submitted.fetch_add(1, Ordering::Relaxed);
                lane.active_ring.store(replacement, Ordering::Release);
                Some(replacement)
            }
            Err(_) => {
                // Drain is far behind; only the global list may take the
                // replacement back (the lane free queue's producer is the
                // drain, not us).
                pool.push_free(replacement);
                None
            }
        }
    }

    fn count_lane_write(&self, slot: &ThreadLaneSet, lane: &Lane, payload_len: usize) {
        lane.events.fetch_add(1, Ordering::Relaxed);
        lane.bytes.fetch_add(frame_len(payload_len) as u64, Ordering::Relaxed);
        slot.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn push_fallback(&self, kind: u8, wire: &[u8]) {
        let fallback = self.fabric.pool().fallback();
        if fallback.push_frame(kind, wire).is_err() {
            fallback.count_drop();
        }
    }
}

/// Platform thread id for the registry slot.
#[inline]
fn platform_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        (unsafe { libc::gettid() }) as u64
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: pthread_self has no preconditions.
        (unsafe { libc::pthread_self() }) as usize as u64
    }
}
