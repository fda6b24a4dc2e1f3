//! Drain engine: the consumer side of every lane.
//!
//! One dedicated thread walks the registry with a rotating start slot so
//! no thread is starved, pops submitted rings from each lane bounded by a
//! per-visit quantum, re-frames their records into a scratch buffer, and
//! hands them to the writer before recycling the ring back to the lane.
//! The drain is the only writer of the control block's aggregates and of
//! `drain_heartbeat_ns`, which doubles as the agent's liveness signal.

use crate::writer::{RingMeta, RingSource, TraceWriter, WriterError};
use ada_fabric::layout::{
    Lane, LaneKind, FRAME_HEADER_BYTES, NIL_HANDLE, SLOT_ACTIVE, SLOT_RETIRED, THREAD_SLOTS,
};
use ada_fabric::record;
use ada_fabric::{monotonic_ns, Fabric, Registry};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What an empty cycle does before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    Sleep,
    Yield,
}

/// Drain scheduling knobs.
#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    /// Active threads visited per cycle.
    pub max_threads_per_cycle: usize,
    /// Rings taken per lane per visit.
    pub fairness_quantum: usize,
    /// Record budget per thread per cycle (checked at ring granularity).
    pub max_events_per_thread: usize,
    /// Idle sleep duration.
    pub poll_interval: Duration,
    pub idle: IdleStrategy,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            max_threads_per_cycle: usize::MAX,
            fairness_quantum: 2,
            max_events_per_thread: 65_536,
            poll_interval: Duration::from_micros(200),
            idle: IdleStrategy::Sleep,
        }
    }
}

/// Host-side drain counters, shared with the session and the reporter.
#[derive(Debug, Default)]
pub struct DrainStats {
    pub cycles: CachePadded<AtomicU64>,
    pub idle_cycles: CachePadded<AtomicU64>,
    pub rings_drained: AtomicU64,
    pub records_drained: AtomicU64,
    pub fairness_rotations: AtomicU64,
    pub sleeps: AtomicU64,
    pub final_drains: AtomicU64,
}

/// The drain loop and its working state.
pub struct DrainEngine<W> {
    fabric: Arc<Fabric>,
    writer: W,
    config: DrainConfig,
    stats: Arc<DrainStats>,
    /// Stalls the loop without stopping it (used to exercise the agent's
    /// degradation path).
    paused: Arc<AtomicBool>,
    scratch: Vec<u8>,
    rotate: usize,
    sequence: u64,
}

impl<W: TraceWriter> DrainEngine<W> {
    pub fn new(fabric: Arc<Fabric>, writer: W, config: DrainConfig) -> Self {
        Self {
            fabric,
            writer,
            config,
            stats: Arc::new(DrainStats::default()),
            paused: Arc::new(AtomicBool::new(false)),
            scratch: Vec::with_capacity(ada_fabric::layout::RING_SLAB_BYTES),
            rotate: THREAD_SLOTS - 1,
            sequence: 0,
        }
    }

    pub fn stats(&self) -> Arc<DrainStats> {
        Arc::clone(&self.stats)
    }

    pub fn pause_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Run until shutdown, then perform the final drain and flush.
    ///
    /// A writer failure is fatal: it is logged once, `shutdown_requested`
    /// is raised so producers stop, and the error is returned.
    pub fn run(&mut self) -> Result<(), WriterError> {
        loop {
            if self.paused.load(Ordering::Acquire) {
                std::thread::sleep(self.config.poll_interval);
                if self.fabric.control().shutdown_requested.load(Ordering::Acquire) == 1 {
                    break;
                }
                continue;
            }

            let drained = match self.cycle() {
                Ok(n) => n,
                Err(e) => return Err(self.fatal(e)),
            };

            if self.fabric.control().shutdown_requested.load(Ordering::Acquire) == 1 {
                break;
            }

            if drained == 0 {
                self.stats.idle_cycles.fetch_add(1, Ordering::Relaxed);
                self.fabric.control().drain_idle_cycles.fetch_add(1, Ordering::Relaxed);
                match self.config.idle {
                    IdleStrategy::Sleep => {
                        self.stats.sleeps.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(self.config.poll_interval);
                    }
                    IdleStrategy::Yield => std::thread::yield_now(),
                }
            }
        }

        // Producers check shutdown lazily (per ring retire); give them one
        // poll interval to quiesce before the last pass.
        std::thread::sleep(self.config.poll_interval);
        if let Err(e) = self.final_drain() {
            return Err(self.fatal(e));
        }
        if let Err(e) = self.writer.flush() {
            return Err(self.fatal(e));
        }
        log::info!("drain stopped: session {:?}", self.fabric.session());
        Ok(())
    }

    fn fatal(&self, e: WriterError) -> WriterError {
        let session = self.fabric.session();
        log::error!(
            "writer failure, aborting session pid={} id={}: {e}",
            session.host_pid,
            session.session_id
        );
        self.fabric.control().shutdown_requested.store(1, Ordering::Release);
        e
    }

    /// One fair pass. Returns the records moved.
    fn cycle(&mut self) -> Result<usize, WriterError> {
        let control = self.fabric.control();
        control.drain_heartbeat_ns.store(monotonic_ns(), Ordering::Release);
        control.drain_cycles.fetch_add(1, Ordering::Relaxed);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        self.rotate = (self.rotate + 1) % THREAD_SLOTS;
        self.stats.fairness_rotations.fetch_add(1, Ordering::Relaxed);

        let mut total = 0;
        let mut visited = 0;
        for i in 0..THREAD_SLOTS {
            let idx = (self.rotate + i) % THREAD_SLOTS;
            let state = self.fabric.registry().slot(idx).active.load(Ordering::Acquire);
            match state {
                SLOT_ACTIVE if visited < self.config.max_threads_per_cycle => {
                    visited += 1;
                    total += self.drain_slot(idx)?;
                }
                SLOT_RETIRED => total += self.reclaim_retired(idx)?,
                _ => {}
            }
        }

        total += self.drain_fallback()?;
        Ok(total)
    }

    /// Drain both lanes of an active slot within the fairness bounds.
    fn drain_slot(&mut self, idx: usize) -> Result<usize, WriterError> {
        let fabric = Arc::clone(&self.fabric);
        let registry = fabric.registry();
        let slot = registry.slot(idx);
        let slot_id = slot.slot_id.load(Ordering::Relaxed);
        let thread_id = slot.thread_id.load(Ordering::Relaxed);

        let mut slot_records = 0;
        for lane_kind in LaneKind::ALL {
            let lane = slot.lane(lane_kind);
            for _ in 0..self.config.fairness_quantum {
                if slot_records >= self.config.max_events_per_thread {
                    return Ok(slot_records);
                }
                let Some(handle) = lane.submit.pop() else { break };
                let source = RingSource::Lane { slot_id, thread_id, lane: lane_kind };
                let records = self.hand_off(handle, source)?;

                // Recycle: back to the lane if it has room, else the pool.
                let pool = self.fabric.pool();
                pool.ring(handle).recycle();
                if let Err(back) = lane.free.push(handle) {
                    pool.push_free(back);
                }
                self.count_ring_drained();
                slot_records += records;
            }
        }
        Ok(slot_records)
    }

    /// A retired slot: empty its queues completely, fold its drop counters
    /// into the session aggregates, and free it for reuse.
    fn reclaim_retired(&mut self, idx: usize) -> Result<usize, WriterError> {
        let fabric = Arc::clone(&self.fabric);
        let registry = fabric.registry();
        let slot = registry.slot(idx);
        let slot_id = slot.slot_id.load(Ordering::Relaxed);
        let thread_id = slot.thread_id.load(Ordering::Relaxed);

        let mut records = 0;
        for lane_kind in LaneKind::ALL {
            let lane = slot.lane(lane_kind);
            let source = RingSource::Lane { slot_id, thread_id, lane: lane_kind };
            while let Some(handle) = lane.submit.pop() {
                records += self.hand_off(handle, source)?;
                let pool = self.fabric.pool();
                pool.ring(handle).recycle();
                pool.push_free(handle);
                self.count_ring_drained();
            }
            // The retiring thread swapped its active rings out; anything
            // still here means it died mid-retire. Salvage the records.
            let orphan = lane.active_ring.load(Ordering::Acquire);
            if orphan != NIL_HANDLE {
                records += self.hand_off(orphan, source)?;
            }
            self.fold_lane_drops(lane);
        }

        let pool = self.fabric.pool();
        Registry::return_lane_rings(&slot.index, &pool);
        Registry::return_lane_rings(&slot.detail, &pool);
        registry.release_retired(idx);
        log::debug!("reclaimed retired slot {idx}");
        Ok(records)
    }

    fn fold_lane_drops(&self, lane: &Lane) {
        let drops = lane.drops_ring_full.load(Ordering::Relaxed)
            + lane.drops_pool_exhausted.load(Ordering::Relaxed);
        if drops > 0 {
            self.fabric.control().events_dropped.fetch_add(drops, Ordering::Relaxed);
        }
    }

    /// Consume whatever sits in the shared fallback ring, in place.
    fn drain_fallback(&mut self) -> Result<usize, WriterError> {
        let handle = ada_fabric::layout::FALLBACK_RING_HANDLE;
        self.hand_off(handle, RingSource::Fallback)
    }

    /// Final pass after producers quiesced: submitted rings, then the
    /// lane-active partials in place, then the fallback.
    fn final_drain(&mut self) -> Result<(), WriterError> {
        self.stats.final_drains.fetch_add(1, Ordering::Relaxed);
        let control = self.fabric.control();
        control.final_drains.fetch_add(1, Ordering::Relaxed);
        control.drain_heartbeat_ns.store(monotonic_ns(), Ordering::Release);

        for idx in 0..THREAD_SLOTS {
            let state = self.fabric.registry().slot(idx).active.load(Ordering::Acquire);
            match state {
                SLOT_RETIRED => {
                    self.reclaim_retired(idx)?;
                }
                SLOT_ACTIVE => {
                    let fabric = Arc::clone(&self.fabric);
                    let registry = fabric.registry();
                    let slot = registry.slot(idx);
                    let slot_id = slot.slot_id.load(Ordering::Relaxed);
                    let thread_id = slot.thread_id.load(Ordering::Relaxed);

                    for lane_kind in LaneKind::ALL {
                        let lane = slot.lane(lane_kind);
                        let source = RingSource::Lane { slot_id, thread_id, lane: lane_kind };
                        while let Some(handle) = lane.submit.pop() {
                            self.hand_off(handle, source)?;
                            let pool = self.fabric.pool();
                            pool.ring(handle).recycle();
                            pool.push_free(handle);
                            self.count_ring_drained();
                        }
                        // Producers are quiesced, so the active partial is
                        // safe to touch in place. The index partial is
                        // swept to the writer; the detail partial is an
                        // unmarked window and is discarded unsubmitted.
                        let active = lane.active_ring.load(Ordering::Acquire);
                        if active != NIL_HANDLE {
                            match lane_kind {
                                LaneKind::Index => {
                                    self.hand_off(active, source)?;
                                }
                                LaneKind::Detail => {
                                    let pool = self.fabric.pool();
                                    if !pool.ring(active).is_empty() {
                                        log::debug!(
                                            "discarding unmarked detail window in slot {idx}"
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        self.drain_fallback()?;
        Ok(())
    }

    /// Move one ring's unread frames to the writer as a canonical frame
    /// stream. Advances the ring's `read_pos`; does not recycle.
    fn hand_off(&mut self, handle: u32, source: RingSource) -> Result<usize, WriterError> {
        let pool = self.fabric.pool();
        let ring = pool.ring(handle);

        let scratch = &mut self.scratch;
        scratch.clear();
        let count = ring.consume_frames(usize::MAX, |kind, payload| {
            let mut header = [0u8; FRAME_HEADER_BYTES];
            record::encode_header(&mut header, kind, payload.len() as u32);
            scratch.extend_from_slice(&header);
            scratch.extend_from_slice(payload);
            let pad = record::frame_len(payload.len()) - (FRAME_HEADER_BYTES + payload.len());
            scratch.extend_from_slice(&[0u8; 8][..pad]);
        });

        if count.records == 0 {
            return Ok(0);
        }

        let meta = RingMeta {
            source,
            ring_handle: handle,
            records: count.records as u64,
            bytes: self.scratch.len() as u64,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.writer.accept(&meta, &self.scratch)?;

        let control = self.fabric.control();
        control.events_captured.fetch_add(count.records as u64, Ordering::Relaxed);
        control.bytes_written.fetch_add(self.scratch.len() as u64, Ordering::Relaxed);
        self.stats.records_drained.fetch_add(count.records as u64, Ordering::Relaxed);
        Ok(count.records)
    }

    fn count_ring_drained(&self) {
        self.fabric.control().rings_drained.fetch_add(1, Ordering::Relaxed);
        self.stats.rings_drained.fetch_add(1, Ordering::Relaxed);
    }
}
