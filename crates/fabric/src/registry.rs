//! Thread registry: fixed-slot table of per-thread lane sets.
//!
//! Producers self-register on first touch by CAS-claiming a slot, fully
//! initializing both lanes, then release-publishing `SLOT_ACTIVE`; the
//! drain acquires `active` and therefore never sees a half-initialized
//! slot. On an epoch bump the agent retires its slot (`SLOT_RETIRED`) and
//! the drain reclaims it back to `SLOT_FREE` after emptying its queues.

use crate::clock::monotonic_ns;
use crate::error::{FabricError, Result};
use crate::layout::{
    Lane, LaneKind, ThreadLaneSet, NIL_HANDLE, SLOT_ACTIVE, SLOT_CLAIMING, SLOT_FREE,
    SLOT_RETIRED, SLOT_STRIDE, THREAD_SLOTS,
};
use crate::pool::RingPool;
use std::sync::atomic::Ordering;

/// Borrowed view of the registry segment.
#[derive(Clone, Copy)]
pub struct Registry<'a> {
    base: *mut u8,
    _marker: std::marker::PhantomData<&'a ()>,
}

// SAFETY: slot access is governed by the `active` lifecycle word and the
// per-lane ownership protocol; the pointer carries no thread affinity.
unsafe impl Send for Registry<'_> {}
unsafe impl Sync for Registry<'_> {}

impl<'a> Registry<'a> {
    /// # Safety
    ///
    /// `base` must point to a mapped registry segment of
    /// [`crate::layout::REGISTRY_SEGMENT_BYTES`], valid for `'a`.
    pub(crate) unsafe fn from_base(base: *mut u8) -> Self {
        Self { base, _marker: std::marker::PhantomData }
    }

    /// Number of slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        THREAD_SLOTS
    }

    /// Slot accessor. `idx < slot_count()`.
    #[inline]
    pub fn slot(&self, idx: usize) -> &'a ThreadLaneSet {
        debug_assert!(idx < THREAD_SLOTS);
        // SAFETY: idx is in range and the slot array fills the mapped
        // segment with SLOT_STRIDE spacing.
        unsafe { &*self.base.add(idx * SLOT_STRIDE).cast::<ThreadLaneSet>() }
    }

    /// Claim and initialize a slot for `thread_id` under `epoch`.
    ///
    /// Walks slots linearly, CAS-claiming the first free one. Both lanes
    /// get an active ring plus up to `prefetch` spare rings in their `free`
    /// queue (the spares are best-effort; the active ring is mandatory).
    pub fn register(
        &self,
        thread_id: u64,
        pool: &RingPool<'a>,
        epoch: u64,
        prefetch: usize,
    ) -> Result<u32> {
        for idx in 0..THREAD_SLOTS {
            let slot = self.slot(idx);
            if slot
                .active
                .compare_exchange(SLOT_FREE, SLOT_CLAIMING, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            return match Self::init_slot(slot, idx as u32, thread_id, pool, epoch, prefetch) {
                Ok(()) => {
                    slot.active.store(SLOT_ACTIVE, Ordering::Release);
                    Ok(idx as u32)
                }
                Err(e) => {
                    Self::return_lane_rings(&slot.index, pool);
                    Self::return_lane_rings(&slot.detail, pool);
                    slot.active.store(SLOT_FREE, Ordering::Release);
                    Err(e)
                }
            };
        }
        Err(FabricError::RegistryFull { slots: THREAD_SLOTS })
    }

    fn init_slot(
        slot: &ThreadLaneSet,
        idx: u32,
        thread_id: u64,
        pool: &RingPool<'_>,
        epoch: u64,
        prefetch: usize,
    ) -> Result<()> {
        slot.slot_id.store(idx, Ordering::Relaxed);
        slot.thread_id.store(thread_id, Ordering::Relaxed);
        slot.registered_at_ns.store(monotonic_ns(), Ordering::Relaxed);
        slot.epoch.store(epoch, Ordering::Relaxed);
        slot.events_emitted.store(0, Ordering::Relaxed);
        slot.marks_seen.store(0, Ordering::Relaxed);
        slot.windows_dumped.store(0, Ordering::Relaxed);
        slot.windows_discarded.store(0, Ordering::Relaxed);

        for kind in LaneKind::ALL {
            Self::init_lane(slot.lane(kind), pool, prefetch)?;
        }
        Ok(())
    }

    fn init_lane(lane: &Lane, pool: &RingPool<'_>, prefetch: usize) -> Result<()> {
        lane.events.store(0, Ordering::Relaxed);
        lane.bytes.store(0, Ordering::Relaxed);
        lane.rings_submitted.store(0, Ordering::Relaxed);
        lane.drops_ring_full.store(0, Ordering::Relaxed);
        lane.drops_pool_exhausted.store(0, Ordering::Relaxed);
        lane.overflow_mirrored.store(0, Ordering::Relaxed);
        lane.submit.reset();
        lane.free.reset();

        let active = pool.pop_free().ok_or(FabricError::PoolExhausted)?;
        lane.active_ring.store(active, Ordering::Relaxed);

        for _ in 0..prefetch {
            match pool.pop_free() {
                Some(h) => {
                    if let Err(back) = lane.free.push(h) {
                        pool.push_free(back);
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Return every ring a lane still holds to the global free list.
    /// Used by registration unwind and by drain reclaim.
    pub fn return_lane_rings(lane: &Lane, pool: &RingPool<'_>) {
        let active = lane.active_ring.swap(NIL_HANDLE, Ordering::Relaxed);
        if active != NIL_HANDLE {
            pool.ring(active).recycle();
            pool.push_free(active);
        }
        while let Some(h) = lane.free.pop() {
            pool.ring(h).recycle();
            pool.push_free(h);
        }
        while let Some(h) = lane.submit.pop() {
            pool.ring(h).recycle();
            pool.push_free(h);
        }
    }

    /// Agent side: abandon a slot whose epoch has passed. The caller must
    /// have submitted any partial rings first; the drain does the reclaim.
    pub fn retire(&self, idx: usize) {
        self.slot(idx).active.store(SLOT_RETIRED, Ordering::Release);
    }

    /// Drain side: make a retired slot claimable again. The caller has
    /// already drained and recycled the slot's rings.
    pub fn release_retired(&self, idx: usize) {
        let slot = self.slot(idx);
        debug_assert_eq!(slot.active.load(Ordering::Relaxed), SLOT_RETIRED);
        slot.active.store(SLOT_FREE, Ordering::Release);
    }

    /// Iterate `(idx, slot)` pairs currently in the given lifecycle state.
    pub fn slots_in_state(&self, state: u32) -> impl Iterator<Item = (usize, &'a ThreadLaneSet)> + '_ {
        let this = *self;
        (0..THREAD_SLOTS).filter_map(move |idx| {
            let slot = this.slot(idx);
            (slot.active.load(Ordering::Acquire) == state).then_some((idx, slot))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{REGISTRY_SEGMENT_BYTES, RINGS_SEGMENT_BYTES, RING_COUNT};

    #[repr(align(64))]
    struct AlignedChunk([u8; 64]);

    struct TestFabric {
        registry_mem: Vec<AlignedChunk>,
        rings_mem: Vec<AlignedChunk>,
    }

    impl TestFabric {
        fn new() -> Self {
            let registry_chunks = REGISTRY_SEGMENT_BYTES.div_ceil(64);
            let rings_chunks = RINGS_SEGMENT_BYTES.div_ceil(64);
            let t = Self {
                registry_mem: (0..registry_chunks).map(|_| AlignedChunk([0u8; 64])).collect(),
                rings_mem: (0..rings_chunks).map(|_| AlignedChunk([0u8; 64])).collect(),
            };
            t.pool().init_layout();
            t
        }

        fn registry(&self) -> Registry<'_> {
            // SAFETY: the vec spans the full segment and outlives the view.
            unsafe { Registry::from_base(self.registry_mem.as_ptr().cast_mut().cast()) }
        }

        fn pool(&self) -> RingPool<'_> {
            // SAFETY: as above.
            unsafe { RingPool::from_base(self.rings_mem.as_ptr().cast_mut().cast()) }
        }
    }

    #[test]
    fn register_claims_distinct_slots() {
        let t = TestFabric::new();
        let reg = t.registry();
        let pool = t.pool();

        let a = reg.register(1001, &pool, 0, 2).unwrap();
        let b = reg.register(1002, &pool, 0, 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.slot(a as usize).thread_id.load(Ordering::Relaxed), 1001);
        assert_eq!(reg.slot(b as usize).thread_id.load(Ordering::Relaxed), 1002);
    }

    #[test]
    fn register_initializes_both_lanes() {
        let t = TestFabric::new();
        let idx = t.registry().register(7, &t.pool(), 3, 2).unwrap();
        let slot = t.registry().slot(idx as usize);

        for kind in LaneKind::ALL {
            let lane = slot.lane(kind);
            assert_ne!(lane.active_ring.load(Ordering::Relaxed), NIL_HANDLE);
            assert_eq!(lane.free.len(), 2);
        }
        assert_eq!(slot.epoch.load(Ordering::Relaxed), 3);
        assert_eq!(slot.active.load(Ordering::Relaxed), SLOT_ACTIVE);
    }

    #[test]
    fn registry_full_after_all_slots() {
        let t = TestFabric::new();
        let reg = t.registry();
        let pool = t.pool();

        // 0 prefetch so 64 * 2 = 128 rings suffice.
        for i in 0..THREAD_SLOTS {
            reg.register(i as u64, &pool, 0, 0).unwrap();
        }
        match reg.register(9999, &pool, 0, 0) {
            Err(FabricError::RegistryFull { slots }) => assert_eq!(slots, THREAD_SLOTS),
            other => panic!("expected RegistryFull, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_registration_never_shares_a_slot() {
        let t = TestFabric::new();
        let threads = 16;

        let mut claimed: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let reg = t.registry();
                    let pool = t.pool();
                    s.spawn(move || reg.register(i as u64, &pool, 0, 2).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        claimed.sort_unstable();
        claimed.dedup();
        assert_eq!(claimed.len(), threads);
    }

    #[test]
    fn exhausted_pool_unwinds_claim() {
        let t = TestFabric::new();
        let reg = t.registry();
        let pool = t.pool();

        // Drain the pool dry.
        let mut held = Vec::new();
        while let Some(h) = pool.pop_free() {
            held.push(h);
        }
        assert!(matches!(reg.register(1, &pool, 0, 0), Err(FabricError::PoolExhausted)));
        assert_eq!(reg.slot(0).active.load(Ordering::Relaxed), SLOT_FREE);

        // Give the rings back; registration works again.
        for h in held {
            pool.push_free(h);
        }
        assert!(reg.register(1, &pool, 0, 0).is_ok());
    }

    #[test]
    fn retire_and_release_cycle() {
        let t = TestFabric::new();
        let reg = t.registry();
        let pool = t.pool();
        let free_at_start = pool.free_count();

        let idx = reg.register(42, &pool, 0, 2).unwrap() as usize;
        reg.retire(idx);
        assert_eq!(reg.slots_in_state(SLOT_RETIRED).count(), 1);

        let slot = reg.slot(idx);
        Registry::return_lane_rings(&slot.index, &pool);
        Registry::return_lane_rings(&slot.detail, &pool);
        reg.release_retired(idx);

        assert_eq!(pool.free_count(), free_at_start);
        assert_eq!(reg.slots_in_state(SLOT_ACTIVE).count(), 0);
        assert!(reg.register(43, &pool, 1, 2).is_ok());
    }

    #[test]
    fn pool_covers_all_slots_with_default_prefetch() {
        // 64 slots x 2 lanes x (1 active + 2 prefetch) = 384 > 254 free
        // rings, so late registrants get thinner prefetch but still an
        // active ring each.
        let t = TestFabric::new();
        let reg = t.registry();
        let pool = t.pool();
        assert!(RING_COUNT - 1 >= THREAD_SLOTS * 2);

        for i in 0..THREAD_SLOTS {
            reg.register(i as u64, &pool, 0, 2).unwrap();
        }
    }
}
