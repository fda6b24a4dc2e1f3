//! Ring pool: layout and free list for the rings segment.
//!
//! The segment is `PoolHeader | RingHeader[N] | slab[N]`. Unowned rings sit
//! on a Treiber-style free list threaded through the headers' `next_free`
//! links; the list head packs a 32-bit tag next to the handle so a
//! concurrent pop/push cycle cannot ABA the head. Producers pop during
//! registration and one-shot refill; the drain pushes recycled rings back.

use crate::invariants::debug_assert_handle;
use crate::layout::{
    PoolHeader, RingHeader, FALLBACK_RING_HANDLE, NIL_HANDLE, RING_COUNT, RING_HEADERS_BASE,
    RING_MAGIC, RING_SLABS_BASE, RING_SLAB_BYTES, RING_VERSION,
};
use crate::fallback::FallbackRing;
use crate::ring::RingRef;
use std::sync::atomic::Ordering;

#[inline]
fn pack(handle: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(handle)
}

#[inline]
fn unpack(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

/// Borrowed view of the rings segment.
#[derive(Clone, Copy)]
pub struct RingPool<'a> {
    base: *mut u8,
    _marker: std::marker::PhantomData<&'a ()>,
}

// SAFETY: the segment is shared memory; access is governed by the atomic
// free-list head and the per-ring ownership protocol.
unsafe impl Send for RingPool<'_> {}
unsafe impl Sync for RingPool<'_> {}

impl<'a> RingPool<'a> {
    /// # Safety
    ///
    /// `base` must point to a mapped rings segment of at least
    /// [`crate::layout::RINGS_SEGMENT_BYTES`], valid for `'a`.
    pub(crate) unsafe fn from_base(base: *mut u8) -> Self {
        Self { base, _marker: std::marker::PhantomData }
    }

    #[inline]
    pub fn header(&self) -> &'a PoolHeader {
        // SAFETY: the pool header lives at offset 0 of the mapped segment
        // and the mapping outlives 'a.
        unsafe { &*self.base.cast::<PoolHeader>() }
    }

    #[inline]
    pub fn ring_header(&self, handle: u32) -> &'a RingHeader {
        debug_assert_handle!(handle);
        // SAFETY: handle < RING_COUNT by the debug assert and every caller
        // contract; the header array starts at RING_HEADERS_BASE.
        unsafe {
            &*self
                .base
                .add(RING_HEADERS_BASE + handle as usize * std::mem::size_of::<RingHeader>())
                .cast::<RingHeader>()
        }
    }

    /// Ring view for a handle.
    #[inline]
    pub fn ring(&self, handle: u32) -> RingRef<'a> {
        let header = self.ring_header(handle);
        // SAFETY: the slab for this handle spans RING_SLAB_BYTES starting
        // at RING_SLABS_BASE + handle * RING_SLAB_BYTES, inside the mapping.
        unsafe {
            RingRef::new(
                header,
                self.base.add(RING_SLABS_BASE + handle as usize * RING_SLAB_BYTES),
                RING_SLAB_BYTES,
            )
        }
    }

    /// The shared multi-producer fallback ring.
    #[inline]
    pub fn fallback(&self) -> FallbackRing<'a> {
        FallbackRing::new(self.ring(FALLBACK_RING_HANDLE), self.header())
    }

    /// Creator-side layout: write ring headers and seed the free list with
    /// every ring except the fallback. The segment arrives zeroed.
    pub(crate) fn init_layout(&self) {
        // SAFETY: single-threaded creator init before `initialized` is
        // published; plain field writes through the shared mapping.
        unsafe {
            let pool_mut = self.base.cast::<PoolHeader>();
            (*pool_mut).ring_count = RING_COUNT as u32;
        }
        let pool = self.header();
        pool.free_head.store(pack(NIL_HANDLE, 0), Ordering::Relaxed);

        for handle in 0..RING_COUNT as u32 {
            // SAFETY: in-bounds header slot, creator-exclusive at this point.
            unsafe {
                let h = self
                    .base
                    .add(RING_HEADERS_BASE + handle as usize * std::mem::size_of::<RingHeader>())
                    .cast::<RingHeader>();
                (*h).magic = RING_MAGIC;
                (*h).version = RING_VERSION;
                (*h).capacity = RING_SLAB_BYTES as u32;
            }
            self.ring_header(handle).next_free.store(NIL_HANDLE, Ordering::Relaxed);
        }

        for handle in (1..RING_COUNT as u32).rev() {
            self.push_free(handle);
        }
    }

    /// Pop a free ring. Lock-free; called by registering/refilling
    /// producers and by the controller.
    pub fn pop_free(&self) -> Option<u32> {
        let pool = self.header();
        loop {
            let head = pool.free_head.load(Ordering::Acquire);
            let (handle, tag) = unpack(head);
            if handle == NIL_HANDLE {
                return None;
            }
            let next = self.ring_header(handle).next_free.load(Ordering::Relaxed);
            if pool
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(next, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                pool.free_count.fetch_sub(1, Ordering::Relaxed);
                self.ring_header(handle).producer_epoch.fetch_add(1, Ordering::Relaxed);
                return Some(handle);
            }
        }
    }

    /// Return a recycled ring to the free list.
    pub fn push_free(&self, handle: u32) {
        debug_assert_handle!(handle);
        debug_assert_ne!(handle, FALLBACK_RING_HANDLE);
        let pool = self.header();
        loop {
            let head = pool.free_head.load(Ordering::Acquire);
            let (top, tag) = unpack(head);
            self.ring_header(handle).next_free.store(top, Ordering::Relaxed);
            if pool
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(handle, tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                pool.free_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Free rings currently on the global list (racy snapshot).
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.header().free_count.load(Ordering::Relaxed)
    }
}
