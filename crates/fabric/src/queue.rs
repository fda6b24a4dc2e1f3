//! Operations on the in-segment SPSC handle queues.
//!
//! A [`HandleQueue`] ferries ring handles one way: `submit` from the owning
//! thread to the drain, `free` from the drain back to the thread. Positions
//! are free-running u32 sequences; slots are indexed modulo the fixed
//! capacity. The producer side publishes a slot with a Release store of
//! `write_pos`; the consumer acquires it and publishes consumption with a
//! Release store of `read_pos`.

use crate::invariants::{debug_assert_bounded_span, debug_assert_handle};
use crate::layout::{HandleQueue, HANDLE_QUEUE_CAPACITY};
use std::sync::atomic::Ordering;

const MASK: u32 = HANDLE_QUEUE_CAPACITY as u32 - 1;

impl HandleQueue {
    /// Reset to empty. Only legal while no peer is using the queue
    /// (slot claim or drain reclaim).
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Release);
    }

    /// Producer side: enqueue a handle. Returns it back on a full queue.
    pub fn push(&self, handle: u32) -> Result<(), u32> {
        debug_assert_handle!(handle);
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= HANDLE_QUEUE_CAPACITY as u32 {
            return Err(handle);
        }
        self.slots[(w & MASK) as usize].store(handle, Ordering::Relaxed);
        debug_assert_bounded_span!(
            w.wrapping_add(1).wrapping_sub(r),
            HANDLE_QUEUE_CAPACITY as u32
        );
        self.write_pos.store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: dequeue a handle.
    pub fn pop(&self) -> Option<u32> {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        if r == w {
            return None;
        }
        let handle = self.slots[(r & MASK) as usize].load(Ordering::Relaxed);
        debug_assert_handle!(handle);
        self.read_pos.store(r.wrapping_add(1), Ordering::Release);
        Some(handle)
    }

    /// Entries currently queued (racy snapshot; exact for the two owners).
    #[inline]
    pub fn len(&self) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Relaxed);
        w.wrapping_sub(r) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
