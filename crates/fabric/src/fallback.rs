//! Multi-producer writes for the global fallback ring.
//!
//! Ring handle 0 is shared by every thread that cannot use a per-thread
//! lane: orphans past the 64-slot registry, every thread while the agent is
//! in `global_only` or `dual_write`, and overflow mirroring when a lane's
//! pool refill fails. That makes it the one ring with more than one
//! producer, so the SPSC push path does not apply.
//!
//! Writes claim space by CAS on `reserve_pos`, copy their frame, then
//! publish `write_pos` in claim order: a producer whose claim starts at
//! sequence `r` waits until `write_pos == r` before storing `r + total`.
//! The wait is bounded by the memcpy of the producers immediately ahead,
//! never by the consumer, so producers still cannot block on the drain.
//! The drain consumes with the ordinary SPSC consumer path.

use crate::invariants::debug_assert_frame_aligned;
use crate::layout::{PoolHeader, FRAME_HEADER_BYTES};
use crate::record::{self, KIND_WRAP};
use crate::ring::{PushError, RingRef};
use std::sync::atomic::Ordering;

/// View of the fallback ring plus the pool counters it reports into.
#[derive(Clone, Copy)]
pub struct FallbackRing<'a> {
    ring: RingRef<'a>,
    pool_header: &'a PoolHeader,
}

impl<'a> FallbackRing<'a> {
    pub(crate) fn new(ring: RingRef<'a>, pool_header: &'a PoolHeader) -> Self {
        Self { ring, pool_header }
    }

    #[inline]
    pub fn ring(&self) -> RingRef<'a> {
        self.ring
    }

    /// Append one frame from any thread.
    ///
    /// Returns [`PushError::Full`] without waiting when the claimed region
    /// would overrun the consumer; the caller counts the drop (a producer
    /// may not move the drain's `read_pos`).
    pub fn push_frame(&self, kind: u8, payload: &[u8]) -> Result<(), PushError> {
        let capacity = self.ring.capacity();
        let mask = capacity - 1;
        let frame = record::frame_len(payload.len());
        if frame > capacity {
            return Err(PushError::Oversize);
        }

        let header = self.ring.header();
        let (claim, total, idx, wrapped) = loop {
            let r = header.reserve_pos.load(Ordering::Relaxed);
            debug_assert_frame_aligned!(r);
            let read = header.read_pos.load(Ordering::Acquire);

            let idx = (r as usize) & mask;
            let to_end = capacity - idx;
            let wrapped = to_end < frame;
            let total = if wrapped { to_end + frame } else { frame };

            // A stale read_pos only under-reports free space; the check is
            // conservative, never unsound.
            if r.wrapping_add(total as u64).wrapping_sub(read) as usize > capacity {
                return Err(PushError::Full);
            }

            if header
                .reserve_pos
                .compare_exchange_weak(
                    r,
                    r.wrapping_add(total as u64),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break (r, total as u64, idx, wrapped);
            }
        };

        if wrapped {
            let tail = capacity - idx;
            self.ring.write_header(idx, KIND_WRAP, (tail - FRAME_HEADER_BYTES) as u32);
            self.ring.write_frame_at(0, kind, payload);
        } else {
            self.ring.write_frame_at(idx, kind, payload);
        }

        // Publish in claim order: wait for the producers ahead to commit.
        let mut waited = false;
        while header.write_pos.load(Ordering::Acquire) != claim {
            waited = true;
            std::hint::spin_loop();
        }
        header.write_pos.store(claim.wrapping_add(total), Ordering::Release);

        self.pool_header.fallback_records.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.pool_header.fallback_commit_waits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Count a record this ring could not take.
    #[inline]
    pub fn count_drop(&self) {
        self.pool_header.fallback_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a thread started routing through the fallback lane.
    #[inline]
    pub fn count_activation(&self) {
        self.pool_header.fallback_activations.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{RingHeader, RING_MAGIC, RING_VERSION};
    use std::sync::atomic::Ordering;

    struct TestFallback {
        header: Box<RingHeader>,
        pool: Box<PoolHeader>,
        slab: Vec<u8>,
    }

    impl TestFallback {
        fn new(capacity: usize) -> Self {
            // SAFETY: both headers are plain ints and atomics; zero is a
            // valid initial state.
            let mut header: Box<RingHeader> = unsafe { Box::new(std::mem::zeroed()) };
            header.magic = RING_MAGIC;
            header.version = RING_VERSION;
            header.capacity = capacity as u32;
            let pool: Box<PoolHeader> = unsafe { Box::new(std::mem::zeroed()) };
            Self { header, pool, slab: vec![0; capacity] }
        }

        fn fallback(&self) -> FallbackRing<'_> {
            // SAFETY: slab lives as long as self and matches the header.
            let ring = unsafe {
                RingRef::new(&self.header, self.slab.as_ptr().cast_mut(), self.slab.len())
            };
            FallbackRing::new(ring, &self.pool)
        }
    }

    #[test]
    fn single_producer_round_trips() {
        let t = TestFallback::new(1024);
        let fb = t.fallback();

        fb.push_frame(5, b"fallback").unwrap();
        let mut seen = Vec::new();
        fb.ring().consume_frames(usize::MAX, |kind, payload| {
            seen.push((kind, payload.to_vec()));
        });
        assert_eq!(seen, vec![(5, b"fallback".to_vec())]);
        assert_eq!(t.pool.fallback_records.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rejects_when_full_without_moving_read_pos() {
        let t = TestFallback::new(64);
        let fb = t.fallback();

        fb.push_frame(1, &[0; 16]).unwrap();
        fb.push_frame(1, &[0; 16]).unwrap();
        assert_eq!(fb.push_frame(1, &[0; 16]), Err(PushError::Full));
        fb.count_drop();

        assert_eq!(t.header.read_pos.load(Ordering::Relaxed), 0);
        assert_eq!(t.pool.fallback_drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_producers_interleave_without_loss() {
        let t = TestFallback::new(1 << 16);
        let producers = 4;
        let per_producer: u32 = 5_000;

        std::thread::scope(|s| {
            for p in 0..producers {
                let fb = t.fallback();
                s.spawn(move || {
                    for i in 0..per_producer {
                        let mut payload = [0u8; 8];
                        payload[..4].copy_from_slice(&(p as u32).to_le_bytes());
                        payload[4..].copy_from_slice(&i.to_le_bytes());
                        loop {
                            if fb.push_frame(2, &payload).is_ok() {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }

            let fb = t.fallback();
            let mut next = vec![0u32; producers];
            let mut got = 0u32;
            while got < per_producer * producers as u32 {
                fb.ring().consume_frames(128, |_, payload| {
                    let p = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
                    let i = u32::from_le_bytes(payload[4..].try_into().unwrap());
                    // Per-producer order is preserved even through the
                    // shared ring.
                    assert_eq!(i, next[p]);
                    next[p] += 1;
                    got += 1;
                });
                std::hint::spin_loop();
            }
        });

        assert_eq!(
            t.pool.fallback_records.load(Ordering::Relaxed),
            u64::from(per_producer) * producers as u64
        );
    }
}
