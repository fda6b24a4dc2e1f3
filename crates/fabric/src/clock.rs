//! Monotonic timestamps shared across process boundaries.
//!
//! `std::time::Instant` is opaque and process-local, so it cannot be stored
//! in a shared segment and compared by the peer. Both sides read
//! `CLOCK_MONOTONIC` directly instead; on the same host the values are
//! directly comparable.

/// Nanoseconds on the monotonic clock.
#[inline]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec and CLOCK_MONOTONIC is a
    // supported clock id on every target we build for. clock_gettime only
    // writes through the provided pointer.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}
