//! Shared-memory wire layout.
//!
//! Everything in this module is part of the cross-process contract: the
//! `repr(C)` structs below live at fixed offsets inside the three segments
//! and are accessed concurrently by the traced process and the controller.
//! Field order, sizes, and the magic/version constants must not change
//! without bumping [`FABRIC_VERSION`].
//!
//! # Segment map
//!
//! ```text
//! control  (4 KiB)   ControlBlock at offset 0, rest reserved
//! registry (64 KiB)  ThreadLaneSet[64], 1 KiB stride
//! rings    (16 MiB)  PoolHeader | RingHeader[255] | 64 KiB slab x 255
//! ```
//!
//! Cross-process references are integer ring handles (indices into the
//! header/slab arrays) and slot indices; the segments contain no pointers.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Control block magic.
pub const CONTROL_MAGIC: u32 = 0xADA5_F7C1;
/// Layout version. A mismatch at attach is fatal and non-retryable.
pub const FABRIC_VERSION: u32 = 1;
/// Per-ring magic.
pub const RING_MAGIC: u16 = 0xADA0;
/// Per-ring layout version.
pub const RING_VERSION: u16 = 1;

/// Size of the control segment.
pub const CONTROL_SEGMENT_BYTES: usize = 4096;
/// Size of the registry segment.
pub const REGISTRY_SEGMENT_BYTES: usize = 64 * 1024;
/// Size of the rings segment.
pub const RINGS_SEGMENT_BYTES: usize = 16 * 1024 * 1024;

/// Fixed number of thread registry slots.
pub const THREAD_SLOTS: usize = 64;

/// Number of rings carved out of the rings segment. Sized so that all 64
/// registry slots can hold an active ring plus two prefetched spares on
/// both lanes (384 rings) with headroom left for rotation.
pub const RING_COUNT: usize = 508;
/// Bytes of record storage per ring.
///
/// This is also the floor on how much pre-roll a persistence window can
/// retain: pre-roll frames survive as long as they fit in one slab, and
/// drop-oldest may trim the oldest of them under overload.
pub const RING_SLAB_BYTES: usize = 32 * 1024;
/// Offset of the ring header array within the rings segment.
pub const RING_HEADERS_BASE: usize = 64;
/// Offset of the first slab within the rings segment.
pub const RING_SLABS_BASE: usize = 128 * 1024;

/// Handle of the global fallback ring. Never enters the free list.
pub const FALLBACK_RING_HANDLE: u32 = 0;
/// Sentinel for "no ring".
pub const NIL_HANDLE: u32 = u32::MAX;

/// Capacity of each per-lane submit/free handle queue.
pub const HANDLE_QUEUE_CAPACITY: usize = 8;

/// Frame header bytes: u32 little-endian payload length, u8 kind, 3 reserved.
pub const FRAME_HEADER_BYTES: usize = 8;
/// Frames are padded to this granule so a header never straddles the slab
/// end and positions stay header-aligned.
pub const FRAME_ALIGN: usize = 8;

/// Registry mode word values (mirrors [`crate::mode::AgentMode`]).
pub const MODE_GLOBAL_ONLY: u32 = 0;
pub const MODE_DUAL_WRITE: u32 = 1;
pub const MODE_PER_THREAD_ONLY: u32 = 2;

/// Slot lifecycle states for `ThreadLaneSet::active`.
pub const SLOT_FREE: u32 = 0;
pub const SLOT_CLAIMING: u32 = 1;
pub const SLOT_ACTIVE: u32 = 2;
pub const SLOT_RETIRED: u32 = 3;

// =============================================================================
// Control block
// =============================================================================

/// Single instance at offset 0 of the control segment.
///
/// The first cache line is frozen once `initialized` is published with
/// release ordering; readers must acquire `initialized` before trusting it.
/// The aggregate counters are drain-written; the one agent-written word is
/// `agent_attached` (the ready signal).
#[repr(C, align(64))]
pub struct ControlBlock {
    // --- frozen after initialized=1 ---
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub host_pid: u32,
    pub session_id: u32,
    /// Offset of the slot array within the registry segment.
    pub registry_base: u64,
    /// Offset of the pool header within the rings segment.
    pub ring_pool_base: u64,
    pub slot_count: u32,
    pub slot_stride: u32,
    pub ring_count: u32,
    pub ring_slab_bytes: u32,
    _pad0: [u8; 16],

    // --- coordination words ---
    pub initialized: AtomicU32,
    pub agent_attached: AtomicU32,
    pub shutdown_requested: AtomicU32,
    pub registry_ready: AtomicU32,
    pub registry_version: AtomicU32,
    /// Agent-published current mode, for controller observability.
    pub registry_mode: AtomicU32,
    _pad1: [u8; 8],
    pub registry_epoch: AtomicU64,
    pub drain_heartbeat_ns: AtomicU64,
    _pad2: [u8; 16],

    // --- aggregates (drain-written; reclaimed slot counters fold in here) ---
    pub events_captured: AtomicU64,
    pub events_dropped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub rings_drained: AtomicU64,
    pub drain_cycles: AtomicU64,
    pub drain_idle_cycles: AtomicU64,
    pub final_drains: AtomicU64,
    _pad3: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() == 192);
const _: () = assert!(std::mem::size_of::<ControlBlock>() <= CONTROL_SEGMENT_BYTES);

// =============================================================================
// Ring header
// =============================================================================

/// Per-ring header in the rings segment.
///
/// `write_pos`/`read_pos` are monotonic byte sequences for the current
/// producer/consumer pairing; they are reset together when the drain
/// recycles the ring, and the epoch words record how many pairings the ring
/// has served. `reserve_pos` is used only by the multi-producer fallback
/// ring and stays zero on SPSC rings.
#[repr(C)]
pub struct RingHeader {
    pub magic: u16,
    pub version: u16,
    pub capacity: u32,
    /// Free-list link (pool-internal).
    pub next_free: AtomicU32,
    pub producer_epoch: AtomicU32,
    pub consumer_epoch: AtomicU32,
    _pad0: [u8; 44],

    /// Published byte sequence (written by producer, read by consumer).
    pub write_pos: AtomicU64,
    _pad1: [u8; 56],

    /// Consumed byte sequence (written by consumer, read by producer).
    pub read_pos: AtomicU64,
    _pad2: [u8; 56],

    /// Claimed byte sequence for multi-producer reservation (fallback only).
    pub reserve_pos: AtomicU64,
    _pad3: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 256);
const _: () =
    assert!(RING_HEADERS_BASE + RING_COUNT * std::mem::size_of::<RingHeader>() <= RING_SLABS_BASE);
const _: () = assert!(RING_SLABS_BASE + RING_COUNT * RING_SLAB_BYTES <= RINGS_SEGMENT_BYTES);
const _: () = assert!(RING_SLAB_BYTES.is_power_of_two());

// =============================================================================
// Pool header
// =============================================================================

/// Header at offset 0 of the rings segment.
///
/// Carries the global free list and the fallback-lane counters. Fallback
/// counters live here rather than in the control block because producers
/// may not write the control block.
#[repr(C, align(64))]
pub struct PoolHeader {
    /// Packed free-list head: tag in the high 32 bits, ring handle in the
    /// low 32 (tag defeats ABA on concurrent pop).
    pub free_head: AtomicU64,
    pub free_count: AtomicU32,
    pub ring_count: u32,
    pub fallback_activations: AtomicU64,
    pub fallback_drops: AtomicU64,
    pub fallback_records: AtomicU64,
    pub fallback_commit_waits: AtomicU64,
    _pad: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == 64);
const _: () = assert!(std::mem::size_of::<PoolHeader>() <= RING_HEADERS_BASE);

// =============================================================================
// Handle queue
// =============================================================================

/// SPSC queue of ring handles (submit: producer→drain, free: drain→producer).
///
/// Positions are free-running u32 sequences indexed modulo the capacity;
/// `write_pos - read_pos <= capacity` always. Capacity is the compile-time
/// [`HANDLE_QUEUE_CAPACITY`]; it is not stored per queue.
#[repr(C)]
pub struct HandleQueue {
    pub write_pos: AtomicU32,
    _pad0: [u8; 60],
    pub read_pos: AtomicU32,
    _pad1: [u8; 60],
    pub slots: [AtomicU32; HANDLE_QUEUE_CAPACITY],
    _pad2: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<HandleQueue>() == 192);
const _: () = assert!(HANDLE_QUEUE_CAPACITY.is_power_of_two());

// =============================================================================
// Lane and slot
// =============================================================================

/// One directional stream (index or detail) for one registered thread.
///
/// The owning thread is the only writer of `active_ring`, the counters, and
/// the `submit` queue's producer side; the drain is the only writer of the
/// `free` queue's producer side.
#[repr(C)]
pub struct Lane {
    pub active_ring: AtomicU32,
    _res: [u8; 4],
    pub events: AtomicU64,
    pub bytes: AtomicU64,
    pub rings_submitted: AtomicU64,
    pub drops_ring_full: AtomicU64,
    pub drops_pool_exhausted: AtomicU64,
    pub overflow_mirrored: AtomicU64,
    _pad0: [u8; 8],
    pub submit: HandleQueue,
    pub free: HandleQueue,
}

const _: () = assert!(std::mem::size_of::<Lane>() == 448);

/// One registry slot: identity plus the two lanes.
///
/// `active` is the lifecycle word: Free → Claiming (CAS by the registering
/// thread) → Active (release-published after lane init) → Retired (agent
/// abandons it on epoch change) → Free (drain reclaims).
#[repr(C, align(64))]
pub struct ThreadLaneSet {
    pub active: AtomicU32,
    pub slot_id: AtomicU32,
    pub thread_id: AtomicU64,
    pub registered_at_ns: AtomicU64,
    /// Registry epoch this slot was claimed under.
    pub epoch: AtomicU64,
    pub events_emitted: AtomicU64,
    /// Detail probes that matched the marking policy.
    pub marks_seen: AtomicU64,
    pub windows_dumped: AtomicU64,
    pub windows_discarded: AtomicU64,
    pub index: Lane,
    pub detail: Lane,
    _pad1: [u8; 64],
}

pub const SLOT_STRIDE: usize = 1024;
const _: () = assert!(std::mem::size_of::<ThreadLaneSet>() == SLOT_STRIDE);
const _: () = assert!(THREAD_SLOTS * SLOT_STRIDE == REGISTRY_SEGMENT_BYTES);

/// Which lane of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    /// Always-on call/return stream.
    Index,
    /// Register/stack payload stream, persisted only in marked windows.
    Detail,
}

impl LaneKind {
    pub const ALL: [LaneKind; 2] = [LaneKind::Index, LaneKind::Detail];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            LaneKind::Index => "index",
            LaneKind::Detail => "detail",
        }
    }
}

impl ThreadLaneSet {
    /// Lane accessor by kind.
    #[inline]
    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::Index => &self.index,
            LaneKind::Detail => &self.detail,
        }
    }
}
