//! Session fabric: the three named segments as one unit.
//!
//! The controller creates all three segments, lays out the pool and the
//! control block, then release-publishes `initialized`. The agent opens
//! the control segment, spin-waits for `initialized` under a timeout,
//! validates magic and version, and only then maps the registry and rings
//! segments. Destruction (unmap + unlink) is controller-only.

use crate::backoff::Backoff;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::layout::{
    ControlBlock, CONTROL_MAGIC, CONTROL_SEGMENT_BYTES, FABRIC_VERSION, REGISTRY_SEGMENT_BYTES,
    RINGS_SEGMENT_BYTES, RING_COUNT, RING_SLAB_BYTES, SLOT_STRIDE, THREAD_SLOTS,
};
use crate::pool::RingPool;
use crate::registry::Registry;
use crate::segment::ShmSegment;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Identity of one tracing session: the traced process and a controller-
/// chosen discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub host_pid: u32,
    pub session_id: u32,
}

/// The three segments of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Control,
    Registry,
    Rings,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 3] = [SegmentKind::Control, SegmentKind::Registry, SegmentKind::Rings];

    fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Control => "control",
            SegmentKind::Registry => "registry",
            SegmentKind::Rings => "rings",
        }
    }

    fn byte_len(self) -> usize {
        match self {
            SegmentKind::Control => CONTROL_SEGMENT_BYTES,
            SegmentKind::Registry => REGISTRY_SEGMENT_BYTES,
            SegmentKind::Rings => RINGS_SEGMENT_BYTES,
        }
    }
}

impl SessionId {
    /// `/ada_shm_<kind>_<host_pid>_<session_id>`
    pub fn segment_name(&self, kind: SegmentKind) -> String {
        format!("/ada_shm_{}_{}_{}", kind.as_str(), self.host_pid, self.session_id)
    }
}

/// Which side of the fabric this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the segments; unlinks them on destroy/drop.
    Controller,
    /// Attached to existing segments; never unlinks.
    Agent,
}

/// One mapped session: control block, registry, and ring pool.
pub struct Fabric {
    session: SessionId,
    role: Role,
    control_seg: ShmSegment,
    registry_seg: ShmSegment,
    rings_seg: ShmSegment,
}

impl Fabric {
    /// Controller side: create and initialize all three segments.
    ///
    /// Fails with [`FabricError::SegmentExists`] if any name is taken,
    /// leaving no partial mapping behind.
    pub fn create(session: SessionId) -> Result<Self> {
        // Probe all names up front so a half-dead previous session is
        // reported before anything is created.
        for kind in SegmentKind::ALL {
            let name = session.segment_name(kind);
            if ShmSegment::exists(&name) {
                return Err(FabricError::SegmentExists { name });
            }
        }

        let control_seg = Self::create_one(session, SegmentKind::Control, &[])?;
        let registry_seg =
            Self::create_one(session, SegmentKind::Registry, &[SegmentKind::Control])?;
        let rings_seg = Self::create_one(
            session,
            SegmentKind::Rings,
            &[SegmentKind::Control, SegmentKind::Registry],
        )?;

        let fabric = Self { session, role: Role::Controller, control_seg, registry_seg, rings_seg };

        fabric.pool().init_layout();

        // SAFETY: creator-exclusive plain-field init; nothing else can
        // have mapped the segment because every name was fresh above.
        unsafe {
            let c = fabric.control_seg.as_ptr().cast::<ControlBlock>();
            (*c).host_pid = session.host_pid;
            (*c).session_id = session.session_id;
            (*c).registry_base = 0;
            (*c).ring_pool_base = 0;
            (*c).slot_count = THREAD_SLOTS as u32;
            (*c).slot_stride = SLOT_STRIDE as u32;
            (*c).ring_count = RING_COUNT as u32;
            (*c).ring_slab_bytes = RING_SLAB_BYTES as u32;
        }
        let control = fabric.control();
        control.magic.store(CONTROL_MAGIC, Ordering::Relaxed);
        control.version.store(FABRIC_VERSION, Ordering::Relaxed);
        control.registry_version.store(1, Ordering::Relaxed);
        // Everything above becomes visible to attachers with this publish.
        control.initialized.store(1, Ordering::Release);

        log::info!(
            "created fabric session pid={} id={}",
            session.host_pid,
            session.session_id
        );
        Ok(fabric)
    }

    fn create_one(
        session: SessionId,
        kind: SegmentKind,
        created_so_far: &[SegmentKind],
    ) -> Result<ShmSegment> {
        match ShmSegment::create(&session.segment_name(kind), kind.byte_len()) {
            Ok(seg) => Ok(seg),
            Err(e) => {
                // Roll back what this call already created.
                for &done in created_so_far {
                    let _ = ShmSegment::unlink(&session.segment_name(done));
                }
                Err(e)
            }
        }
    }

    /// Agent side: open the segments and wait for the controller's
    /// `initialized` publish.
    pub fn attach(session: SessionId, config: &FabricConfig) -> Result<Self> {
        let control_seg =
            ShmSegment::open(&session.segment_name(SegmentKind::Control), CONTROL_SEGMENT_BYTES)?;
        // SAFETY: the control block sits at offset 0 of a mapping at least
        // CONTROL_SEGMENT_BYTES long.
        let control = unsafe { &*control_seg.as_ptr().cast::<ControlBlock>() };

        let deadline = Instant::now() + config.attach_timeout;
        let mut backoff = Backoff::new();
        loop {
            if control.initialized.load(Ordering::Acquire) == 1 {
                break;
            }
            // A nonzero wrong magic means this is not our segment at all;
            // fail fast instead of burning the whole timeout.
            let magic = control.magic.load(Ordering::Acquire);
            if magic != 0 && magic != CONTROL_MAGIC {
                return Err(FabricError::MagicMismatch { found: magic });
            }
            if Instant::now() >= deadline {
                return Err(FabricError::InitTimeout {
                    timeout_ms: config.attach_timeout.as_millis() as u64,
                });
            }
            if backoff.exhausted() {
                std::thread::sleep(config.attach_poll);
            } else {
                backoff.wait();
            }
        }

        let magic = control.magic.load(Ordering::Acquire);
        if magic != CONTROL_MAGIC {
            return Err(FabricError::MagicMismatch { found: magic });
        }
        let version = control.version.load(Ordering::Acquire);
        if version != FABRIC_VERSION {
            return Err(FabricError::VersionMismatch { expected: FABRIC_VERSION, found: version });
        }
        // The geometry fields are frozen; a disagreement means the peer
        // was built against a different layout revision even though the
        // version word matches.
        let geometry = [
            ("slot_count", THREAD_SLOTS as u32, control.slot_count),
            ("slot_stride", SLOT_STRIDE as u32, control.slot_stride),
            ("ring_count", RING_COUNT as u32, control.ring_count),
            ("ring_slab_bytes", RING_SLAB_BYTES as u32, control.ring_slab_bytes),
        ];
        for (field, expected, found) in geometry {
            if found != expected {
                return Err(FabricError::GeometryMismatch { field, expected, found });
            }
        }

        let registry_seg = ShmSegment::open(
            &session.segment_name(SegmentKind::Registry),
            REGISTRY_SEGMENT_BYTES,
        )?;
        let rings_seg =
            ShmSegment::open(&session.segment_name(SegmentKind::Rings), RINGS_SEGMENT_BYTES)?;

        log::debug!(
            "attached fabric session pid={} id={}",
            session.host_pid,
            session.session_id
        );
        Ok(Self { session, role: Role::Agent, control_seg, registry_seg, rings_seg })
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The shared control block.
    #[inline]
    pub fn control(&self) -> &ControlBlock {
        // SAFETY: offset 0 of a mapping at least CONTROL_SEGMENT_BYTES
        // long, alive as long as self.
        unsafe { &*self.control_seg.as_ptr().cast::<ControlBlock>() }
    }

    /// View of the registry segment.
    #[inline]
    pub fn registry(&self) -> Registry<'_> {
        // SAFETY: full registry segment mapping, alive as long as self.
        unsafe { Registry::from_base(self.registry_seg.as_ptr()) }
    }

    /// View of the rings segment.
    #[inline]
    pub fn pool(&self) -> RingPool<'_> {
        // SAFETY: full rings segment mapping, alive as long as self.
        unsafe { RingPool::from_base(self.rings_seg.as_ptr()) }
    }

    /// Unmap and, on the controller, unlink all three segments.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        if self.role == Role::Controller {
            for kind in SegmentKind::ALL {
                let _ = ShmSegment::unlink(&self.session.segment_name(kind));
            }
            log::info!(
                "destroyed fabric session pid={} id={}",
                self.session.host_pid,
                self.session.session_id
            );
        }
    }
}
