//! POSIX shared memory segments.
//!
//! Safe wrappers over `shm_open`/`ftruncate`/`mmap` for the three session
//! segments. Creation is exclusive: an existing name is surfaced as
//! [`FabricError::SegmentExists`] so the caller can remediate a leftover
//! session instead of silently reusing it. Mappings are unmapped on drop;
//! unlinking is a separate, controller-only step.

use crate::error::{FabricError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory segment.
///
/// Dropping unmaps the region. The name is kept so the creator can unlink
/// during destroy.
#[derive(Debug)]
pub struct ShmSegment {
    ptr: *mut u8,
    len: usize,
    name: String,
}

// SAFETY: the mapping is plain shared memory; all concurrent access goes
// through the atomic fields of the repr(C) structs laid out in it.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| FabricError::Os {
        op: "shm name",
        source: io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL in segment name"),
    })
}

impl ShmSegment {
    /// Create a new segment with `O_CREAT | O_EXCL`, size it, map it, and
    /// zero it.
    ///
    /// Fails with [`FabricError::SegmentExists`] when the name is taken.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: cname is a valid NUL-terminated string; O_EXCL makes the
        // call fail rather than clobber an existing segment; 0o600 keeps
        // the segment private to the owning user.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(FabricError::SegmentExists { name: name.to_string() });
            }
            return Err(FabricError::Os { op: "shm_open(create)", source: err });
        }

        // SAFETY: fd came from the successful shm_open above.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(FabricError::Os { op: "ftruncate", source: err });
        }

        let ptr = Self::map(fd, len);
        // SAFETY: the mapping (if any) holds its own reference; fd is not
        // used again either way.
        unsafe { libc::close(fd) };

        let ptr = match ptr {
            Ok(p) => p,
            Err(err) => {
                // SAFETY: cname is valid; best-effort cleanup of the
                // half-created segment.
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                return Err(err);
            }
        };

        // SAFETY: ptr spans exactly len writable bytes and nothing else
        // references the brand-new segment yet.
        unsafe { ptr::write_bytes(ptr, 0, len) };

        Ok(Self { ptr, len, name: name.to_string() })
    }

    /// Open and map an existing segment.
    ///
    /// A missing name is [`FabricError::SegmentMissing`] (retryable while
    /// the controller comes up).
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let cname = c_name(name)?;

        // SAFETY: cname is a valid NUL-terminated string; no O_CREAT, so
        // this never materializes a segment.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(FabricError::SegmentMissing { name: name.to_string() });
            }
            return Err(FabricError::Os { op: "shm_open(open)", source: err });
        }

        let ptr = Self::map(fd, len);
        // SAFETY: as in create, the mapping holds its own reference.
        unsafe { libc::close(fd) };

        Ok(Self { ptr: ptr?, len, name: name.to_string() })
    }

    fn map(fd: libc::c_int, len: usize) -> Result<*mut u8> {
        // SAFETY: fd is a valid shm descriptor; MAP_SHARED with
        // PROT_READ|PROT_WRITE over [0, len) is exactly the region both
        // processes agreed on; the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FabricError::Os { op: "mmap", source: io::Error::last_os_error() });
        }
        Ok(ptr.cast())
    }

    /// Remove the name. Idempotent: a missing segment is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = c_name(name)?;
        // SAFETY: cname is valid; shm_unlink only touches the namespace.
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(FabricError::Os { op: "shm_unlink", source: err });
            }
        }
        Ok(())
    }

    /// True if a segment with this name currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(cname) = c_name(name) else { return false };
        // SAFETY: read-only open as a pure existence probe.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and unused afterwards.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from the successful mmap in create/open and
        // Drop runs once. Unlinking is the creator's explicit job.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// Unlink every `ada_shm_*` segment under `/dev/shm` whose creating process
/// is gone. Returns the number of names removed.
///
/// Intended for controller startup, to sweep the debris of crashed
/// sessions before `create` runs into [`FabricError::SegmentExists`].
pub fn cleanup_stale_sessions() -> usize {
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    let mut cleaned = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };
        if !name.starts_with("ada_shm_") {
            continue;
        }
        // Segment names encode the creating pid as the second-to-last
        // underscore field; a dead pid marks the whole session stale.
        let Some(pid) = parse_host_pid(name) else { continue };
        if pid_alive(pid) {
            continue;
        }
        let full = format!("/{name}");
        if ShmSegment::unlink(&full).is_ok() {
            log::debug!("removed stale segment {full}");
            cleaned += 1;
        }
    }
    cleaned
}

fn parse_host_pid(name: &str) -> Option<u32> {
    let mut fields = name.rsplitn(3, '_');
    let _session = fields.next()?;
    fields.next()?.parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs a liveness/permission probe only.
    (unsafe { libc::kill(pid as libc::pid_t, 0) == 0 })
        || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/ada_shm_test_{tag}_{}_{ts}", std::process::id())
    }

    #[test]
    fn create_then_open_shares_bytes() {
        let name = unique_name("share");
        let a = ShmSegment::create(&name, 4096).expect("create");

        // SAFETY: the segment is 4096 bytes; offsets 0..8 are in bounds.
        unsafe {
            a.as_ptr().write(0xA5);
            a.as_ptr().add(7).write(0x5A);
        }

        let b = ShmSegment::open(&name, 4096).expect("open");
        // SAFETY: same bounds, written above through the other mapping.
        unsafe {
            assert_eq!(b.as_ptr().read(), 0xA5);
            assert_eq!(b.as_ptr().add(7).read(), 0x5A);
        }

        drop(a);
        drop(b);
        ShmSegment::unlink(&name).unwrap();
    }

    #[test]
    fn exclusive_create_rejects_existing() {
        let name = unique_name("excl");
        let _a = ShmSegment::create(&name, 4096).expect("create");
        match ShmSegment::create(&name, 4096) {
            Err(FabricError::SegmentExists { name: n }) => assert_eq!(n, name),
            other => panic!("expected SegmentExists, got {other:?}"),
        }
        ShmSegment::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_is_retryable() {
        let err = ShmSegment::open("/ada_shm_test_missing_0_0", 4096).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn create_is_zeroed() {
        let name = unique_name("zero");
        let seg = ShmSegment::create(&name, 4096).expect("create");
        // SAFETY: fully in-bounds read of the fresh mapping.
        let all_zero = unsafe {
            std::slice::from_raw_parts(seg.as_ptr(), seg.len()).iter().all(|&b| b == 0)
        };
        assert!(all_zero);
        ShmSegment::unlink(&name).unwrap();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name("unlink");
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn stale_pid_parsing() {
        assert_eq!(parse_host_pid("ada_shm_control_1234_7"), Some(1234));
        assert_eq!(parse_host_pid("ada_shm_rings_99_3"), Some(99));
        assert_eq!(parse_host_pid("ada_shm_x"), None);
    }
}
