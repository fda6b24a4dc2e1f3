//! Error taxonomy for fabric operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while creating, attaching, or operating on the
/// shared-memory fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    /// A segment with this name already exists. A previous session was not
    /// cleaned up; the caller should remediate (unlink or pick a new
    /// session id) before retrying.
    #[error("shared memory segment already exists: {name}")]
    SegmentExists { name: String },

    /// The segment does not exist yet. Retryable while the controller is
    /// still coming up.
    #[error("shared memory segment missing: {name}")]
    SegmentMissing { name: String },

    /// The control block carries an incompatible layout version.
    #[error("fabric version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The control block magic does not identify a fabric segment.
    #[error("fabric magic mismatch: found {found:#010x}")]
    MagicMismatch { found: u32 },

    /// The control block's frozen geometry disagrees with this build's
    /// layout constants: the peer was built against a different layout
    /// revision even though the version field matches.
    #[error("fabric geometry mismatch: {field} is {found}, expected {expected}")]
    GeometryMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },

    /// The controller did not publish `initialized` within the attach
    /// timeout.
    #[error("control block not initialized within {timeout_ms} ms")]
    InitTimeout { timeout_ms: u64 },

    /// All registry slots are taken; the calling thread must route to the
    /// global fallback lane.
    #[error("thread registry full ({slots} slots)")]
    RegistryFull { slots: usize },

    /// The active ring cannot hold the record.
    #[error("ring buffer full")]
    RingFull,

    /// No free ring could be pulled from the pool.
    #[error("ring pool exhausted")]
    PoolExhausted,

    /// The external writer rejected a drained ring. Fatal for the session.
    #[error("trace writer failed: {reason}")]
    WriterFailure { reason: String },

    /// A marking-policy pattern was rejected at construction.
    #[error("invalid pattern at index {index}: {reason}")]
    InvalidPattern { index: usize, reason: String },

    /// The agent entry point was called twice.
    #[error("already initialized")]
    AlreadyInitialized,

    /// An operation requires an initialized fabric.
    #[error("not initialized")]
    NotInitialized,

    /// A shared-memory syscall failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl FabricError {
    /// Returns `true` if the caller may retry the operation after a delay
    /// (the controller may simply not be up yet).
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SegmentMissing { .. } | Self::InitTimeout { .. })
    }

    /// Returns `true` if this error ends the session: no amount of
    /// retrying or backpressure will recover it.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. }
                | Self::MagicMismatch { .. }
                | Self::GeometryMismatch { .. }
                | Self::WriterFailure { .. }
        )
    }
}

/// Result alias for fabric operations.
pub type Result<T> = std::result::Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FabricError::SegmentMissing { name: "/x".into() }.is_retryable());
        assert!(FabricError::InitTimeout { timeout_ms: 5000 }.is_retryable());
        assert!(!FabricError::RingFull.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(FabricError::VersionMismatch { expected: 1, found: 2 }.is_fatal());
        assert!(FabricError::MagicMismatch { found: 0 }.is_fatal());
        let geometry =
            FabricError::GeometryMismatch { field: "ring_count", expected: 508, found: 256 };
        assert!(geometry.is_fatal());
        assert!(!geometry.is_retryable());
        assert!(!FabricError::PoolExhausted.is_fatal());
    }
}
