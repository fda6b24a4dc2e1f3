//! Trace writers: where drained rings go.
//!
//! The drain hands every ring to a [`TraceWriter`] as a canonical frame
//! stream (length-prefixed records, wrap markers already removed) plus the
//! ring's metadata. A writer failure is fatal for the session: the drain
//! reports it once and requests shutdown.

use ada_fabric::LaneKind;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors a writer can surface. All of them end the session.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Where a drained ring came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingSource {
    /// A per-thread lane.
    Lane { slot_id: u32, thread_id: u64, lane: LaneKind },
    /// The shared global fallback ring.
    Fallback,
}

/// Metadata accompanying one drained ring.
#[derive(Debug, Clone, Copy)]
pub struct RingMeta {
    pub source: RingSource,
    pub ring_handle: u32,
    /// Records in this hand-off.
    pub records: u64,
    /// Frame-stream bytes in this hand-off.
    pub bytes: u64,
    /// Drain-global hand-off sequence; total order across the session.
    pub sequence: u64,
}

/// Consumer of drained rings.
pub trait TraceWriter: Send {
    /// Take one ring's frame stream. An error ends the session.
    fn accept(&mut self, meta: &RingMeta, frames: &[u8]) -> Result<(), WriterError>;

    /// Flush buffered output; called once after the final drain.
    fn flush(&mut self) -> Result<(), WriterError> {
        Ok(())
    }
}

// =============================================================================
// Stock writers
// =============================================================================

/// Discards everything (benchmarks and stall tests).
#[derive(Debug, Default)]
pub struct NullWriter;

impl TraceWriter for NullWriter {
    fn accept(&mut self, _meta: &RingMeta, _frames: &[u8]) -> Result<(), WriterError> {
        Ok(())
    }
}

/// Length-framed binary lane files: `index.lane`, `detail.lane`, and
/// `fallback.lane` under one directory.
///
/// Block format: u32 frame-stream length, u32 slot id (`!0` for the
/// fallback), u64 thread id, u64 record count, then the frame stream.
pub struct FileWriter {
    dir: PathBuf,
    index: BufWriter<File>,
    detail: BufWriter<File>,
    fallback: BufWriter<File>,
}

impl FileWriter {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, WriterError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let open = |name: &str| -> Result<BufWriter<File>, WriterError> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        Ok(Self {
            index: open("index.lane")?,
            detail: open("detail.lane")?,
            fallback: open("fallback.lane")?,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sink(&mut self, source: RingSource) -> &mut BufWriter<File> {
        match source {
            RingSource::Lane { lane: LaneKind::Index, .. } => &mut self.index,
            RingSource::Lane { lane: LaneKind::Detail, .. } => &mut self.detail,
            RingSource::Fallback => &mut self.fallback,
        }
    }
}

impl TraceWriter for FileWriter {
    fn accept(&mut self, meta: &RingMeta, frames: &[u8]) -> Result<(), WriterError> {
        let (slot_id, thread_id) = match meta.source {
            RingSource::Lane { slot_id, thread_id, .. } => (slot_id, thread_id),
            RingSource::Fallback => (u32::MAX, 0),
        };
        let records = meta.records;
        let sink = self.sink(meta.source);
        sink.write_all(&(frames.len() as u32).to_le_bytes())?;
        sink.write_all(&slot_id.to_le_bytes())?;
        sink.write_all(&thread_id.to_le_bytes())?;
        sink.write_all(&records.to_le_bytes())?;
        sink.write_all(frames)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        self.index.flush()?;
        self.detail.flush()?;
        self.fallback.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ManifestLine<'a> {
    sequence: u64,
    source: &'a str,
    slot_id: Option<u32>,
    thread_id: Option<u64>,
    ring_handle: u32,
    records: u64,
    bytes: u64,
}

/// Development writer: one JSON line of metadata per drained ring, data
/// discarded.
pub struct JsonManifestWriter {
    out: BufWriter<File>,
}

impl JsonManifestWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, WriterError> {
        Ok(Self { out: BufWriter::new(File::create(path)?) })
    }
}

impl TraceWriter for JsonManifestWriter {
    fn accept(&mut self, meta: &RingMeta, _frames: &[u8]) -> Result<(), WriterError> {
        let line = match meta.source {
            RingSource::Lane { slot_id, thread_id, lane } => ManifestLine {
                sequence: meta.sequence,
                source: lane.as_str(),
                slot_id: Some(slot_id),
                thread_id: Some(thread_id),
                ring_handle: meta.ring_handle,
                records: meta.records,
                bytes: meta.bytes,
            },
            RingSource::Fallback => ManifestLine {
                sequence: meta.sequence,
                source: "fallback",
                slot_id: None,
                thread_id: None,
                ring_handle: meta.ring_handle,
                records: meta.records,
                bytes: meta.bytes,
            },
        };
        let json =
            serde_json::to_string(&line).map_err(|e| WriterError::Serialization(e.to_string()))?;
        self.out.write_all(json.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        self.out.flush()?;
        Ok(())
    }
}
