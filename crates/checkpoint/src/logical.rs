//! Logical files: addressable segments inside a physical file.

use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::physical::PhysicalFile;
use crate::types::{SegmentHandle, SubtaskKey};

/// Unique identifier of a logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalFileId(Uuid);

impl LogicalFileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogicalFileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogicalFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One state segment's byte range `[offset, offset + length)` inside a
/// physical file.
///
/// Creation attaches a counted reference to the owning physical file;
/// discarding releases it, which may cascade into physical deletion once
/// the file is also closed. Discard is explicit rather than `Drop`-driven
/// because it performs fallible I/O.
pub struct LogicalFile {
    id: LogicalFileId,
    physical_file: Arc<PhysicalFile>,
    offset: u64,
    length: u64,
    subtask_key: SubtaskKey,
    /// Newest checkpoint still referencing this segment; -1 until first use.
    last_used_checkpoint_id: AtomicI64,
    discarded: AtomicBool,
}

impl LogicalFile {
    /// Carve a new logical file out of `physical_file`, taking one
    /// reference on it.
    pub fn new(
        id: LogicalFileId,
        physical_file: Arc<PhysicalFile>,
        offset: u64,
        length: u64,
        subtask_key: SubtaskKey,
    ) -> Self {
        physical_file.inc_ref_count();
        Self {
            id,
            physical_file,
            offset,
            length,
            subtask_key,
            last_used_checkpoint_id: AtomicI64::new(-1),
            discarded: AtomicBool::new(false),
        }
    }

    /// Record that `checkpoint_id` references this segment. Monotonic.
    pub fn advance_last_checkpoint_id(&self, checkpoint_id: u64) {
        self.last_used_checkpoint_id
            .fetch_max(checkpoint_id as i64, Ordering::SeqCst);
    }

    /// Discard this segment if no checkpoint newer than `checkpoint_id`
    /// references it. Returns whether this call released the segment;
    /// `false` when shielded by a newer checkpoint or already discarded.
    pub fn discard_with_checkpoint_id(&self, checkpoint_id: u64) -> Result<bool> {
        if (checkpoint_id as i64) < self.last_used_checkpoint_id.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.discard()
    }

    /// Discard this segment unconditionally (aborted checkpoint), releasing
    /// its reference on the physical file. Idempotent; returns whether this
    /// call won the latch, so concurrent discard paths account the segment
    /// exactly once.
    pub fn discard(&self) -> Result<bool> {
        if self.discarded.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.physical_file.dec_size(self.length);
        self.physical_file.dec_ref_count()?;
        Ok(true)
    }

    /// The persisted handle recorded in checkpoint metadata.
    pub fn handle(&self) -> SegmentHandle {
        SegmentHandle {
            file_path: self.physical_file.file_path().to_string_lossy().to_string(),
            offset: self.offset,
            length: self.length,
            scope: self.physical_file.scope(),
        }
    }

    pub fn id(&self) -> LogicalFileId {
        self.id
    }

    pub fn physical_file(&self) -> &Arc<PhysicalFile> {
        &self.physical_file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn subtask_key(&self) -> &SubtaskKey {
        &self.subtask_key
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Newest checkpoint known to reference this segment, if any.
    pub fn last_used_checkpoint_id(&self) -> Option<u64> {
        let id = self.last_used_checkpoint_id.load(Ordering::SeqCst);
        (id >= 0).then_some(id as u64)
    }
}

impl fmt::Debug for LogicalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalFile")
            .field("id", &self.id)
            .field("file_path", &self.physical_file.file_path())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("discarded", &self.is_discarded())
            .finish_non_exhaustive()
    }
}
