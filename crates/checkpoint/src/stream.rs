//! Output stream handed to state-backend writers.

use anyhow::{ensure, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logical::LogicalFile;
use crate::manager::FileMergingSnapshotManager;
use crate::physical::PhysicalFile;
use crate::types::{SegmentHandle, SubtaskKey};

/// Cooperative cancellation flag, checked at write-batch boundaries.
///
/// Once cancelled, further writes fail instead of silently continuing.
/// Used by the restore path when a recovering job is torn down mid-write.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Writer for one logical segment, appended to a pooled physical file.
///
/// The stream holds its physical file exclusively until it is finished or
/// disposed, so appends from one segment are contiguous. Finishing carves
/// the written range into a [`LogicalFile`] and hands the physical file
/// back to the reuse pool; disposing writes nothing into checkpoint
/// metadata and turns the already-written bytes into waste.
pub struct FileMergingCheckpointOutputStream<'a> {
    manager: &'a FileMergingSnapshotManager,
    file: Arc<PhysicalFile>,
    subtask_key: SubtaskKey,
    checkpoint_id: u64,
    start_offset: u64,
    bytes_written: u64,
    cancel: Option<CancelToken>,
}

impl<'a> FileMergingCheckpointOutputStream<'a> {
    pub(crate) fn new(
        manager: &'a FileMergingSnapshotManager,
        file: Arc<PhysicalFile>,
        subtask_key: SubtaskKey,
        checkpoint_id: u64,
        cancel: Option<CancelToken>,
    ) -> Self {
        let start_offset = file.size();
        Self {
            manager,
            file,
            subtask_key,
            checkpoint_id,
            start_offset,
            bytes_written: 0,
            cancel,
        }
    }

    /// Append one batch of segment bytes.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if let Some(cancel) = &self.cancel {
            ensure!(
                !cancel.is_cancelled(),
                "checkpoint {} write cancelled for subtask {}",
                self.checkpoint_id,
                self.subtask_key
            );
        }
        let offset = self.file.write(buf)?;
        debug_assert_eq!(offset, self.start_offset + self.bytes_written);
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Offset the segment starts at inside the physical file.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush, register the written range as a logical file, and return the
    /// handle to persist in checkpoint metadata.
    pub fn close_and_get_handle(self) -> Result<(Arc<LogicalFile>, SegmentHandle)> {
        self.manager.finish_segment(
            self.file,
            self.subtask_key,
            self.checkpoint_id,
            self.start_offset,
            self.bytes_written,
        )
    }

    /// Abort this segment. The bytes already written stay allocated in the
    /// physical file but no longer count as live data.
    pub fn dispose(self) -> Result<()> {
        self.manager
            .abandon_segment(self.file, &self.subtask_key, self.bytes_written)
    }
}
