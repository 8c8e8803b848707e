//! Common types for file-merging checkpoint storage.

use serde::{Deserialize, Serialize};
use sluice_core::JobId;
use std::fmt;

/// Whether a state segment may share its backing file across subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointedStateScope {
    /// Colocated only with segments from the same subtask.
    Exclusive,
    /// May be colocated with segments from other subtasks of the same
    /// TaskManager.
    Shared,
}

/// Identity of one parallel subtask of a job vertex.
///
/// Decides which physical files a segment is eligible to share: segments
/// with [`CheckpointedStateScope::Exclusive`] scope only merge with
/// segments carrying the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskKey {
    pub job_id: JobId,
    pub vertex_id: String,
    pub subtask_index: u32,
    pub parallelism: u32,
}

impl SubtaskKey {
    pub fn new(
        job_id: JobId,
        vertex_id: impl Into<String>,
        subtask_index: u32,
        parallelism: u32,
    ) -> Self {
        Self {
            job_id,
            vertex_id: vertex_id.into(),
            subtask_index,
            parallelism,
        }
    }

    /// Stable directory name for this subtask's exclusive-scope files.
    pub fn managed_dir_name(&self) -> String {
        format!(
            "job_{}_vertex_{}_{}_{}",
            self.job_id, self.vertex_id, self.subtask_index, self.parallelism
        )
    }
}

impl fmt::Display for SubtaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}/{})",
            self.vertex_id, self.subtask_index, self.parallelism
        )
    }
}

/// Persisted mapping from one logical segment to its byte range inside a
/// physical file.
///
/// This is what the enclosing checkpoint metadata records; it must be
/// enough to re-address the segment after a job restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHandle {
    pub file_path: String,
    pub offset: u64,
    pub length: u64,
    pub scope: CheckpointedStateScope,
}
