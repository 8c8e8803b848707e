//! File-merging checkpoint storage.
//!
//! Long-running stream jobs snapshot thousands of small state segments per
//! checkpoint. Writing each segment to its own file overwhelms the backing
//! storage, so this crate multiplexes many logical segments onto a small
//! number of large physical files while keeping per-segment addressability,
//! correct cleanup, and bounded storage waste:
//!
//! - [`PhysicalFile`]: one backing file shared by many segments; tracks
//!   reference counts, live data size and reuse eligibility, and is deleted
//!   once it is closed and the last reference decays.
//! - [`LogicalFile`]: one segment's byte range inside a physical file; the
//!   unit addressed by checkpoint metadata.
//! - [`FileMergingSnapshotManager`]: picks or creates the physical file for
//!   each write request and turns logical-file discards (checkpoint
//!   subsumption or abortion) into physical deletion.

mod config;
mod logical;
mod manager;
mod physical;
mod pool;
mod space_stat;
mod stream;
mod types;

pub use config::FileMergingConfig;
pub use logical::{LogicalFile, LogicalFileId};
pub use manager::FileMergingSnapshotManager;
pub use physical::{PhysicalFile, PhysicalFileCreator, PhysicalFileDeleter};
pub use pool::PhysicalFilePool;
pub use space_stat::SpaceStat;
pub use stream::{CancelToken, FileMergingCheckpointOutputStream};
pub use types::{CheckpointedStateScope, SegmentHandle, SubtaskKey};
