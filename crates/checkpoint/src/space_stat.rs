//! Storage accounting for one snapshot manager.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for the files managed by one snapshot manager.
///
/// Physical size counts allocated bytes (including waste); logical size
/// counts bytes still referenced by live segments. The gap between the two
/// is the space amplification the reuse policy keeps bounded.
#[derive(Debug, Default)]
pub struct SpaceStat {
    physical_file_count: AtomicU64,
    physical_file_size: AtomicU64,
    logical_file_count: AtomicU64,
    logical_file_size: AtomicU64,
}

impl SpaceStat {
    pub fn on_physical_file_create(&self) {
        self.physical_file_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocated bytes grew by `delta` (segment appended).
    pub fn on_physical_file_update(&self, delta: u64) {
        self.physical_file_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn on_physical_file_delete(&self, size: u64) {
        self.physical_file_count.fetch_sub(1, Ordering::Relaxed);
        self.physical_file_size.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn on_logical_file_create(&self, size: u64) {
        self.logical_file_count.fetch_add(1, Ordering::Relaxed);
        self.logical_file_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn on_logical_file_delete(&self, size: u64) {
        self.logical_file_count.fetch_sub(1, Ordering::Relaxed);
        self.logical_file_size.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn physical_file_count(&self) -> u64 {
        self.physical_file_count.load(Ordering::Relaxed)
    }

    pub fn physical_file_size(&self) -> u64 {
        self.physical_file_size.load(Ordering::Relaxed)
    }

    pub fn logical_file_count(&self) -> u64 {
        self.logical_file_count.load(Ordering::Relaxed)
    }

    pub fn logical_file_size(&self) -> u64 {
        self.logical_file_size.load(Ordering::Relaxed)
    }
}

impl fmt::Display for SpaceStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "physical files: {} ({} bytes), logical files: {} ({} bytes)",
            self.physical_file_count(),
            self.physical_file_size(),
            self.logical_file_count(),
            self.logical_file_size()
        )
    }
}
