//! Reuse pool for physical files.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

use crate::physical::PhysicalFile;
use crate::types::{CheckpointedStateScope, SubtaskKey};

/// Pool of physical files still accepting new segments.
///
/// Exclusive-scope files are keyed by subtask so a segment never shares a
/// file with another subtask's exclusive state. Shared-scope files live in
/// a single queue per pool; one pool exists per manager, i.e. per
/// TaskManager, which is the sharing boundary.
///
/// A file handed out by [`poll`](Self::poll) is held exclusively by one
/// writer until it is returned or closed.
pub struct PhysicalFilePool {
    max_file_size: u64,
    max_space_amplification: f64,
    exclusive: Mutex<HashMap<SubtaskKey, VecDeque<Arc<PhysicalFile>>>>,
    shared: Mutex<VecDeque<Arc<PhysicalFile>>>,
}

impl PhysicalFilePool {
    pub fn new(max_file_size: u64, max_space_amplification: f64) -> Self {
        Self {
            max_file_size,
            max_space_amplification,
            exclusive: Mutex::new(HashMap::new()),
            shared: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a reusable file for the given subtask and scope, if any.
    ///
    /// Files failing the space-amplification check are retired here: dropped
    /// from the pool but not deleted, since they may still hold live
    /// references.
    pub fn poll(
        &self,
        key: &SubtaskKey,
        scope: CheckpointedStateScope,
    ) -> Option<Arc<PhysicalFile>> {
        match scope {
            CheckpointedStateScope::Exclusive => {
                let mut queues = self.exclusive.lock();
                let queue = queues.get_mut(key)?;
                self.poll_reusable(queue)
            }
            CheckpointedStateScope::Shared => self.poll_reusable(&mut self.shared.lock()),
        }
    }

    fn poll_reusable(&self, queue: &mut VecDeque<Arc<PhysicalFile>>) -> Option<Arc<PhysicalFile>> {
        while let Some(file) = queue.pop_front() {
            if file.check_reuse_on_space_amplification(self.max_space_amplification) {
                return Some(file);
            }
            trace!(
                path = %file.file_path().display(),
                wasted = file.wasted_size(),
                "retired physical file from reuse pool"
            );
        }
        None
    }

    /// Put a file back after a segment write. Returns `false` if the file
    /// is no longer eligible for reuse; the caller should close it.
    pub fn try_return(&self, key: &SubtaskKey, file: Arc<PhysicalFile>) -> bool {
        if file.size() >= self.max_file_size
            || !file.check_reuse_on_space_amplification(self.max_space_amplification)
        {
            return false;
        }
        match file.scope() {
            CheckpointedStateScope::Exclusive => {
                self.exclusive
                    .lock()
                    .entry(key.clone())
                    .or_default()
                    .push_back(file);
            }
            CheckpointedStateScope::Shared => self.shared.lock().push_back(file),
        }
        true
    }

    /// Empty the pool, handing back every pooled file (manager shutdown).
    pub fn drain(&self) -> Vec<Arc<PhysicalFile>> {
        let mut files: Vec<_> = self.shared.lock().drain(..).collect();
        for (_, mut queue) in self.exclusive.lock().drain() {
            files.extend(queue.drain(..));
        }
        files
    }
}
