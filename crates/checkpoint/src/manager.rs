//! Manager-side allocation, reuse and deletion resolution.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use sluice_core::ResourceId;

use crate::config::FileMergingConfig;
use crate::logical::{LogicalFile, LogicalFileId};
use crate::physical::{PhysicalFile, PhysicalFileCreator, PhysicalFileDeleter};
use crate::pool::PhysicalFilePool;
use crate::space_stat::SpaceStat;
use crate::stream::{CancelToken, FileMergingCheckpointOutputStream};
use crate::types::{CheckpointedStateScope, SegmentHandle, SubtaskKey};

/// Multiplexes many small state segments onto a few large physical files.
///
/// For each write request the manager hands out a reusable physical file
/// from the pool (respecting scope compatibility) or creates a fresh one,
/// and later resolves logical-file reference decay into physical deletion
/// when checkpoints are subsumed or aborted.
///
/// One manager exists per TaskManager; its id scopes shared-file reuse.
pub struct FileMergingSnapshotManager {
    id: ResourceId,
    config: FileMergingConfig,
    checkpoint_dir: PathBuf,
    exclusive_base_dir: PathBuf,
    pool: PhysicalFilePool,
    creator: PhysicalFileCreator,
    space_stat: Arc<SpaceStat>,
    /// All live logical files, by id.
    logical_files: Mutex<HashMap<LogicalFileId, Arc<LogicalFile>>>,
    /// Logical files created by each checkpoint, for the abort path.
    created_by_checkpoint: Mutex<HashMap<u64, Vec<LogicalFileId>>>,
    /// Physical files rehydrated from previous metadata, deduplicated by
    /// path so segments of one backing file share one handle.
    restored_files: Mutex<HashMap<PathBuf, Arc<PhysicalFile>>>,
}

impl FileMergingSnapshotManager {
    /// Create a manager backed by the local filesystem under
    /// `checkpoint_dir`, with a deleter that removes files from disk.
    pub fn new(
        id: ResourceId,
        checkpoint_dir: impl AsRef<Path>,
        config: FileMergingConfig,
    ) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        let shared_dir = checkpoint_dir.join("shared");
        let exclusive_base_dir = checkpoint_dir.join("exclusive");
        let space_stat = Arc::new(SpaceStat::default());

        let deleter: PhysicalFileDeleter = {
            let stat = space_stat.clone();
            Arc::new(move |path: &Path, size: u64| {
                fs::remove_file(path)
                    .with_context(|| format!("failed to delete {}", path.display()))?;
                stat.on_physical_file_delete(size);
                trace!(path = %path.display(), size, "deleted physical file");
                Ok(())
            })
        };

        let creator: PhysicalFileCreator = {
            let shared_dir = shared_dir.clone();
            let exclusive_base_dir = exclusive_base_dir.clone();
            let stat = space_stat.clone();
            Arc::new(move |key: &SubtaskKey, scope: CheckpointedStateScope| {
                let dir = match scope {
                    CheckpointedStateScope::Shared => shared_dir.clone(),
                    CheckpointedStateScope::Exclusive => {
                        exclusive_base_dir.join(key.managed_dir_name())
                    }
                };
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                let path = dir.join(format!("phy-{}", Uuid::new_v4().simple()));
                let file = fs::File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let stream: Box<dyn Write + Send> = Box::new(BufWriter::new(file));

                let physical = Arc::new(PhysicalFile::new(
                    Some(stream),
                    &path,
                    Some(deleter.clone()),
                    scope,
                ));
                stat.on_physical_file_create();
                debug!(path = %path.display(), scope = ?scope, "created physical file");
                Ok(physical)
            })
        };

        Self::with_creator_and_stat(id, checkpoint_dir, config, creator, space_stat)
    }

    /// Create a manager with a custom physical-file creator (alternate
    /// backing storage). The creator is responsible for wiring a deleter
    /// into the files it opens; space statistics only see what the creator
    /// and deleter report.
    pub fn new_with_creator(
        id: ResourceId,
        checkpoint_dir: impl AsRef<Path>,
        config: FileMergingConfig,
        creator: PhysicalFileCreator,
    ) -> Result<Self> {
        Self::with_creator_and_stat(
            id,
            checkpoint_dir.as_ref().to_path_buf(),
            config,
            creator,
            Arc::new(SpaceStat::default()),
        )
    }

    fn with_creator_and_stat(
        id: ResourceId,
        checkpoint_dir: PathBuf,
        config: FileMergingConfig,
        creator: PhysicalFileCreator,
        space_stat: Arc<SpaceStat>,
    ) -> Result<Self> {
        let shared_dir = checkpoint_dir.join("shared");
        let exclusive_base_dir = checkpoint_dir.join("exclusive");
        fs::create_dir_all(&shared_dir)
            .with_context(|| format!("failed to create {}", shared_dir.display()))?;
        fs::create_dir_all(&exclusive_base_dir)
            .with_context(|| format!("failed to create {}", exclusive_base_dir.display()))?;

        info!(
            id = %id,
            dir = %checkpoint_dir.display(),
            "file-merging snapshot manager initialized"
        );

        Ok(Self {
            id,
            pool: PhysicalFilePool::new(config.max_file_size, config.max_space_amplification),
            config,
            checkpoint_dir,
            exclusive_base_dir,
            creator,
            space_stat,
            logical_files: Mutex::new(HashMap::new()),
            created_by_checkpoint: Mutex::new(HashMap::new()),
            restored_files: Mutex::new(HashMap::new()),
        })
    }

    /// Pre-create the managed directory for a subtask's exclusive files.
    pub fn register_subtask(&self, key: &SubtaskKey) -> Result<()> {
        let dir = self.exclusive_base_dir.join(key.managed_dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        debug!(subtask = %key, dir = %dir.display(), "registered subtask");
        Ok(())
    }

    /// Open a writer for one state segment of the given checkpoint.
    pub fn create_output_stream(
        &self,
        key: &SubtaskKey,
        checkpoint_id: u64,
        scope: CheckpointedStateScope,
    ) -> Result<FileMergingCheckpointOutputStream<'_>> {
        self.create_output_stream_cancellable(key, checkpoint_id, scope, None)
    }

    /// Like [`create_output_stream`](Self::create_output_stream), with a
    /// cancellation token checked at each write-batch boundary.
    pub fn create_output_stream_cancellable(
        &self,
        key: &SubtaskKey,
        checkpoint_id: u64,
        scope: CheckpointedStateScope,
        cancel: Option<CancelToken>,
    ) -> Result<FileMergingCheckpointOutputStream<'_>> {
        let file = self.get_or_create_physical_file(key, scope)?;
        Ok(FileMergingCheckpointOutputStream::new(
            self,
            file,
            key.clone(),
            checkpoint_id,
            cancel,
        ))
    }

    fn get_or_create_physical_file(
        &self,
        key: &SubtaskKey,
        scope: CheckpointedStateScope,
    ) -> Result<Arc<PhysicalFile>> {
        if let Some(file) = self.pool.poll(key, scope) {
            trace!(path = %file.file_path().display(), "reusing pooled physical file");
            return Ok(file);
        }
        (self.creator)(key, scope)
    }

    /// Register the range a stream just wrote as a logical file and hand
    /// the physical file back to the pool (or close it if worn out).
    pub(crate) fn finish_segment(
        &self,
        file: Arc<PhysicalFile>,
        key: SubtaskKey,
        checkpoint_id: u64,
        offset: u64,
        length: u64,
    ) -> Result<(Arc<LogicalFile>, SegmentHandle)> {
        // The segment is only addressable from metadata once its bytes are
        // durable. The stream is already consumed on this path, so the
        // caller cannot dispose; retire the file here instead of leaving it
        // open and unpoolable forever.
        if let Err(err) = file.flush() {
            file.dec_size(length);
            self.space_stat.on_physical_file_update(length);
            if let Err(close_err) = file.close() {
                warn!(
                    path = %file.file_path().display(),
                    error = %close_err,
                    "failed to close physical file after flush failure"
                );
                // The stream is gone even when close errors; deletion
                // eligibility still has to be resolved.
                if let Err(delete_err) = file.delete_if_necessary() {
                    warn!(
                        path = %file.file_path().display(),
                        error = %delete_err,
                        "failed to delete physical file after flush failure"
                    );
                }
            }
            return Err(err);
        }

        let logical = Arc::new(LogicalFile::new(
            LogicalFileId::new(),
            file.clone(),
            offset,
            length,
            key.clone(),
        ));
        logical.advance_last_checkpoint_id(checkpoint_id);
        self.space_stat.on_logical_file_create(length);
        self.space_stat.on_physical_file_update(length);

        self.logical_files.lock().insert(logical.id(), logical.clone());
        self.created_by_checkpoint
            .lock()
            .entry(checkpoint_id)
            .or_default()
            .push(logical.id());

        let handle = logical.handle();
        self.return_physical_file(&key, file)?;
        trace!(
            checkpoint_id,
            subtask = %key,
            offset,
            length,
            path = %handle.file_path,
            "finished segment"
        );
        Ok((logical, handle))
    }

    /// Abort path for a stream: the written bytes stay allocated but no
    /// longer count as live data.
    pub(crate) fn abandon_segment(
        &self,
        file: Arc<PhysicalFile>,
        key: &SubtaskKey,
        written: u64,
    ) -> Result<()> {
        file.dec_size(written);
        self.space_stat.on_physical_file_update(written);
        self.return_physical_file(key, file)
    }

    fn return_physical_file(&self, key: &SubtaskKey, file: Arc<PhysicalFile>) -> Result<()> {
        if !self.pool.try_return(key, file.clone()) {
            debug!(
                path = %file.file_path().display(),
                size = file.size(),
                "physical file no longer reusable, closing"
            );
            file.close()?;
        }
        Ok(())
    }

    /// Record that a newer checkpoint references an existing segment
    /// (unchanged state carried across checkpoints), shielding it from
    /// subsumption of older checkpoints.
    pub fn reuse_logical_file(&self, checkpoint_id: u64, logical: &Arc<LogicalFile>) {
        logical.advance_last_checkpoint_id(checkpoint_id);
    }

    /// All checkpoints up to and including `checkpoint_id` are subsumed:
    /// discard every logical file not referenced by a newer checkpoint,
    /// cascading reference decay into physical deletion.
    pub fn notify_checkpoint_subsumed(&self, checkpoint_id: u64) -> Result<()> {
        let candidates: Vec<Arc<LogicalFile>> =
            self.logical_files.lock().values().cloned().collect();

        let mut discarded = 0usize;
        for logical in candidates {
            // Keyed off whether this call won the discard latch, so a
            // concurrent abort of the same segment is counted exactly once.
            if logical.discard_with_checkpoint_id(checkpoint_id)? {
                self.logical_files.lock().remove(&logical.id());
                self.space_stat.on_logical_file_delete(logical.length());
                discarded += 1;
            }
        }
        self.created_by_checkpoint
            .lock()
            .retain(|&id, _| id > checkpoint_id);

        debug!(checkpoint_id, discarded, "subsumed checkpoint artifacts");
        Ok(())
    }

    /// A checkpoint attempt failed or was aborted: discard the logical
    /// files it created, unless a newer checkpoint already claimed them.
    pub fn notify_checkpoint_aborted(&self, checkpoint_id: u64) -> Result<()> {
        let ids = self
            .created_by_checkpoint
            .lock()
            .remove(&checkpoint_id)
            .unwrap_or_default();

        let mut discarded = 0usize;
        for id in ids {
            let logical = self.logical_files.lock().get(&id).cloned();
            let Some(logical) = logical else { continue };
            if logical.last_used_checkpoint_id() > Some(checkpoint_id) {
                continue;
            }
            if logical.discard()? {
                self.logical_files.lock().remove(&id);
                self.space_stat.on_logical_file_delete(logical.length());
                discarded += 1;
            }
        }

        debug!(checkpoint_id, discarded, "aborted checkpoint artifacts");
        Ok(())
    }

    /// Rehydrate a physical file referenced by a previous run's metadata.
    ///
    /// The returned file is closed and **unowned**: a restored job must not
    /// delete files it merely references. Lookups by path return the same
    /// handle.
    pub fn restore_physical_file(
        &self,
        path: impl AsRef<Path>,
        size: u64,
        scope: CheckpointedStateScope,
    ) -> Arc<PhysicalFile> {
        let path = path.as_ref().to_path_buf();
        let mut restored = self.restored_files.lock();
        if let Some(file) = restored.get(&path) {
            if file.size() < size {
                file.update_size(size);
            }
            return file.clone();
        }
        let file = Arc::new(PhysicalFile::new_with_owner(
            None,
            path.clone(),
            None,
            scope,
            false,
        ));
        file.update_size(size);
        debug!(path = %path.display(), size, "restored physical file");
        restored.insert(path, file.clone());
        file
    }

    /// Re-register one restored segment under the checkpoint that carried
    /// it, re-attaching its reference to the (unowned) physical file.
    pub fn register_restored_segment(
        &self,
        checkpoint_id: u64,
        handle: &SegmentHandle,
        key: &SubtaskKey,
    ) -> Arc<LogicalFile> {
        let min_size = handle.offset + handle.length;
        let physical = self.restore_physical_file(&handle.file_path, min_size, handle.scope);
        physical.inc_size(handle.length);

        let logical = Arc::new(LogicalFile::new(
            LogicalFileId::new(),
            physical,
            handle.offset,
            handle.length,
            key.clone(),
        ));
        logical.advance_last_checkpoint_id(checkpoint_id);
        self.space_stat.on_logical_file_create(handle.length);

        self.logical_files.lock().insert(logical.id(), logical.clone());
        self.created_by_checkpoint
            .lock()
            .entry(checkpoint_id)
            .or_default()
            .push(logical.id());
        logical
    }

    /// Close every pooled file. Files still referenced by live logical
    /// files survive until their references decay.
    pub fn close(&self) -> Result<()> {
        for file in self.pool.drain() {
            file.close()?;
        }
        info!(id = %self.id, stat = %self.space_stat, "file-merging snapshot manager closed");
        Ok(())
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn config(&self) -> &FileMergingConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn space_stat(&self) -> &SpaceStat {
        &self.space_stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::JobId;

    fn manager(dir: &Path, config: FileMergingConfig) -> FileMergingSnapshotManager {
        FileMergingSnapshotManager::new(ResourceId::from_name("tm-test"), dir, config).unwrap()
    }

    fn key(subtask_index: u32) -> SubtaskKey {
        SubtaskKey::new(JobId::default(), "map", subtask_index, 4)
    }

    fn write_segment(
        manager: &FileMergingSnapshotManager,
        key: &SubtaskKey,
        checkpoint_id: u64,
        scope: CheckpointedStateScope,
        data: &[u8],
    ) -> (Arc<LogicalFile>, SegmentHandle) {
        let mut stream = manager
            .create_output_stream(key, checkpoint_id, scope)
            .unwrap();
        stream.write(data).unwrap();
        stream.close_and_get_handle().unwrap()
    }

    #[test]
    fn segments_of_one_subtask_share_a_physical_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);
        manager.register_subtask(&key).unwrap();

        let (l1, h1) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"hello");
        let (_l2, h2) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"world!!");

        assert_eq!(h1.file_path, h2.file_path);
        assert_eq!((h1.offset, h1.length), (0, 5));
        assert_eq!((h2.offset, h2.length), (5, 7));
        assert_eq!(l1.physical_file().ref_count(), 2);

        let on_disk = fs::read(&h1.file_path).unwrap();
        assert_eq!(&on_disk[..5], b"hello");
        assert_eq!(on_disk.len(), 12);
    }

    #[test]
    fn exclusive_scope_does_not_cross_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());

        let (_, h1) =
            write_segment(&manager, &key(0), 1, CheckpointedStateScope::Exclusive, b"a");
        let (_, h2) =
            write_segment(&manager, &key(1), 1, CheckpointedStateScope::Exclusive, b"b");
        assert_ne!(h1.file_path, h2.file_path);
    }

    #[test]
    fn shared_scope_crosses_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());

        let (_, h1) = write_segment(&manager, &key(0), 1, CheckpointedStateScope::Shared, b"a");
        let (_, h2) = write_segment(&manager, &key(1), 1, CheckpointedStateScope::Shared, b"b");
        assert_eq!(h1.file_path, h2.file_path);
        assert_eq!(h2.offset, 1);
    }

    #[test]
    fn oversize_file_is_rotated_and_deleted_after_subsumption() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileMergingConfig {
            max_file_size: 8,
            ..FileMergingConfig::default()
        };
        let manager = manager(dir.path(), config);
        let key = key(0);

        let (l1, h1) = write_segment(
            &manager,
            &key,
            1,
            CheckpointedStateScope::Exclusive,
            b"0123456789",
        );
        let file = l1.physical_file().clone();
        assert!(file.is_closed());
        assert!(!file.is_deleted());

        let (_, h2) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"xy");
        assert_ne!(h1.file_path, h2.file_path);

        manager.notify_checkpoint_subsumed(1).unwrap();
        assert!(l1.is_discarded());
        assert!(file.is_deleted());
        assert!(!PathBuf::from(&h1.file_path).exists());
    }

    #[test]
    fn subsumption_then_close_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let (l1, h1) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"state");
        assert_eq!(manager.space_stat().physical_file_count(), 1);
        assert_eq!(manager.space_stat().logical_file_count(), 1);

        manager.notify_checkpoint_subsumed(1).unwrap();
        assert!(l1.is_discarded());
        // Still pooled and open, so not deletable yet.
        assert!(!l1.physical_file().is_deleted());

        manager.close().unwrap();
        assert!(l1.physical_file().is_deleted());
        assert!(!PathBuf::from(&h1.file_path).exists());
        assert_eq!(manager.space_stat().physical_file_count(), 0);
        assert_eq!(manager.space_stat().logical_file_count(), 0);
    }

    #[test]
    fn reuse_by_newer_checkpoint_shields_from_subsumption() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let (l1, _) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"keep");
        manager.reuse_logical_file(2, &l1);

        manager.notify_checkpoint_subsumed(1).unwrap();
        assert!(!l1.is_discarded());

        manager.notify_checkpoint_subsumed(2).unwrap();
        assert!(l1.is_discarded());
    }

    #[test]
    fn aborted_checkpoint_discards_its_segments() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let (l1, _) =
            write_segment(&manager, &key, 3, CheckpointedStateScope::Exclusive, b"doomed");
        let file = l1.physical_file().clone();
        assert_eq!(file.data_size(), 6);

        manager.notify_checkpoint_aborted(3).unwrap();
        assert!(l1.is_discarded());
        assert_eq!(file.data_size(), 0);
        assert_eq!(manager.space_stat().logical_file_count(), 0);
    }

    #[test]
    fn abort_skips_segments_claimed_by_newer_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let (l1, _) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"claimed");
        manager.reuse_logical_file(2, &l1);

        manager.notify_checkpoint_aborted(1).unwrap();
        assert!(!l1.is_discarded());
    }

    #[test]
    fn disposed_stream_leaves_waste_but_keeps_the_file_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let mut stream = manager
            .create_output_stream(&key, 1, CheckpointedStateScope::Exclusive)
            .unwrap();
        stream.write(b"junk!").unwrap();
        stream.dispose().unwrap();

        let (l2, h2) =
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"live");
        assert_eq!(h2.offset, 5);
        let file = l2.physical_file();
        assert_eq!(file.size(), 9);
        assert_eq!(file.data_size(), 4);
        assert_eq!(file.wasted_size(), 5);
    }

    #[test]
    fn restored_files_are_unowned_and_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let previous = dir.path().join("previous-phy");
        fs::write(&previous, vec![0u8; 64]).unwrap();
        let path_str = previous.to_string_lossy().to_string();

        let h1 = SegmentHandle {
            file_path: path_str.clone(),
            offset: 16,
            length: 32,
            scope: CheckpointedStateScope::Shared,
        };
        let h2 = SegmentHandle {
            file_path: path_str,
            offset: 0,
            length: 16,
            scope: CheckpointedStateScope::Shared,
        };

        let l1 = manager.register_restored_segment(10, &h1, &key);
        let l2 = manager.register_restored_segment(10, &h2, &key);

        let file = l1.physical_file().clone();
        assert!(Arc::ptr_eq(&file, l2.physical_file()));
        assert!(!file.is_owned());
        assert!(file.is_closed());
        assert_eq!(file.ref_count(), 2);
        assert_eq!(file.size(), 48);
        assert_eq!(file.data_size(), 48);

        manager.notify_checkpoint_subsumed(10).unwrap();
        assert!(l1.is_discarded());
        assert!(l2.is_discarded());
        // The deletion latch fires, but the bytes stay: not ours to remove.
        assert!(file.is_deleted());
        assert!(previous.exists());
    }

    #[test]
    fn injected_creator_backs_the_allocator() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let created = Arc::new(AtomicUsize::new(0));
        let creator: PhysicalFileCreator = {
            let created = created.clone();
            Arc::new(move |key, scope| {
                let n = created.fetch_add(1, Ordering::SeqCst);
                let stream: Box<dyn Write + Send> = Box::new(std::io::sink());
                Ok(Arc::new(PhysicalFile::new(
                    Some(stream),
                    format!("/mem/{}-{}", key.managed_dir_name(), n),
                    None,
                    scope,
                )))
            })
        };
        let manager = FileMergingSnapshotManager::new_with_creator(
            ResourceId::from_name("tm-test"),
            dir.path(),
            FileMergingConfig::default(),
            creator,
        )
        .unwrap();

        let key = key(0);
        write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"a");
        write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"b");
        // Second segment reuses the pooled file instead of creating one.
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_flush_retires_the_physical_file() {
        struct FailingFlush;
        impl Write for FailingFlush {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "flush refused",
                ))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let files: Arc<Mutex<Vec<Arc<PhysicalFile>>>> = Arc::new(Mutex::new(Vec::new()));
        let creator: PhysicalFileCreator = {
            let files = files.clone();
            Arc::new(move |key, scope| {
                let stream: Box<dyn Write + Send> = Box::new(FailingFlush);
                let file = Arc::new(PhysicalFile::new(
                    Some(stream),
                    format!("/mem/{}-{}", key.managed_dir_name(), files.lock().len()),
                    None,
                    scope,
                ));
                files.lock().push(file.clone());
                Ok(file)
            })
        };
        let manager = FileMergingSnapshotManager::new_with_creator(
            ResourceId::from_name("tm-test"),
            dir.path(),
            FileMergingConfig::default(),
            creator,
        )
        .unwrap();
        let key = key(0);

        let mut stream = manager
            .create_output_stream(&key, 1, CheckpointedStateScope::Exclusive)
            .unwrap();
        stream.write(b"data").unwrap();
        assert!(stream.close_and_get_handle().is_err());

        // The file must not stay open and unpoolable with no way to
        // release it.
        let file = files.lock()[0].clone();
        assert!(!file.is_open());
        assert!(file.is_closed());
        assert!(file.is_deleted());
        assert_eq!(file.ref_count(), 0);
        assert_eq!(file.data_size(), 0);

        // The retired file is not handed out again.
        let stream = manager
            .create_output_stream(&key, 1, CheckpointedStateScope::Exclusive)
            .unwrap();
        stream.dispose().unwrap();
        assert_eq!(files.lock().len(), 2);
    }

    #[test]
    fn concurrent_subsume_and_abort_account_each_segment_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), FileMergingConfig::default()));
        let key = key(0);
        for _ in 0..16 {
            write_segment(&manager, &key, 1, CheckpointedStateScope::Exclusive, b"seg");
        }
        assert_eq!(manager.space_stat().logical_file_count(), 16);

        let workers: Vec<_> = [true, false]
            .into_iter()
            .map(|subsume| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    if subsume {
                        manager.notify_checkpoint_subsumed(1).unwrap();
                    } else {
                        manager.notify_checkpoint_aborted(1).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // Whichever path wins the discard accounts the segment; the loser
        // must not decrement again.
        assert_eq!(manager.space_stat().logical_file_count(), 0);
        assert_eq!(manager.space_stat().logical_file_size(), 0);
        assert!(manager.logical_files.lock().is_empty());
    }

    #[test]
    fn cancelled_stream_refuses_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), FileMergingConfig::default());
        let key = key(0);

        let token = CancelToken::new();
        let mut stream = manager
            .create_output_stream_cancellable(
                &key,
                1,
                CheckpointedStateScope::Exclusive,
                Some(token.clone()),
            )
            .unwrap();
        stream.write(b"ok").unwrap();

        token.cancel();
        assert!(stream.write(b"more").is_err());
        stream.dispose().unwrap();
    }
}
