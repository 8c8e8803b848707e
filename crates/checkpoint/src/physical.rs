//! Physical files backing file-merging checkpoints.

use anyhow::{anyhow, bail, ensure, Context, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::types::{CheckpointedStateScope, SubtaskKey};

/// Callback that removes the backing file once it is closed and
/// unreferenced. Receives the file path and its final size.
pub type PhysicalFileDeleter = Arc<dyn Fn(&Path, u64) -> Result<()> + Send + Sync>;

/// Callback that opens a fresh physical file when the allocator finds no
/// reusable one for the given subtask and scope.
pub type PhysicalFileCreator =
    Arc<dyn Fn(&SubtaskKey, CheckpointedStateScope) -> Result<Arc<PhysicalFile>> + Send + Sync>;

/// One backing file on durable storage, shared by the logical segments
/// carved out of it.
///
/// Lifecycle: `OPEN -> CLOSED -> DELETED`. While open the file accepts
/// appends and is always reuse-eligible. Once closed its allocated size is
/// frozen, and it becomes deletable as soon as the last logical-file
/// reference is dropped. Deletion fires the injected deleter at most once,
/// and only for files this manager owns.
///
/// Reference counts and size accounting are atomic; the close/delete
/// transition (and the delete action itself) is serialized by the stream
/// lock so that racing writers, checkpoint completion and subsumption
/// callbacks cannot double-delete or leak.
pub struct PhysicalFile {
    file_path: PathBuf,
    scope: CheckpointedStateScope,
    /// Whether this manager is responsible for deleting the file. Files
    /// rehydrated from a previous checkpoint's metadata are not owned.
    owned: bool,
    /// `None` means this layer never removes the file.
    deleter: Option<PhysicalFileDeleter>,
    /// Reference count from the logical files carved out of this file.
    ref_count: AtomicU32,
    /// Bytes physically allocated. Frozen once the file is closed.
    size: AtomicU64,
    /// Bytes still referenced by live logical files.
    data_size: AtomicU64,
    closed: AtomicBool,
    deleted: AtomicBool,
    /// One-way latch: cleared permanently once space amplification grows
    /// past the configured bound.
    could_reuse: AtomicBool,
    /// Live output stream, present iff the file is open for writing. The
    /// lock also serializes appends and the close/delete transition.
    stream: Mutex<Option<Box<dyn Write + Send>>>,
}

impl PhysicalFile {
    /// Create an owned physical file. `stream` is the live output handle;
    /// passing `None` constructs the file pre-closed.
    pub fn new(
        stream: Option<Box<dyn Write + Send>>,
        file_path: impl Into<PathBuf>,
        deleter: Option<PhysicalFileDeleter>,
        scope: CheckpointedStateScope,
    ) -> Self {
        Self::new_with_owner(stream, file_path, deleter, scope, true)
    }

    /// Create a physical file with an explicit ownership flag. Unowned
    /// files are never physically removed by this layer.
    pub fn new_with_owner(
        stream: Option<Box<dyn Write + Send>>,
        file_path: impl Into<PathBuf>,
        deleter: Option<PhysicalFileDeleter>,
        scope: CheckpointedStateScope,
        owned: bool,
    ) -> Self {
        let closed = stream.is_none();
        Self {
            file_path: file_path.into(),
            scope,
            owned,
            deleter,
            ref_count: AtomicU32::new(0),
            size: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            closed: AtomicBool::new(closed),
            deleted: AtomicBool::new(false),
            could_reuse: AtomicBool::new(owned),
            stream: Mutex::new(stream),
        }
    }

    /// Attach one more logical-file reference.
    pub fn inc_ref_count(&self) {
        let new = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(
            path = %self.file_path.display(),
            ref_count = new,
            "increased physical file reference count"
        );
    }

    /// Drop one logical-file reference, deleting the file if it was the
    /// last one and the file is already closed.
    ///
    /// A decrement past zero is a bookkeeping bug in the calling layer and
    /// fails the enclosing checkpoint operation.
    pub fn dec_ref_count(&self) -> Result<()> {
        let Ok(prev) = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
        else {
            bail!(
                "reference count of physical file {} is already zero",
                self.file_path.display()
            );
        };
        trace!(
            path = %self.file_path.display(),
            ref_count = prev - 1,
            "decreased physical file reference count"
        );
        self.delete_if_necessary()
    }

    /// Delete this file if it is not open, not yet deleted, and holds no
    /// logical-file references. Idempotent: the delete action fires at most
    /// once, and only for owned files.
    pub fn delete_if_necessary(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        let open = !self.closed.load(Ordering::SeqCst) && stream.is_some();
        if open || self.deleted.load(Ordering::SeqCst) || self.ref_count.load(Ordering::SeqCst) > 0
        {
            return Ok(());
        }
        // Best-effort close of a stream left open on a never-closed file.
        if let Some(mut out) = stream.take() {
            if let Err(e) = out.flush() {
                warn!(
                    path = %self.file_path.display(),
                    error = %e,
                    "failed to close output stream while deleting physical file"
                );
            }
        }
        match &self.deleter {
            Some(deleter) if self.owned => {
                deleter(&self.file_path, self.size.load(Ordering::SeqCst))?;
            }
            _ => {
                debug!(
                    path = %self.file_path.display(),
                    "skipping deletion of physical file not owned by this manager"
                );
            }
        }
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Append `buf` to the file, returning the offset the bytes landed at.
    /// Fails once the file is closed.
    pub(crate) fn write(&self, buf: &[u8]) -> Result<u64> {
        let mut stream = self.stream.lock();
        ensure!(
            !self.closed.load(Ordering::SeqCst),
            "physical file {} is closed",
            self.file_path.display()
        );
        let out = stream.as_mut().ok_or_else(|| {
            anyhow!(
                "physical file {} has no output stream",
                self.file_path.display()
            )
        })?;
        let offset = self.size.load(Ordering::SeqCst);
        out.write_all(buf)
            .with_context(|| format!("failed to append to {}", self.file_path.display()))?;
        // closed cannot flip while the stream lock is held.
        self.data_size.fetch_add(buf.len() as u64, Ordering::SeqCst);
        self.size.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    /// Flush buffered bytes to durable storage.
    pub(crate) fn flush(&self) -> Result<()> {
        if let Some(out) = self.stream.lock().as_mut() {
            out.flush()
                .with_context(|| format!("failed to flush {}", self.file_path.display()))?;
        }
        Ok(())
    }

    /// Grow the live data size by `delta`; the allocated size grows too,
    /// but only while the file is open.
    pub fn inc_size(&self, delta: u64) {
        self.data_size.fetch_add(delta, Ordering::SeqCst);
        if !self.closed.load(Ordering::SeqCst) {
            self.size.fetch_add(delta, Ordering::SeqCst);
        }
    }

    /// Shrink the live data size by `delta` (a logical segment was
    /// discarded; the allocated bytes remain as waste).
    pub fn dec_size(&self, delta: u64) {
        self.data_size.fetch_sub(delta, Ordering::SeqCst);
    }

    /// Set the allocated size outright. Used when rehydrating a file from
    /// persisted checkpoint metadata.
    pub fn update_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    /// Whether this file may still take new segments, given the maximum
    /// tolerated space amplification.
    ///
    /// Open files are always reusable. A closed file is retired permanently
    /// the first time its live data drops to zero or
    /// `data_size * max_amp < size`; the latch never reopens, which bounds
    /// the lifetime waste a single file can accumulate.
    pub fn check_reuse_on_space_amplification(&self, max_amp: f64) -> bool {
        if !self.closed.load(Ordering::SeqCst) {
            return true;
        }
        if self.could_reuse.load(Ordering::SeqCst) {
            let data = self.data_size.load(Ordering::SeqCst);
            let size = self.size.load(Ordering::SeqCst);
            if data == 0 || (data as f64) * max_amp < size as f64 {
                self.could_reuse.store(false, Ordering::SeqCst);
            }
        }
        self.could_reuse.load(Ordering::SeqCst)
    }

    /// Whether the file is reusable without re-evaluating amplification.
    pub fn is_could_reuse(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) || self.could_reuse.load(Ordering::SeqCst)
    }

    /// Close the file: no further appends, allocated size frozen. Idempotent.
    /// Also deletes the file right away if it is already unreferenced.
    pub fn close(&self) -> Result<()> {
        self.inner_close()?;
        self.delete_if_necessary()
    }

    fn inner_close(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut out) = stream.take() {
            out.flush()
                .with_context(|| format!("failed to close {}", self.file_path.display()))?;
        }
        Ok(())
    }

    /// Whether this file is still open for writing.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.stream.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Bytes physically allocated in the file.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Bytes still referenced by live logical files.
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::SeqCst)
    }

    /// Allocated bytes no longer referenced by any logical file.
    pub fn wasted_size(&self) -> u64 {
        self.size().saturating_sub(self.data_size())
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn scope(&self) -> CheckpointedStateScope {
        self.scope
    }
}

/// Handles resolved by path lookup must compare by logical key, not
/// object identity.
impl PartialEq for PhysicalFile {
    fn eq(&self, other: &Self) -> bool {
        self.owned == other.owned && self.file_path == other.file_path
    }
}

impl Eq for PhysicalFile {}

impl fmt::Display for PhysicalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalFile[{}], owned: {}, closed: {}, ref_count: {}",
            self.file_path.display(),
            self.owned,
            self.is_closed(),
            self.ref_count()
        )
    }
}

impl fmt::Debug for PhysicalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalFile")
            .field("file_path", &self.file_path)
            .field("scope", &self.scope)
            .field("owned", &self.owned)
            .field("size", &self.size())
            .field("data_size", &self.data_size())
            .field("ref_count", &self.ref_count())
            .field("closed", &self.is_closed())
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}
