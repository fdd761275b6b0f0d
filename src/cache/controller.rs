//! The per-entry cache controller.
//!
//! One `CacheController` exists per cached file. It owns the entry
//! directory, the background download task and the readiness condition
//! that readers block on when they outrun the download. The download
//! task is the only writer of `data.bin` and the only mutator of the
//! entry's status and frontier; the registry only clears the validity
//! flag and the reader set is maintained by the reader handles.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::error::CacheError;
use super::reader::CachedFileReader;
use super::registry::CacheShared;
use crate::metadata::{MetadataFactory, RemoteFileMetadata};

/// Payload file of an entry directory.
pub const DATA_FILE: &str = "data.bin";
/// Serialized descriptor of an entry directory.
pub const METADATA_FILE: &str = "metadata.txt";
/// Status snapshot of an entry directory.
pub const INFO_FILE: &str = "info.txt";

/// Download status of a cache entry.
///
/// Persisted to `info.txt` as an integer: 0 = `ToDownload`,
/// 1 = `Downloading`, 2 = `Downloaded`. The mapping is stable; recovery
/// accepts only entries whose snapshot reads `Downloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    ToDownload,
    Downloading,
    Downloaded,
}

impl FileStatus {
    pub fn as_code(self) -> u32 {
        match self {
            FileStatus::ToDownload => 0,
            FileStatus::Downloading => 1,
            FileStatus::Downloaded => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FileStatus::ToDownload),
            1 => Some(FileStatus::Downloading),
            2 => Some(FileStatus::Downloaded),
            _ => None,
        }
    }
}

/// Result of waiting for more bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Bytes below the frontier are readable.
    Ready,
    /// The requested range lies beyond the final size of the entry, or
    /// the entry was invalidated before the range became readable.
    EndOfFile,
}

/// Snapshot persisted to `info.txt`.
#[derive(Deserialize)]
struct EntryInfo {
    file_status: u32,
    metadata_class: String,
}

struct ControllerState {
    status: FileStatus,
    /// Bytes of `data.bin` durably written and visible to readers.
    frontier: u64,
    valid: bool,
    /// Set once the registry has dropped the entry from its index; the
    /// last reader to leave then deletes the directory.
    detached: bool,
    readers: HashSet<u64>,
}

/// Coordinates the download of one cached file with its readers.
pub struct CacheController {
    metadata: Arc<dyn RemoteFileMetadata>,
    local_path: PathBuf,
    flush_threshold: u64,
    state: Mutex<ControllerState>,
    more_data: Notify,
    next_reader_id: AtomicU64,
    stop: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    accounting: Mutex<Weak<CacheShared>>,
}

impl CacheController {
    fn new(
        metadata: Arc<dyn RemoteFileMetadata>,
        local_path: PathBuf,
        flush_threshold: u64,
        status: FileStatus,
        frontier: u64,
    ) -> Self {
        Self {
            metadata,
            local_path,
            flush_threshold,
            state: Mutex::new(ControllerState {
                status,
                frontier,
                valid: true,
                detached: false,
                readers: HashSet::new(),
            }),
            more_data: Notify::new(),
            next_reader_id: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            task: Mutex::new(None),
            accounting: Mutex::new(Weak::new()),
        }
    }

    /// Creates a fresh entry in `local_path`.
    ///
    /// The directory must not exist or be empty. Writes `metadata.txt`;
    /// the status snapshot is written when the download starts.
    pub async fn create(
        metadata: Arc<dyn RemoteFileMetadata>,
        local_path: impl Into<PathBuf>,
        flush_threshold: u64,
    ) -> Result<Arc<Self>, CacheError> {
        let controller = Self::new_fresh(metadata, local_path.into(), flush_threshold);
        controller.prepare_entry_dir().await?;
        Ok(controller)
    }

    /// A fresh controller that has not touched the disk yet; call
    /// [`prepare_entry_dir`](Self::prepare_entry_dir) before starting
    /// the download.
    pub(crate) fn new_fresh(
        metadata: Arc<dyn RemoteFileMetadata>,
        local_path: PathBuf,
        flush_threshold: u64,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            metadata,
            local_path,
            flush_threshold,
            FileStatus::ToDownload,
            0,
        ))
    }

    /// Creates the entry directory and writes `metadata.txt`.
    pub(crate) async fn prepare_entry_dir(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.local_path).await?;
        fs::write(self.local_path.join(METADATA_FILE), self.metadata.serialize()).await?;
        Ok(())
    }

    /// Recovers a completed entry from `local_path`.
    ///
    /// Returns `Ok(None)` when the directory does not hold a completed
    /// entry: `data.bin` is missing, `info.txt` is unreadable, or the
    /// snapshot shows a pre-`Downloaded` status. The caller deletes
    /// such directories. An unregistered metadata class and an
    /// unparseable `metadata.txt` are hard errors; the caller must
    /// delete those directories too, after its scan.
    ///
    /// A recovered controller is immediately readable; no download task
    /// is scheduled and its frontier equals the on-disk payload size.
    pub async fn recover(
        local_path: impl Into<PathBuf>,
        factory: &MetadataFactory,
        flush_threshold: u64,
    ) -> Result<Option<Arc<Self>>, CacheError> {
        let local_path = local_path.into();
        let data_meta = match fs::metadata(local_path.join(DATA_FILE)).await {
            Ok(meta) => meta,
            Err(_) => {
                trace!(path = %local_path.display(), "not a cached entry: no data file");
                return Ok(None);
            }
        };
        let info = match Self::load_info(&local_path).await {
            Some(info) => info,
            None => {
                debug!(path = %local_path.display(), "discarding entry without a status snapshot");
                return Ok(None);
            }
        };
        if info.file_status != FileStatus::Downloaded.as_code() {
            debug!(
                path = %local_path.display(),
                status = info.file_status,
                "discarding entry that never finished downloading"
            );
            return Ok(None);
        }

        let raw = fs::read_to_string(local_path.join(METADATA_FILE)).await?;
        let metadata = factory.parse(&info.metadata_class, &raw)?;

        Ok(Some(Arc::new(Self::new(
            metadata,
            local_path,
            flush_threshold,
            FileStatus::Downloaded,
            data_meta.len(),
        ))))
    }

    async fn load_info(local_path: &Path) -> Option<EntryInfo> {
        let raw = fs::read_to_string(local_path.join(INFO_FILE)).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Opens `data.bin` for writing and schedules the background
    /// download of `source`.
    ///
    /// The entry must be freshly created (status `ToDownload`).
    pub async fn start_background_download<S>(self: &Arc<Self>, source: S) -> Result<(), CacheError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        debug_assert_eq!(self.status(), FileStatus::ToDownload);
        let writer = File::create(self.local_path.join(DATA_FILE)).await?;
        self.write_info(FileStatus::ToDownload).await?;

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move { controller.download(writer, source).await });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn download<S>(self: Arc<Self>, mut writer: File, mut source: S)
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        self.state.lock().status = FileStatus::Downloading;
        let mut unflushed: u64 = 0;

        while let Some(next) = source.next().await {
            if self.stop.load(Ordering::Acquire) {
                trace!(path = %self.local_path.display(), "download stopped before completion");
                return;
            }
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(
                        path = %self.local_path.display(),
                        error = %err,
                        "remote source failed, invalidating entry"
                    );
                    self.invalidate();
                    return;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            if let Err(err) = writer.write_all(&chunk).await {
                warn!(
                    path = %self.local_path.display(),
                    error = %err,
                    "writing cached data failed, invalidating entry"
                );
                self.invalidate();
                return;
            }
            unflushed += chunk.len() as u64;

            if unflushed >= self.flush_threshold {
                // The data must be durable before the frontier that
                // exposes it is published.
                if let Err(err) = writer.sync_data().await {
                    warn!(
                        path = %self.local_path.display(),
                        error = %err,
                        "flushing cached data failed, invalidating entry"
                    );
                    self.invalidate();
                    return;
                }
                let frontier = {
                    let mut state = self.state.lock();
                    state.frontier += unflushed;
                    state.frontier
                };
                self.more_data.notify_waiters();
                trace!(path = %self.local_path.display(), frontier, "published new frontier");
                unflushed = 0;
            }
        }

        if let Err(err) = writer.sync_data().await {
            warn!(
                path = %self.local_path.display(),
                error = %err,
                "flushing cached data failed, invalidating entry"
            );
            self.invalidate();
            return;
        }
        let total = {
            let mut state = self.state.lock();
            state.frontier += unflushed;
            state.status = FileStatus::Downloaded;
            state.frontier
        };
        if let Err(err) = self.write_info(FileStatus::Downloaded).await {
            warn!(
                path = %self.local_path.display(),
                error = %err,
                "writing status snapshot failed"
            );
        }
        drop(writer);
        self.more_data.notify_waiters();

        let accounting = self.accounting.lock().upgrade();
        if let Some(cache) = accounting {
            cache.reconcile_size(self.metadata.file_size(), total);
        }
        debug!(
            path = %self.local_path.display(),
            bytes = total,
            "finished downloading remote file"
        );
    }

    /// Blocks until bytes up to `end_offset` are readable, the entry
    /// finishes downloading, or the entry is invalidated.
    ///
    /// Returns [`WaitOutcome::EndOfFile`] when `start_offset` lies at
    /// or beyond the final size of a downloaded entry, or when the
    /// entry was invalidated. Otherwise returns [`WaitOutcome::Ready`];
    /// the reader re-checks end of file on its next call.
    pub async fn wait_more_data(&self, start_offset: u64, end_offset: u64) -> WaitOutcome {
        loop {
            let notified = self.more_data.notified();
            tokio::pin!(notified);
            // Register interest before checking the predicate so a
            // publication between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.status == FileStatus::Downloaded {
                    if start_offset >= state.frontier {
                        return WaitOutcome::EndOfFile;
                    }
                    return WaitOutcome::Ready;
                }
                if !state.valid {
                    return WaitOutcome::EndOfFile;
                }
                if state.frontier >= end_offset {
                    return WaitOutcome::Ready;
                }
            }
            notified.await;
        }
    }

    /// Opens a new reader over `data.bin` and records it in the open
    /// set. Refused once the entry has been invalidated.
    pub async fn open_reader(self: &Arc<Self>) -> Result<CachedFileReader, CacheError> {
        let file = File::open(self.local_path.join(DATA_FILE)).await?;
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if !state.valid {
                return Err(CacheError::Invalidated);
            }
            state.readers.insert(id);
        }
        Ok(CachedFileReader::new(Arc::clone(self), file, id))
    }

    /// Releases a reader previously granted by
    /// [`open_reader`](Self::open_reader).
    ///
    /// Unknown and already-released handles are an error. When the last
    /// reader of a detached entry leaves, the entry directory is
    /// deleted.
    pub fn release_reader(&self, id: u64) -> Result<(), CacheError> {
        let orphaned = {
            let mut state = self.state.lock();
            if !state.readers.remove(&id) {
                return Err(CacheError::InvalidReaderHandle(id));
            }
            state.readers.is_empty() && state.detached
        };
        if orphaned {
            trace!(
                path = %self.local_path.display(),
                "last reader left a detached entry, removing directory"
            );
            self.remove_dir_best_effort();
        }
        Ok(())
    }

    /// True when `other` describes a different revision of the remote
    /// file than this entry holds.
    pub fn is_modified(&self, other: &dyn RemoteFileMetadata) -> bool {
        self.metadata.version() != other.version()
    }

    /// Marks the entry invalid and wakes all waiting readers.
    ///
    /// New readers are refused from this point on; waiters observe end
    /// of file.
    pub fn invalidate(&self) {
        self.state.lock().valid = false;
        self.more_data.notify_waiters();
    }

    /// Signals the download task to stop and waits until it is no
    /// longer executing. The entry directory is left in place.
    pub async fn deactivate(&self) {
        self.stop.store(true, Ordering::Release);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(
                    path = %self.local_path.display(),
                    error = %err,
                    "download task ended abnormally"
                );
            }
        }
    }

    /// Deletes the entry directory.
    ///
    /// The caller must ensure no readers are open and the download task
    /// has been deactivated.
    pub async fn close(&self) -> Result<(), CacheError> {
        trace!(path = %self.local_path.display(), "removing cached entry directory");
        match fs::remove_dir_all(&self.local_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn status(&self) -> FileStatus {
        self.state.lock().status
    }

    /// Greatest byte offset guaranteed to be present in `data.bin`.
    pub fn frontier(&self) -> u64 {
        self.state.lock().frontier
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// True when the entry has no open readers and no running download
    /// task. Only idle entries may be evicted.
    pub fn is_idle(&self) -> bool {
        let has_readers = !self.state.lock().readers.is_empty();
        let task_running = self
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        !has_readers && !task_running
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn metadata(&self) -> &Arc<dyn RemoteFileMetadata> {
        &self.metadata
    }

    /// Declared byte length of the remote file.
    pub fn file_size(&self) -> u64 {
        self.metadata.file_size()
    }

    pub(crate) fn set_accounting(&self, shared: Weak<CacheShared>) {
        *self.accounting.lock() = shared;
    }

    /// Invalidates the entry and detaches it from its registry in one
    /// step: waiters observe end of file, new readers are refused, and
    /// the directory is deleted by the last reader to leave, or right
    /// here when none is open. Both flags flip under one lock so a
    /// concurrent release cannot slip between them and leak the
    /// directory.
    pub(crate) fn detach(&self) {
        let orphaned = {
            let mut state = self.state.lock();
            state.valid = false;
            state.detached = true;
            state.readers.is_empty()
        };
        self.more_data.notify_waiters();
        if orphaned {
            trace!(
                path = %self.local_path.display(),
                "detached entry has no readers, removing directory"
            );
            self.remove_dir_best_effort();
        }
    }

    fn remove_dir_best_effort(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.local_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    path = %self.local_path.display(),
                    error = %err,
                    "failed to remove entry directory"
                );
            }
        }
    }

    async fn write_info(&self, status: FileStatus) -> Result<(), CacheError> {
        let payload = serde_json::json!({
            "file_status": status.as_code(),
            "metadata_class": self.metadata.class_name(),
        })
        .to_string();
        fs::write(self.local_path.join(INFO_FILE), payload).await?;
        Ok(())
    }
}

impl fmt::Debug for CacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheController")
            .field("local_path", &self.local_path)
            .field("status", &self.status())
            .field("frontier", &self.frontier())
            .finish_non_exhaustive()
    }
}
