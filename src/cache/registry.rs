//! The process-wide cache of remote files.
//!
//! The registry maps remote identifiers to live controllers, enforces
//! the configured on-disk byte budget with LRU eviction of idle
//! entries, and reloads completed entries from the cache root on
//! startup.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::controller::CacheController;
use super::error::CacheError;
use crate::config::CacheConfig;
use crate::metadata::{MetadataFactory, RemoteFileMetadata};

/// State shared with controllers, which hold a weak reference back for
/// size reconciliation when a download completes.
pub(crate) struct CacheShared {
    config: CacheConfig,
    factory: MetadataFactory,
    /// Sum of declared sizes of admitted entries. Reserved once at
    /// admission (or recovery) and reconciled by the download task.
    total_bytes: AtomicU64,
    index: Mutex<CacheIndex>,
}

impl CacheShared {
    /// Adjusts the running total by the difference between the final
    /// downloaded size and the size reserved at admission. Idempotent
    /// in the common case: the two are equal and nothing changes.
    pub(crate) fn reconcile_size(&self, declared: u64, actual: u64) {
        if actual > declared {
            self.total_bytes.fetch_add(actual - declared, Ordering::SeqCst);
        } else if declared > actual {
            self.total_bytes.fetch_sub(declared - actual, Ordering::SeqCst);
        }
    }
}

struct CacheIndex {
    entries: HashMap<String, Arc<CacheController>>,
    /// Recency order over keys, least recently used first.
    order: VecDeque<String>,
}

impl CacheIndex {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn insert(&mut self, key: String, controller: Arc<CacheController>) {
        self.order.push_back(key.clone());
        self.entries.insert(key, controller);
    }

    fn remove(&mut self, key: &str) -> Option<Arc<CacheController>> {
        let controller = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(controller)
    }

    /// Removes and returns the least recently used idle entry.
    fn pop_idle(&mut self) -> Option<Arc<CacheController>> {
        let key = self
            .order
            .iter()
            .find(|key| self.entries.get(*key).is_some_and(|c| c.is_idle()))?
            .clone();
        self.remove(&key)
    }
}

/// The process-wide registry of cached remote files.
pub struct RemoteFileCache {
    shared: Arc<CacheShared>,
}

impl RemoteFileCache {
    /// Creates a cache over `config.root` using `factory` to parse
    /// recovered descriptors. Call [`recover`](Self::recover) before
    /// serving to reload entries left by a previous run.
    pub fn new(config: CacheConfig, factory: MetadataFactory) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                config,
                factory,
                total_bytes: AtomicU64::new(0),
                index: Mutex::new(CacheIndex {
                    entries: HashMap::new(),
                    order: VecDeque::new(),
                }),
            }),
        }
    }

    /// Returns the controller for `metadata`, creating it and starting
    /// its background download when absent or stale.
    ///
    /// `make_source` is invoked only when a new download is started.
    /// Admission reserves the descriptor's declared size, evicting idle
    /// entries in LRU order until the budget admits it; a descriptor
    /// larger than the whole budget is refused.
    pub async fn get_or_create<S, F>(
        &self,
        metadata: Arc<dyn RemoteFileMetadata>,
        make_source: F,
    ) -> Result<Arc<CacheController>, CacheError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
        F: FnOnce() -> S,
    {
        let key = metadata.remote_path().to_string();
        let dir = self.shared.config.root.join(entry_dir_name(metadata.as_ref()));
        let declared = metadata.file_size();
        let limit = self.shared.config.total_bytes_limit;
        if declared > limit {
            return Err(CacheError::ExceedsBudget {
                size: declared,
                limit,
            });
        }

        // Admission decisions and index mutations happen under the
        // lock; all controller I/O waits until it is released.
        let mut retired: Vec<Arc<CacheController>> = Vec::new();
        let admitted = {
            let mut index = self.shared.index.lock().await;
            let mut blocked_dir = false;
            if let Some(existing) = index.entries.get(&key).cloned() {
                if existing.is_valid() && !existing.is_modified(metadata.as_ref()) {
                    index.touch(&key);
                    return Ok(existing);
                }
                debug!(remote_path = %key, "replacing stale cache entry");
                index.remove(&key);
                self.shared
                    .total_bytes
                    .fetch_sub(existing.file_size(), Ordering::SeqCst);
                // Readers still pinning the directory the replacement
                // would reuse block the admission until they drain.
                blocked_dir =
                    existing.local_path() == dir.as_path() && existing.reader_count() > 0;
                retired.push(existing);
            }

            let mut admitted = if blocked_dir {
                Err(CacheError::Invalidated)
            } else {
                Ok(())
            };
            while admitted.is_ok()
                && self.shared.total_bytes.load(Ordering::Relaxed) + declared > limit
            {
                match index.pop_idle() {
                    Some(victim) => {
                        debug!(
                            path = %victim.local_path().display(),
                            "evicting idle cache entry for space"
                        );
                        self.shared
                            .total_bytes
                            .fetch_sub(victim.file_size(), Ordering::SeqCst);
                        retired.push(victim);
                    }
                    None => {
                        admitted = Err(CacheError::ExceedsBudget {
                            size: declared,
                            limit,
                        });
                    }
                }
            }

            admitted.map(|()| {
                let controller = CacheController::new_fresh(
                    Arc::clone(&metadata),
                    dir,
                    self.shared.config.flush_threshold,
                );
                controller.set_accounting(Arc::downgrade(&self.shared));
                self.shared.total_bytes.fetch_add(declared, Ordering::SeqCst);
                index.insert(key.clone(), Arc::clone(&controller));
                controller
            })
        };

        // Stale and evicted entries are torn down first so a
        // replacement that reuses a directory finds it gone.
        for controller in retired {
            self.retire(controller).await;
        }
        let controller = admitted?;

        let started = async {
            controller.prepare_entry_dir().await?;
            controller.start_background_download(make_source()).await
        }
        .await;
        if let Err(err) = started {
            let mut index = self.shared.index.lock().await;
            if index
                .entries
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &controller))
            {
                index.remove(&key);
                self.shared.total_bytes.fetch_sub(declared, Ordering::SeqCst);
            }
            drop(index);
            self.retire(controller).await;
            return Err(err);
        }
        Ok(controller)
    }

    /// Returns the live controller for `remote_path`, if any, marking
    /// it recently used.
    pub async fn get(&self, remote_path: &str) -> Option<Arc<CacheController>> {
        let mut index = self.shared.index.lock().await;
        let controller = index.entries.get(remote_path).cloned()?;
        index.touch(remote_path);
        Some(controller)
    }

    /// Evicts the entry for `remote_path`, if present. Its directory is
    /// deleted once the last open reader has been released. Returns
    /// whether an entry was removed.
    pub async fn remove(&self, remote_path: &str) -> bool {
        let controller = self.shared.index.lock().await.remove(remote_path);
        match controller {
            Some(controller) => {
                self.shared
                    .total_bytes
                    .fetch_sub(controller.file_size(), Ordering::SeqCst);
                self.retire(controller).await;
                true
            }
            None => false,
        }
    }

    /// Scans the cache root and reloads completed entries.
    ///
    /// Directories that do not hold a completed entry are deleted after
    /// the scan, never during it. Returns the number of recovered
    /// entries.
    pub async fn recover(&self) -> Result<usize, CacheError> {
        fs::create_dir_all(&self.shared.config.root).await?;
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.shared.config.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        let mut discarded = Vec::new();
        let mut recovered = 0usize;
        {
            let mut index = self.shared.index.lock().await;
            for dir in dirs {
                match CacheController::recover(
                    &dir,
                    &self.shared.factory,
                    self.shared.config.flush_threshold,
                )
                .await
                {
                    Ok(Some(controller)) => {
                        let key = controller.metadata().remote_path().to_string();
                        if index.entries.contains_key(&key) {
                            warn!(
                                path = %dir.display(),
                                remote_path = %key,
                                "duplicate cached entry, discarding"
                            );
                            discarded.push(dir);
                            continue;
                        }
                        controller.set_accounting(Arc::downgrade(&self.shared));
                        self.shared
                            .total_bytes
                            .fetch_add(controller.file_size(), Ordering::SeqCst);
                        index.insert(key, controller);
                        recovered += 1;
                    }
                    Ok(None) => discarded.push(dir),
                    Err(err) => {
                        warn!(
                            path = %dir.display(),
                            error = %err,
                            "failed to recover cached entry, discarding"
                        );
                        discarded.push(dir);
                    }
                }
            }
        }

        for dir in discarded {
            debug!(path = %dir.display(), "removing unusable cache directory");
            if let Err(err) = fs::remove_dir_all(&dir).await {
                warn!(
                    path = %dir.display(),
                    error = %err,
                    "failed to remove cache directory"
                );
            }
        }
        debug!(
            root = %self.shared.config.root.display(),
            recovered,
            "cache recovery finished"
        );
        Ok(recovered)
    }

    pub async fn entry_count(&self) -> usize {
        self.shared.index.lock().await.entries.len()
    }

    /// Sum of declared sizes of admitted entries.
    pub fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.shared.config.total_bytes_limit
    }

    pub fn root(&self) -> &Path {
        &self.shared.config.root
    }

    /// Tears down an entry already removed from the index: detaches
    /// it, waits for its download task, and deletes its directory
    /// unless open readers defer that to the last release.
    async fn retire(&self, controller: Arc<CacheController>) {
        controller.detach();
        controller.deactivate().await;
        if controller.reader_count() == 0 {
            if let Err(err) = controller.close().await {
                warn!(
                    path = %controller.local_path().display(),
                    error = %err,
                    "failed to remove evicted entry directory"
                );
            }
        }
    }
}

/// Stable directory name for a descriptor: the hex SHA-256 of its
/// remote path and version. Including the version keeps a re-download
/// of a modified file out of the stale directory, which may still be
/// pinned by readers.
fn entry_dir_name(metadata: &dyn RemoteFileMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata.remote_path().as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.version().as_bytes());
    let digest = hasher.finalize();
    let mut name = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(name, "{byte:02x}");
    }
    name
}
