//! The cache pool: one live [`FileCacheEntry`] per open path.
//!
//! The pool hands out shared entries on `open`/`create`, and on the last
//! `close` decides what must happen before an entry can be dropped:
//!
//! - clean and fully local: dropped immediately
//! - dirty or stale-local: an upload job is queued
//! - download still partial: a download job is queued to finish it
//!
//! Queued entries stay registered until their job finishes, so a reopen in
//! the meantime gets the same entry back and the job stands down.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use kpfs_core::{NodeRef, NodeTree, RemoteStore, TreeError, path};
use tracing::{Span, debug, error, info, trace, warn};

use crate::config::CacheConfig;
use crate::entry::{FileCacheEntry, ModifiedState, Step};
use crate::error::{CacheError, CacheResult, IoContext};
use crate::eviction::evict_stale;
use crate::paths::CachePaths;
use crate::registry::EntryTable;
use crate::worker::{Job, JobHandler, JobOutcome, WorkerPool, WorkerStats};

/// State shared between the pool and its background workers.
struct PoolShared {
    entries: EntryTable,
    tree: Arc<NodeTree>,
    store: Arc<dyn RemoteStore>,
    paths: CachePaths,
    config: CacheConfig,
    span: Span,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("root", &self.paths.root())
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Registry of open files backed by a local cache directory.
#[derive(Debug)]
pub struct CachePool {
    shared: Arc<PoolShared>,
    workers: WorkerPool,
}

impl CachePool {
    /// Opens a cache rooted at `root`, creating the directory if needed.
    ///
    /// Cache files not accessed within `config.retention` are removed before
    /// the pool starts. Pool, entry, and worker events are logged under
    /// `span`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotADirectory`] if `root` exists but is not a
    /// directory, or an I/O error if it cannot be created.
    pub fn new(
        root: impl Into<PathBuf>,
        tree: Arc<NodeTree>,
        config: CacheConfig,
        span: Span,
    ) -> CacheResult<Self> {
        let root = root.into();
        match fs::metadata(&root) {
            Ok(meta) if !meta.is_dir() => return Err(CacheError::NotADirectory(root)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&root).at(&root)?;
            }
            Err(e) => return Err(CacheError::io(root, e)),
        }

        let report = evict_stale(&root, config.retention, SystemTime::now())?;
        info!(
            parent: &span,
            root = %root.display(),
            files = report.files_removed,
            dirs = report.dirs_removed,
            bytes = report.bytes_freed,
            "Startup eviction finished"
        );

        let shared = Arc::new(PoolShared {
            entries: EntryTable::new(),
            store: Arc::clone(tree.store()),
            tree,
            paths: CachePaths::new(root),
            config,
            span,
        });
        let workers = WorkerPool::new(
            Arc::clone(&shared) as Arc<dyn JobHandler>,
            shared.config.worker_threads,
            shared.config.queue_capacity,
            &shared.span,
        )?;

        Ok(Self { shared, workers })
    }

    /// Opens an existing remote file and returns its shared entry.
    ///
    /// On failure the reference taken here is released again.
    pub fn open(&self, path: &str, flags: i32) -> CacheResult<Arc<FileCacheEntry>> {
        let _enter = self.shared.span.enter();
        let path = path::normalize(path);

        let entry = match self.shared.entries.acquire(&path) {
            Some(entry) => entry,
            None => {
                let attr = self.shared.tree.file_attr(&path)?;
                let cache_path = self.shared.paths.cache_path(&path)?;
                self.shared.entries.acquire_or_insert(&path, || {
                    FileCacheEntry::new(path.clone(), cache_path, attr, &self.shared.span)
                })
            }
        };
        trace!(path = %path, refcount = entry.refcount(), "Open");

        if let Err(e) = entry.open(self.shared.store.as_ref(), flags) {
            warn!(path = %path, error = %e, "Open failed");
            self.rollback(&entry);
            return Err(e);
        }
        Ok(entry)
    }

    /// Creates a new file and returns its entry.
    ///
    /// With `placeholder_on_create` (the default) an empty file is uploaded
    /// right away and the entry starts clean, so closing it unwritten costs
    /// no upload. Otherwise, and for temporary files, it starts dirty.
    pub fn create(&self, path: &str) -> CacheResult<Arc<FileCacheEntry>> {
        let _enter = self.shared.span.enter();
        let path = path::normalize(path);

        let attr = match self.shared.tree.create(&path, false)? {
            NodeRef::File { attr, .. } => attr,
            NodeRef::Directory { .. } => return Err(TreeError::IsADirectory { path }.into()),
        };
        let cache_path = self.shared.paths.cache_path(&path)?;
        let entry = self.shared.entries.acquire_or_insert(&path, || {
            FileCacheEntry::new(path.clone(), cache_path, attr, &self.shared.span)
        });

        if let Err(e) = entry.create() {
            warn!(path = %path, error = %e, "Create failed");
            self.rollback(&entry);
            return Err(e);
        }

        if self.shared.config.placeholder_on_create && !entry.is_ignored() {
            match entry.upload(self.shared.store.as_ref()) {
                Ok(_) => debug!(path = %path, "Uploaded placeholder"),
                // The file is still dirty; the close-time upload covers it.
                Err(e) => warn!(path = %path, error = %e, "Placeholder upload failed"),
            }
        }
        Ok(entry)
    }

    /// Releases one reference to `path`.
    ///
    /// The last close finalizes the entry: it is dropped right away, or
    /// queued for a background upload or download.
    pub fn close(&self, path: &str) -> CacheResult<()> {
        let _enter = self.shared.span.enter();
        let path = path::normalize(path);
        let entry = self
            .shared
            .entries
            .get(&path)
            .ok_or_else(|| CacheError::NotOpen(path.clone()))?;

        let remaining = entry
            .release_ref()
            .map_err(|_| CacheError::NotOpen(path.clone()))?;
        if remaining > 0 {
            trace!(path = %path, remaining, "Close with handles remaining");
            return Ok(());
        }
        self.finalize(&entry)
    }

    /// Renames the cache file (or directory) for `old` to `new` and re-keys
    /// every live entry at or below `old`.
    ///
    /// Open handles keep working and are closed under the new path.
    pub fn move_path(&self, old: &str, new: &str) -> CacheResult<()> {
        let _enter = self.shared.span.enter();
        let old = path::normalize(old);
        let new = path::normalize(new);
        let from = self.shared.paths.cache_path(&old)?;
        let to = self.shared.paths.cache_path(&new)?;

        match fs::symlink_metadata(&from) {
            Ok(_) => {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).at(parent)?;
                }
                fs::rename(&from, &to).at(&from)?;
                debug!(from = %old, to = %new, "Moved cache file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(from = %old, "No cache file to move");
            }
            Err(e) => return Err(CacheError::io(from, e)),
        }

        let rekeyed = self.shared.entries.rekey(&old, &new);
        for (new_path, entry) in rekeyed.moved {
            let cache_path = self.shared.paths.cache_path(&new_path)?;
            entry.relocate(new_path, cache_path);
        }
        for displaced in rekeyed.displaced {
            warn!(
                path = %displaced.path(),
                refcount = displaced.refcount(),
                "Move replaced an open entry; its pending changes are dropped"
            );
            displaced.discard();
        }
        Ok(())
    }

    /// Forgets `path` after it was deleted remotely: live entries at or
    /// below it are discarded (no deferred upload runs) and the local cache
    /// file or directory is removed.
    pub fn discard(&self, path: &str) -> CacheResult<()> {
        let _enter = self.shared.span.enter();
        let path = path::normalize(path);

        for (key, entry) in self.shared.entries.within(&path) {
            entry.discard();
            self.shared.entries.remove_if_unreferenced(&key, &entry);
        }

        let local = self.shared.paths.cache_path(&path)?;
        let removed = match fs::symlink_metadata(&local) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&local),
            Ok(_) => fs::remove_file(&local),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(path = %path, "Removed cache file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(local, e)),
        }
        Ok(())
    }

    /// The live entry for `path`, without taking a reference.
    pub fn get(&self, path: &str) -> Option<Arc<FileCacheEntry>> {
        self.shared.entries.get(&path::normalize(path))
    }

    /// Returns true if an entry for `path` is registered.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Returns true if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Blocks until every queued and running background job has finished.
    pub fn wait_idle(&self) {
        self.workers.wait_idle();
    }

    /// Background worker counters.
    pub fn stats(&self) -> &WorkerStats {
        self.workers.stats()
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        self.shared.paths.root()
    }

    /// Active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// The metadata tree entries resolve against.
    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.shared.tree
    }

    /// Drains the background queue and stops the workers.
    pub fn shutdown(self) {
        info!(parent: &self.shared.span, pending = self.workers.queue_depth(), "Shutting down cache pool");
        self.workers.shutdown();
    }

    /// Decides what happens to an entry whose last reference is gone.
    fn finalize(&self, entry: &Arc<FileCacheEntry>) -> CacheResult<()> {
        let disposable = entry.close()?;
        if entry.refcount() > 0 {
            // Reopened meanwhile; the next close finalizes.
            return Ok(());
        }

        let path = entry.path();
        let job = if disposable {
            None
        } else if entry.state() != ModifiedState::Clean {
            Some(Job::Upload(Arc::clone(entry)))
        } else if !entry.completed() {
            Some(Job::Download(Arc::clone(entry)))
        } else {
            None
        };

        let Some(job) = job else {
            if self.shared.entries.remove_if_unreferenced(&path, entry) {
                trace!(path = %path, "Dropped entry");
            }
            return Ok(());
        };

        debug!(path = %path, kind = job.kind(), "Scheduling background job");
        self.workers.try_submit(job).map_err(|(e, job)| {
            warn!(path = %path, kind = job.kind(), error = %e, "Could not schedule background job");
            CacheError::Submit(e)
        })
    }

    /// Undoes the reference taken by a failed `open`/`create`.
    fn rollback(&self, entry: &Arc<FileCacheEntry>) {
        match entry.release_ref() {
            Ok(0) => {
                if let Err(e) = self.finalize(entry) {
                    warn!(path = %entry.path(), error = %e, "Cleanup after failed open failed");
                }
            }
            Ok(_) => {}
            Err(e) => error!(path = %entry.path(), error = %e, "Rollback failed"),
        }
    }
}

impl JobHandler for PoolShared {
    fn handle(&self, job: &Job) -> JobOutcome {
        match job {
            Job::Upload(entry) => {
                if !self.config.upload_delay.is_zero() {
                    thread::sleep(self.config.upload_delay);
                }
                // A failed upload keeps the entry registered and dirty; the
                // next open/close cycle schedules it again.
                self.drive(entry, "upload", || entry.upload_step(self.store.as_ref()))
            }
            Job::Download(entry) => {
                let outcome = self.drive(entry, "download", || {
                    entry.download_step(self.config.download_chunk)
                });
                // Nothing was persisted; the next open downloads afresh.
                if outcome == JobOutcome::Failed && entry.abandon_download() {
                    self.entries.remove_if_unreferenced(&entry.path(), entry);
                }
                outcome
            }
        }
    }
}

impl PoolShared {
    /// Runs `step` until it finishes, retrying transient remote failures
    /// with backoff. Removes the entry once done if nobody reopened it.
    fn drive(
        &self,
        entry: &Arc<FileCacheEntry>,
        kind: &'static str,
        mut step: impl FnMut() -> CacheResult<Step>,
    ) -> JobOutcome {
        let mut attempt = 0;
        loop {
            match step() {
                Ok(Step::Continue) => attempt = 0,
                Ok(Step::Done) => {
                    let path = entry.path();
                    if self.entries.remove_if_unreferenced(&path, entry) {
                        debug!(path = %path, kind, "Background job finished, entry dropped");
                    }
                    return JobOutcome::Completed;
                }
                Ok(Step::Aborted) => {
                    debug!(path = %entry.path(), kind, "Entry reopened, background job stands down");
                    return JobOutcome::Aborted;
                }
                Err(CacheError::Remote(e)) if e.is_transient() && attempt < self.config.worker_retries => {
                    attempt += 1;
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        path = %entry.path(),
                        kind,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Background job failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(e) => {
                    error!(path = %entry.path(), kind, error = %e, "Background job failed");
                    return JobOutcome::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpfs_core::MemoryStore;
    use std::time::{Duration, UNIX_EPOCH};

    fn pool_with(store: &Arc<MemoryStore>, config: CacheConfig) -> (tempfile::TempDir, CachePool) {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(NodeTree::new(Arc::clone(store) as Arc<dyn RemoteStore>));
        let pool = CachePool::new(dir.path().join("cache"), tree, config, Span::none()).unwrap();
        (dir, pool)
    }

    fn quick() -> CacheConfig {
        CacheConfig::default()
            .upload_delay(Duration::ZERO)
            .retries(2, Duration::from_millis(1))
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let tree = Arc::new(NodeTree::new(Arc::new(MemoryStore::new())));
        let err = CachePool::new(&file, tree, quick(), Span::none()).unwrap_err();
        assert!(matches!(err, CacheError::NotADirectory(_)));
    }

    #[test]
    fn test_open_missing_file_leaves_no_entry() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());
        let err = pool.open("/missing", 0).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_failed_download_start_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        store.insert_file("/f", b"data", UNIX_EPOCH + Duration::from_secs(1_000));
        store.fail_next_downloads(1);
        let (_dir, pool) = pool_with(&store, quick());

        assert!(pool.open("/f", 0).is_err());
        pool.wait_idle();
        assert!(pool.is_empty());

        let entry = pool.open("/f", 0).unwrap();
        assert_eq!(entry.read(0, 4).unwrap(), b"data");
    }

    #[test]
    fn test_close_unknown_path() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());
        assert!(matches!(pool.close("/nope"), Err(CacheError::NotOpen(_))));
    }

    #[test]
    fn test_double_close_is_not_open() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());
        let entry = pool.create("/a").unwrap();
        entry.write(0, b"x").unwrap();
        pool.close("/a").unwrap();
        // Whether or not the upload job has dropped the entry yet, a second
        // close must not underflow.
        assert!(matches!(pool.close("/a"), Err(CacheError::NotOpen(_))));
        pool.wait_idle();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_upload_failure_keeps_entry_dirty_then_retries_on_reopen() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());
        store.fail_next_uploads(10);

        let entry = pool.create("/a.txt").unwrap();
        entry.write(0, b"hello").unwrap();
        pool.close("/a.txt").unwrap();
        pool.wait_idle();

        assert!(pool.contains("/a.txt"));
        assert_eq!(entry.state(), ModifiedState::Dirty);
        assert_eq!(pool.stats().jobs_failed.load(std::sync::atomic::Ordering::Relaxed), 1);

        store.fail_next_uploads(0);
        let again = pool.open("/a.txt", 0).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        pool.close("/a.txt").unwrap();
        pool.wait_idle();

        assert!(pool.is_empty());
        assert_eq!(store.contents("/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_transient_upload_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());
        store.fail_next_uploads(2);

        let entry = pool.create("/r.txt").unwrap();
        entry.write(0, b"retry").unwrap();
        pool.close("/r.txt").unwrap();
        pool.wait_idle();

        assert!(pool.is_empty());
        assert_eq!(store.contents("/r.txt").unwrap(), b"retry");
    }

    #[test]
    fn test_move_rekeys_open_entry() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());

        let entry = pool.create("/old.txt").unwrap();
        entry.write(0, b"moved").unwrap();
        store.move_path("/old.txt", "/new.txt").unwrap();
        pool.tree().move_node("/old.txt", "/new.txt").unwrap();
        pool.move_path("/old.txt", "/new.txt").unwrap();

        assert!(!pool.contains("/old.txt"));
        assert_eq!(entry.path(), "/new.txt");
        assert!(entry.cache_path().ends_with("new.txt"));

        pool.close("/new.txt").unwrap();
        pool.wait_idle();
        assert_eq!(store.contents("/new.txt").unwrap(), b"moved");
        assert!(!store.exists("/old.txt"));
    }

    #[test]
    fn test_discard_cancels_pending_upload() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick());

        let entry = pool.create("/gone.txt").unwrap();
        entry.write(0, b"bye").unwrap();
        let cache = entry.cache_path();
        pool.discard("/gone.txt").unwrap();
        assert!(!cache.exists());

        pool.close("/gone.txt").unwrap();
        pool.wait_idle();
        assert!(pool.is_empty());
        // Only the placeholder from create ever reached the remote.
        assert_eq!(store.upload_count("/gone.txt"), 1);
        assert_eq!(store.contents("/gone.txt").unwrap(), b"");
    }

    #[test]
    fn test_failed_background_download_drops_entry() {
        let store = Arc::new(MemoryStore::new());
        store.insert_file("/short.bin", b"0123456789", UNIX_EPOCH + Duration::from_secs(1_000));
        let (_dir, pool) = pool_with(&store, quick());

        let entry = pool.open("/short.bin", 0).unwrap();
        // The remote promised more than it will deliver.
        entry.attr().write().size = 20;
        pool.close("/short.bin").unwrap();
        pool.wait_idle();

        assert_eq!(pool.stats().jobs_failed.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_placeholder_upload_leaves_created_entry_clean() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, pool) = pool_with(&store, quick().placeholder_on_create(false));
        let unsent = pool.create("/off.txt").unwrap();
        assert_eq!(unsent.state(), ModifiedState::Dirty);
        assert_eq!(store.upload_count("/off.txt"), 0);

        let (_dir2, pool2) = pool_with(&store, quick());
        let sent = pool2.create("/on.txt").unwrap();
        assert_eq!(sent.state(), ModifiedState::Clean);
        assert_eq!(store.upload_count("/on.txt"), 1);
    }
}
