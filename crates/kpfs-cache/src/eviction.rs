//! Startup sweep of stale cache files.
//!
//! Anything under the cache root whose last access is older than the
//! retention window is removed. A stale directory goes as a whole subtree;
//! directories left empty by the sweep are pruned deepest first. The root
//! itself always survives.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::{CacheResult, IoContext};

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Regular files deleted, including those inside removed directories.
    pub files_removed: u64,
    /// Directories deleted; a stale subtree counts once.
    pub dirs_removed: u64,
    /// Total size of the deleted files.
    pub bytes_freed: u64,
}

/// Removes cache content under `root` not accessed since `now - retention`.
///
/// Failures on individual items are logged and skipped; only an unreadable
/// root is an error.
pub fn evict_stale(root: &Path, retention: Duration, now: SystemTime) -> CacheResult<EvictionReport> {
    let mut report = EvictionReport::default();
    let Some(cutoff) = now.checked_sub(retention) else {
        return Ok(report);
    };
    let cutoff = FileTime::from_system_time(cutoff);

    // Fail early if the root itself cannot be read.
    fs::read_dir(root).at(root)?;

    let mut touched: BTreeSet<PathBuf> = BTreeSet::new();
    let mut walker = WalkDir::new(root).min_depth(1).into_iter();

    while let Some(item) = walker.next() {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable cache entry");
                continue;
            }
        };
        // Metadata is read before walkdir opens a directory, so listing it
        // has not refreshed its atime yet.
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Cannot stat cache entry");
                continue;
            }
        };
        if FileTime::from_last_access_time(&meta) >= cutoff {
            continue;
        }

        if meta.is_dir() {
            walker.skip_current_dir();
            let (files, bytes) = subtree_usage(entry.path());
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), files, "Evicted stale directory");
                    report.files_removed += files;
                    report.bytes_freed += bytes;
                    report.dirs_removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to evict directory"),
            }
        } else {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    trace!(path = %entry.path().display(), "Evicted stale file");
                    report.files_removed += 1;
                    report.bytes_freed += meta.len();
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to evict file");
                    continue;
                }
            }
        }
        record_ancestors(root, entry.path(), &mut touched);
    }

    report.dirs_removed += prune_empty(touched);
    Ok(report)
}

/// Adds every directory strictly between `root` and `path`.
fn record_ancestors(root: &Path, path: &Path, touched: &mut BTreeSet<PathBuf>) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        touched.insert(dir.to_path_buf());
        current = dir.parent();
    }
}

/// Removes directories from `candidates` that are now empty, deepest first.
fn prune_empty(candidates: BTreeSet<PathBuf>) -> u64 {
    let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
    ordered.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));

    let mut removed = 0;
    for dir in ordered {
        let empty = fs::read_dir(&dir).is_ok_and(|mut it| it.next().is_none());
        if empty && fs::remove_dir(&dir).is_ok() {
            trace!(path = %dir.display(), "Pruned empty directory");
            removed += 1;
        }
    }
    removed
}

/// Counts regular files and their total size below `dir`.
fn subtree_usage(dir: &Path) -> (u64, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(fs::Metadata::is_file)
        .fold((0, 0), |(files, bytes), meta| (files + 1, bytes + meta.len()))
}
