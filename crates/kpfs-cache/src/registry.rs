//! Concurrent registry of live cache entries.
//!
//! Backed by `DashMap`. Reference counts are adjusted while the entry's shard
//! lock is held, so a lookup that takes a reference and a removal that checks
//! for zero references can never interleave: an entry is either found and
//! referenced, or already gone.

use std::sync::Arc;

use dashmap::DashMap;
use kpfs_core::path;

use crate::entry::FileCacheEntry;

/// Entries re-keyed by [`EntryTable::rekey`].
#[derive(Debug, Default)]
pub struct Rekeyed {
    /// `(new path, entry)` for every entry that moved.
    pub moved: Vec<(String, Arc<FileCacheEntry>)>,
    /// Entries that previously lived at a destination path.
    pub displaced: Vec<Arc<FileCacheEntry>>,
}

/// Map from logical path to the single live entry for that path.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: DashMap<String, Arc<FileCacheEntry>>,
}

impl EntryTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `path` without taking a reference.
    pub fn get(&self, path: &str) -> Option<Arc<FileCacheEntry>> {
        self.entries.get(path).map(|e| Arc::clone(e.value()))
    }

    /// Returns the entry for `path` with its reference count incremented.
    pub fn acquire(&self, path: &str) -> Option<Arc<FileCacheEntry>> {
        self.entries.get(path).map(|e| {
            e.add_ref();
            Arc::clone(e.value())
        })
    }

    /// Like [`acquire`](Self::acquire), inserting `make()` first if no entry
    /// exists. Concurrent callers for the same path get the same entry.
    pub fn acquire_or_insert(
        &self,
        path: &str,
        make: impl FnOnce() -> FileCacheEntry,
    ) -> Arc<FileCacheEntry> {
        let entry = self
            .entries
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(make()));
        entry.add_ref();
        Arc::clone(entry.value())
    }

    /// Removes `entry` from `path` if it is still the registered entry,
    /// holds no references, and has no pending upload or download.
    ///
    /// A handle can reopen, write, and close between a background job's last
    /// step and this call; the entry then stays for the job that close queued.
    pub fn remove_if_unreferenced(&self, path: &str, entry: &Arc<FileCacheEntry>) -> bool {
        self.entries
            .remove_if(path, |_, current| {
                Arc::ptr_eq(current, entry) && current.refcount() == 0 && current.is_settled()
            })
            .is_some()
    }

    /// Entries at `root` or below it.
    pub fn within(&self, root: &str) -> Vec<(String, Arc<FileCacheEntry>)> {
        self.entries
            .iter()
            .filter(|e| path::is_within(e.key(), root))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Moves every entry at or below `from` to the same position below `to`.
    ///
    /// The entries themselves are not relocated; callers update each moved
    /// entry's paths.
    pub fn rekey(&self, from: &str, to: &str) -> Rekeyed {
        let mut out = Rekeyed::default();
        for (old_key, _) in self.within(from) {
            let Some((_, entry)) = self.entries.remove(&old_key) else {
                continue;
            };
            let new_key = path::rebase(&old_key, from, to);
            if let Some(previous) = self.entries.insert(new_key.clone(), Arc::clone(&entry)) {
                out.displaced.push(previous);
            }
            out.moved.push((new_key, entry));
        }
        out
    }

    /// Registered paths, unordered.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
