//! In-process remote store.
//!
//! [`MemoryStore`] keeps every file in memory and journals each call so tests
//! can assert which remote operations the cache issued (and which it did not).
//! It can also inject transient failures and cap how many bytes a download
//! stream yields per read.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::path;
use crate::remote::{
    NodeKind, RemoteError, RemoteMetadata, RemoteStore, RemoteStream, UploadBody,
    truncate_to_secs,
};

/// One journaled call against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `metadata(path)`
    Metadata(String),
    /// `list(dir)`
    List(String),
    /// `download(path)`
    Download(String),
    /// `upload(path, body, overwrite)`, with the bytes that were sent.
    Upload {
        /// Target path.
        path: String,
        /// Uploaded content.
        data: Vec<u8>,
        /// Overwrite flag as passed.
        overwrite: bool,
    },
    /// `delete(path, force)`
    Delete(String),
    /// `move_path(from, to)`
    Move {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },
    /// `mkdir(path, force)`
    Mkdir(String),
}

#[derive(Debug, Clone)]
enum StoredNode {
    File {
        data: Arc<[u8]>,
        ctime: SystemTime,
        mtime: SystemTime,
    },
    Dir {
        ctime: SystemTime,
        mtime: SystemTime,
    },
}

impl StoredNode {
    fn metadata(&self, path: &str) -> RemoteMetadata {
        match self {
            StoredNode::File { data, ctime, mtime } => RemoteMetadata {
                path: path.to_string(),
                kind: NodeKind::File,
                size: data.len() as u64,
                ctime: *ctime,
                mtime: *mtime,
            },
            StoredNode::Dir { ctime, mtime } => RemoteMetadata {
                path: path.to_string(),
                kind: NodeKind::Directory,
                size: 0,
                ctime: *ctime,
                mtime: *mtime,
            },
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, StoredNode>,
    calls: Vec<StoreCall>,
    failing_uploads: usize,
    failing_downloads: usize,
    read_limit: Option<usize>,
    clock: Option<SystemTime>,
}

impl State {
    fn now(&self) -> SystemTime {
        truncate_to_secs(self.clock.unwrap_or_else(SystemTime::now))
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(StoredNode::Dir { .. }))
    }

    /// Creates missing ancestor directories of `path`.
    fn ensure_parents(&mut self, path: &str, time: SystemTime) {
        let mut current = String::new();
        let components: Vec<&str> = path::components(path).collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(component);
            self.nodes
                .entry(current.clone())
                .or_insert(StoredNode::Dir {
                    ctime: time,
                    mtime: time,
                });
        }
    }

    fn require_parent_dir(&self, path: &str) -> Result<(), RemoteError> {
        let (parent, _) = path::split(path);
        match self.nodes.get(parent) {
            Some(StoredNode::Dir { .. }) => Ok(()),
            Some(StoredNode::File { .. }) => Err(RemoteError::NotADirectory {
                path: parent.to_string(),
            }),
            None => Err(RemoteError::not_found(parent)),
        }
    }

    fn paths_within(&self, root: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| path::is_within(p, root))
            .cloned()
            .collect()
    }
}

/// Remote store backed by an in-memory map.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store containing only the root directory.
    pub fn new() -> Self {
        let mut state = State::default();
        let now = state.now();
        state.nodes.insert(
            "/".to_string(),
            StoredNode::Dir {
                ctime: now,
                mtime: now,
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    /// Caps the number of bytes each `read` on a download stream returns.
    #[must_use]
    pub fn with_read_limit(self, limit: usize) -> Self {
        self.state.lock().read_limit = Some(limit.max(1));
        self
    }

    /// Seeds a file without journaling. Missing parents are created.
    pub fn insert_file(&self, path: &str, data: &[u8], mtime: SystemTime) {
        let path = path::normalize(path);
        let mtime = truncate_to_secs(mtime);
        let mut state = self.state.lock();
        state.ensure_parents(&path, mtime);
        state.nodes.insert(
            path,
            StoredNode::File {
                data: Arc::from(data),
                ctime: mtime,
                mtime,
            },
        );
    }

    /// Seeds a directory without journaling. Missing parents are created.
    pub fn insert_dir(&self, path: &str) {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        let now = state.now();
        state.ensure_parents(&path, now);
        state.nodes.entry(path).or_insert(StoredNode::Dir {
            ctime: now,
            mtime: now,
        });
    }

    /// Overrides the modification time of an existing node.
    pub fn set_mtime(&self, path: &str, mtime: SystemTime) {
        let path = path::normalize(path);
        let mtime = truncate_to_secs(mtime);
        let mut state = self.state.lock();
        if let Some(StoredNode::File { mtime: m, .. } | StoredNode::Dir { mtime: m, .. }) =
            state.nodes.get_mut(&path)
        {
            *m = mtime;
        }
    }

    /// Pins the time used for uploads and mkdir. `None` restores the wall clock.
    pub fn set_clock(&self, now: Option<SystemTime>) {
        self.state.lock().clock = now;
    }

    /// Current contents of a file, if it exists.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(&path::normalize(path)) {
            Some(StoredNode::File { data, .. }) => Some(data.to_vec()),
            _ => None,
        }
    }

    /// Returns true if a file or directory exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(&path::normalize(path))
    }

    /// Snapshot of the call journal.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Empties the call journal.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of uploads journaled for `path`.
    pub fn upload_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, StoreCall::Upload { path: p, .. } if p == path))
            .count()
    }

    /// Number of downloads journaled for `path`.
    pub fn download_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, StoreCall::Download(p) if p == path))
            .count()
    }

    /// Makes the next `count` uploads fail with a transient error.
    pub fn fail_next_uploads(&self, count: usize) {
        self.state.lock().failing_uploads = count;
    }

    /// Makes the next `count` downloads fail with a transient error.
    pub fn fail_next_downloads(&self, count: usize) {
        self.state.lock().failing_downloads = count;
    }
}

fn injected(path: &str) -> RemoteError {
    RemoteError::transient(
        path,
        io::Error::new(io::ErrorKind::TimedOut, "injected failure"),
    )
}

impl RemoteStore for MemoryStore {
    fn metadata(&self, path: &str) -> Result<RemoteMetadata, RemoteError> {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Metadata(path.clone()));
        state
            .nodes
            .get(&path)
            .map(|node| node.metadata(&path))
            .ok_or_else(|| RemoteError::not_found(path))
    }

    fn list(&self, dir: &str) -> Result<Vec<RemoteMetadata>, RemoteError> {
        let dir = path::normalize(dir);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::List(dir.clone()));
        match state.nodes.get(&dir) {
            Some(StoredNode::Dir { .. }) => {}
            Some(StoredNode::File { .. }) => return Err(RemoteError::NotADirectory { path: dir }),
            None => return Err(RemoteError::not_found(dir)),
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && path::split(p).0 == dir)
            .map(|(p, node)| node.metadata(p))
            .collect())
    }

    fn download(&self, path: &str) -> Result<RemoteStream, RemoteError> {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Download(path.clone()));
        if state.failing_downloads > 0 {
            state.failing_downloads -= 1;
            return Err(injected(&path));
        }
        match state.nodes.get(&path) {
            Some(StoredNode::File { data, .. }) => Ok(Box::new(ChunkedReader {
                data: Arc::clone(data),
                pos: 0,
                limit: state.read_limit,
            })),
            Some(StoredNode::Dir { .. }) => Err(RemoteError::Protocol {
                reason: format!("cannot download directory '{path}'"),
            }),
            None => Err(RemoteError::not_found(path)),
        }
    }

    fn upload(
        &self,
        path: &str,
        body: UploadBody<'_>,
        overwrite: bool,
    ) -> Result<RemoteMetadata, RemoteError> {
        let path = path::normalize(path);
        let data = body
            .to_vec()
            .map_err(|e| RemoteError::transient(path.clone(), e))?;

        let mut state = self.state.lock();
        state.calls.push(StoreCall::Upload {
            path: path.clone(),
            data: data.clone(),
            overwrite,
        });
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return Err(injected(&path));
        }
        state.require_parent_dir(&path)?;

        let now = state.now();
        let ctime = match state.nodes.get(&path) {
            Some(StoredNode::Dir { .. }) => {
                return Err(RemoteError::Conflict { path });
            }
            Some(StoredNode::File { .. }) if !overwrite => {
                return Err(RemoteError::Conflict { path });
            }
            Some(StoredNode::File { ctime, .. }) => *ctime,
            None => now,
        };
        let node = StoredNode::File {
            data: Arc::from(data),
            ctime,
            mtime: now,
        };
        let meta = node.metadata(&path);
        state.nodes.insert(path, node);
        Ok(meta)
    }

    fn delete(&self, path: &str, force: bool) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Delete(path.clone()));
        if path == "/" {
            return Err(RemoteError::Protocol {
                reason: "cannot delete the root".to_string(),
            });
        }
        if !state.nodes.contains_key(&path) {
            return if force {
                Ok(())
            } else {
                Err(RemoteError::not_found(path))
            };
        }
        for doomed in state.paths_within(&path) {
            state.nodes.remove(&doomed);
        }
        Ok(())
    }

    fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Move {
            from: from.clone(),
            to: to.clone(),
        });
        if !state.nodes.contains_key(&from) {
            return Err(RemoteError::not_found(from));
        }
        if state.nodes.contains_key(&to) {
            return Err(RemoteError::Conflict { path: to });
        }
        if path::is_within(&to, &from) {
            return Err(RemoteError::Protocol {
                reason: format!("cannot move '{from}' into itself"),
            });
        }
        state.require_parent_dir(&to)?;

        for old in state.paths_within(&from) {
            if let Some(node) = state.nodes.remove(&old) {
                state.nodes.insert(path::rebase(&old, &from, &to), node);
            }
        }
        Ok(())
    }

    fn mkdir(&self, path: &str, force: bool) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Mkdir(path.clone()));
        if state.nodes.contains_key(&path) {
            return if force && state.is_dir(&path) {
                Ok(())
            } else {
                Err(RemoteError::Conflict { path })
            };
        }
        state.require_parent_dir(&path)?;
        let now = state.now();
        state.nodes.insert(
            path,
            StoredNode::Dir {
                ctime: now,
                mtime: now,
            },
        );
        Ok(())
    }
}

/// Download stream over shared bytes, optionally yielding short reads.
struct ChunkedReader {
    data: Arc<[u8]>,
    pos: usize,
    limit: Option<usize>,
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let mut n = remaining.len().min(buf.len());
        if let Some(limit) = self.limit {
            n = n.min(limit);
        }
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
