//! File and directory attributes.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::remote::{RemoteMetadata, truncate_to_secs};

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const DEFAULT_PERM: u32 = 0o644;

/// Attributes of a remote file as last reported by the store.
///
/// `size` is corrected locally when the cache holds content the remote has
/// not seen yet (an interrupted upload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// Creation time.
    pub ctime: SystemTime,
    /// Remote modification time.
    pub mtime: SystemTime,
}

impl FileAttr {
    /// Attributes for a file created locally just now.
    pub fn new_now() -> Self {
        let now = truncate_to_secs(SystemTime::now());
        Self {
            size: 0,
            ctime: now,
            mtime: now,
        }
    }

    /// Attributes taken from remote metadata.
    pub fn from_metadata(meta: &RemoteMetadata) -> Self {
        Self {
            size: meta.size,
            ctime: meta.ctime,
            mtime: meta.mtime,
        }
    }

    /// Converts to the stat shape the filesystem adapter returns.
    pub fn stat(&self) -> Stat {
        Stat {
            mode: S_IFREG | DEFAULT_PERM,
            nlink: 1,
            size: self.size,
            ctime: self.ctime,
            mtime: self.mtime,
            atime: self.mtime,
        }
    }
}

/// File attributes shared between the tree node and the open cache entry.
pub type SharedAttr = Arc<RwLock<FileAttr>>;

/// Attributes of a remote directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirAttr {
    /// Creation time.
    pub ctime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
}

impl DirAttr {
    /// Attributes for a directory created locally just now.
    pub fn new_now() -> Self {
        let now = truncate_to_secs(SystemTime::now());
        Self {
            ctime: now,
            mtime: now,
        }
    }

    /// Attributes taken from remote metadata.
    pub fn from_metadata(meta: &RemoteMetadata) -> Self {
        Self {
            ctime: meta.ctime,
            mtime: meta.mtime,
        }
    }

    /// Converts to the stat shape the filesystem adapter returns.
    pub fn stat(&self) -> Stat {
        Stat {
            mode: S_IFDIR | DEFAULT_PERM,
            nlink: 2,
            size: 0,
            ctime: self.ctime,
            mtime: self.mtime,
            atime: self.mtime,
        }
    }
}

/// Stat-like view of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// File type and permission bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Creation time.
    pub ctime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
    /// Access time (reported as the modification time).
    pub atime: SystemTime,
}

impl Stat {
    /// Returns true if the mode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}
