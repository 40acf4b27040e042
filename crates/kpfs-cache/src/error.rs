//! Error handling and errno mapping for the cache.
//!
//! [`CacheError`] covers every failure the pool and its entries can surface.
//! The filesystem adapter turns them into POSIX error codes with
//! [`CacheError::to_errno`].

use std::io;
use std::path::{Path, PathBuf};

use kpfs_core::{RemoteError, TreeError};
use thiserror::Error;

/// Errors from cache entries, the pool, and its workers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The remote store rejected or failed a call.
    #[error("Remote operation failed: {0}")]
    Remote(#[from] RemoteError),

    /// Resolving the path in the metadata tree failed.
    #[error("Tree lookup failed: {0}")]
    Tree(#[from] TreeError),

    /// Local cache file I/O failed.
    #[error("Cache I/O failed for '{}': {source}", path.display())]
    Io {
        /// Local path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The download stream ended before the size the remote declared.
    #[error("Download of '{path}' ended early: expected {expected} bytes, received {received}")]
    ShortDownload {
        /// Logical path.
        path: String,
        /// Declared remote size.
        expected: u64,
        /// Bytes buffered when the stream ended.
        received: u64,
    },

    /// The logical path cannot be mapped into the cache directory.
    #[error("Invalid path: '{0}'")]
    InvalidPath(String),

    /// No open entry exists for the path.
    #[error("File is not open: '{0}'")]
    NotOpen(String),

    /// The cache root is missing or not a directory.
    #[error("Not a directory: '{}'", .0.display())]
    NotADirectory(PathBuf),

    /// A call sequence the entry state machine never allows.
    #[error("Cache invariant violated: {0}")]
    Invariant(&'static str),

    /// The background worker pool is no longer accepting jobs.
    #[error("Background worker pool unavailable: {0}")]
    Submit(#[from] SubmitError),

    /// A background worker thread could not be started.
    #[error("Failed to start background worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Error when handing a job to the background workers.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Queue is full; the job was not accepted.
    #[error("worker queue full (capacity: {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },
    /// Workers have been shut down.
    #[error("worker pool has been shut down")]
    Shutdown,
}

impl CacheError {
    /// Builds an [`CacheError::Io`] for a local path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Converts this error to a libc error code for the filesystem adapter.
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::Remote(e) => e.to_errno(),
            CacheError::Tree(e) => e.to_errno(),
            CacheError::Io { source, .. } => io_error_to_errno(source),
            CacheError::InvalidPath(_) => libc::EINVAL,
            CacheError::NotOpen(_) => libc::EBADF,
            CacheError::NotADirectory(_) => libc::ENOTDIR,
            CacheError::Submit(SubmitError::QueueFull { .. }) | CacheError::Spawn(_) => libc::EAGAIN,
            CacheError::ShortDownload { .. }
            | CacheError::Invariant(_)
            | CacheError::Submit(SubmitError::Shutdown) => libc::EIO,
        }
    }

    /// Returns true if repeating the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Remote(e) | CacheError::Tree(TreeError::Remote(e)) => e.is_transient(),
            CacheError::ShortDownload { .. } | CacheError::Submit(SubmitError::QueueFull { .. }) => {
                true
            }
            _ => false,
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Converts an I/O error to a libc error code, defaulting to `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for RemoteError {
    fn to_errno(&self) -> i32 {
        match self {
            RemoteError::NotFound { .. } => libc::ENOENT,
            RemoteError::Conflict { .. } => libc::EEXIST,
            RemoteError::NotADirectory { .. } => libc::ENOTDIR,
            RemoteError::Transient { source, .. } => io_error_to_errno(source),
            RemoteError::Unauthorized => libc::EACCES,
            RemoteError::Protocol { .. } => libc::EIO,
        }
    }
}

impl ToErrno for TreeError {
    fn to_errno(&self) -> i32 {
        match self {
            TreeError::NotFound { .. } => libc::ENOENT,
            TreeError::IsADirectory { .. } => libc::EISDIR,
            TreeError::NotADirectory { .. } => libc::ENOTDIR,
            TreeError::InvalidPath { .. } => libc::EINVAL,
            TreeError::Remote(e) => e.to_errno(),
        }
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

/// Attaches the local path to raw I/O results.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> CacheResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> CacheResult<T> {
        self.map_err(|e| CacheError::io(path, e))
    }
}
