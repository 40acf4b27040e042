//! The remote store contract.
//!
//! Everything the cache needs from the cloud backend goes through
//! [`RemoteStore`]. Implementations block the calling thread for the duration
//! of the network call; there is no cooperative cancellation.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Streaming byte source for an in-progress download.
pub type RemoteStream = Box<dyn Read + Send>;

/// Whether a remote path names a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory (the root included).
    Directory,
}

/// Authoritative metadata for a remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Logical path, always starting with `/`.
    pub path: String,
    /// File or directory.
    pub kind: NodeKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Creation time, whole seconds.
    pub ctime: SystemTime,
    /// Last modification time, whole seconds.
    pub mtime: SystemTime,
}

impl RemoteMetadata {
    /// The last path component.
    pub fn name(&self) -> &str {
        crate::path::base_name(&self.path)
    }

    /// Returns true if this is a directory.
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Content to push to the remote store.
#[derive(Debug, Clone, Copy)]
pub enum UploadBody<'a> {
    /// In-memory bytes.
    Bytes(&'a [u8]),
    /// Contents of a local file, read by path.
    File(&'a Path),
}

impl UploadBody<'_> {
    /// Reads the full body into memory.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        match self {
            UploadBody::Bytes(bytes) => Ok(bytes.to_vec()),
            UploadBody::File(path) => fs::read(path),
        }
    }
}

/// Typed failures from the remote store.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The path does not exist on the remote.
    #[error("Remote path not found: '{path}'")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// The path already exists and overwriting was not allowed.
    #[error("Remote path already exists: '{path}'")]
    Conflict {
        /// The conflicting path.
        path: String,
    },

    /// A directory operation was attempted on a file.
    #[error("Expected directory but found file: '{path}'")]
    NotADirectory {
        /// The offending path.
        path: String,
    },

    /// Timeout, connection reset, or similar. Not retried by the store.
    #[error("Transient failure for '{path}': {source}")]
    Transient {
        /// Path of the failed call.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Credentials were rejected.
    #[error("Remote rejected credentials")]
    Unauthorized,

    /// The remote answered with something we could not interpret.
    #[error("Unexpected remote response: {reason}")]
    Protocol {
        /// Description of the problem.
        reason: String,
    },
}

impl RemoteError {
    /// Builds a [`RemoteError::NotFound`].
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Builds a [`RemoteError::Transient`].
    pub fn transient(path: impl Into<String>, source: io::Error) -> Self {
        Self::Transient {
            path: path.into(),
            source,
        }
    }

    /// Returns true for [`RemoteError::NotFound`].
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a retry at a higher level may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Operations the cache needs from the cloud backend.
///
/// Implementations must be usable from many threads at once.
pub trait RemoteStore: Send + Sync {
    /// Fetches metadata for a single path.
    fn metadata(&self, path: &str) -> Result<RemoteMetadata, RemoteError>;

    /// Lists the direct children of a directory.
    fn list(&self, dir: &str) -> Result<Vec<RemoteMetadata>, RemoteError>;

    /// Opens a streaming download of a file's contents.
    fn download(&self, path: &str) -> Result<RemoteStream, RemoteError>;

    /// Uploads a file, returning the metadata the remote assigned to it.
    ///
    /// Fails with [`RemoteError::Conflict`] if `overwrite` is false and the
    /// file exists.
    fn upload(
        &self,
        path: &str,
        body: UploadBody<'_>,
        overwrite: bool,
    ) -> Result<RemoteMetadata, RemoteError>;

    /// Deletes a file or directory. With `force`, a missing path is not an error.
    fn delete(&self, path: &str, force: bool) -> Result<(), RemoteError>;

    /// Moves or renames a path.
    fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    /// Creates a directory. With `force`, an existing directory is not an error.
    fn mkdir(&self, path: &str, force: bool) -> Result<(), RemoteError>;
}

/// Truncates a timestamp to whole seconds, the precision of remote metadata.
pub fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => UNIX_EPOCH,
    }
}
