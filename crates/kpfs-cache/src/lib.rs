//! Local file cache for the kpfs cloud-drive filesystem.
//!
//! The filesystem adapter talks to a [`CachePool`]. Opening a path yields a
//! shared [`FileCacheEntry`]; reads are served from the local cache file when
//! it is current, or streamed from the remote store otherwise. Writes stay
//! local until the last handle closes, at which point a background worker
//! uploads the file.
//!
//! # Cache files
//!
//! The cache directory mirrors the logical hierarchy. A cache file's mtime is
//! always set to the remote mtime it was last synchronized with, so on the
//! next open:
//!
//! | cache mtime vs remote | meaning                          |
//! |-----------------------|----------------------------------|
//! | equal                 | current, read locally            |
//! | older or missing      | download again                   |
//! | newer                 | a previous upload never finished |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kpfs_cache::{CacheConfig, CachePool};
//! use kpfs_core::{DirStore, NodeTree, RemoteStore};
//! use tracing::info_span;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn RemoteStore> = Arc::new(DirStore::new("/srv/drive")?);
//! let tree = Arc::new(NodeTree::new(store));
//! let pool = CachePool::new("/var/cache/kpfs", tree, CacheConfig::from_env(), info_span!("kpfs"))?;
//!
//! let file = pool.open("/notes.txt", libc::O_RDONLY)?;
//! let head = file.read(0, 64)?;
//! pool.close("/notes.txt")?;
//! # let _ = head;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod paths;
pub mod pool;
pub mod registry;
pub mod worker;

pub use buffer::CacheBuffer;
pub use config::CacheConfig;
pub use entry::{FileCacheEntry, ModifiedState, Step};
pub use error::{CacheError, CacheResult, SubmitError, ToErrno, io_error_to_errno};
pub use eviction::{EvictionReport, evict_stale};
pub use paths::{CachePaths, TEMP_PREFIXES, is_temporary};
pub use pool::CachePool;
pub use registry::EntryTable;
pub use worker::{Job, JobHandler, JobOutcome, WorkerPool, WorkerStats};
