//! Remote store contract and metadata tree for kpfs.
//!
//! kpfs exposes a cloud-drive account as a mounted filesystem. This crate holds
//! the pieces the local file cache builds on:
//!
//! - [`RemoteStore`] - the operations the cache needs from the cloud backend
//!   (metadata, listing, streaming download, upload, delete, move, mkdir)
//! - [`NodeTree`] - typed, lazily populated tree of file and directory nodes
//! - [`MemoryStore`] and [`DirStore`] - in-process backends for tests and the CLI
//!
//! # Timestamps
//!
//! The backend reports modification times with whole-second precision. Both
//! stores in this crate truncate to seconds so that a timestamp copied from
//! remote metadata onto a local file compares equal when read back.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use kpfs_core::{MemoryStore, NodeTree, RemoteStore, UploadBody};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.upload("/notes.txt", UploadBody::Bytes(b"hi"), true).unwrap();
//!
//! let tree = NodeTree::new(store);
//! let attr = tree.file_attr("/notes.txt").unwrap();
//! assert_eq!(attr.read().size, 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attr;
mod local;
mod memory;
pub mod path;
mod remote;
pub mod tree;

pub use attr::{DirAttr, FileAttr, SharedAttr, Stat};
pub use local::DirStore;
pub use memory::{MemoryStore, StoreCall};
pub use remote::{
    NodeKind, RemoteError, RemoteMetadata, RemoteStore, RemoteStream, UploadBody,
    truncate_to_secs,
};
pub use tree::{NodeRef, NodeTree, TreeError};
