//! Typed metadata tree.
//!
//! [`NodeTree`] maps logical paths to file and directory nodes. Directories are
//! listed from the remote store the first time they are traversed and kept
//! afterwards; local mutations (create, remove, move) are applied to the tree
//! directly so it tracks what the filesystem adapter has done.
//!
//! File nodes hold their attributes behind a [`SharedAttr`]. The cache entry
//! for an open file holds the same `Arc`, so a metadata refresh after an upload
//! is visible to `getattr` without another lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::attr::{DirAttr, FileAttr, SharedAttr, Stat};
use crate::path;
use crate::remote::{NodeKind, RemoteError, RemoteMetadata, RemoteStore};

/// Errors from tree lookups and mutations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// No node exists at the path.
    #[error("Path not found: '{path}'")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// A file operation was attempted on a directory.
    #[error("Expected file but found directory: '{path}'")]
    IsADirectory {
        /// The offending path.
        path: String,
    },

    /// A directory operation was attempted on a file.
    #[error("Expected directory but found file: '{path}'")]
    NotADirectory {
        /// The offending path.
        path: String,
    },

    /// The path cannot name a node (for example, creating the root).
    #[error("Invalid path: '{path}'")]
    InvalidPath {
        /// The offending path.
        path: String,
    },

    /// Listing or metadata lookup failed on the remote.
    #[error("Remote lookup failed: {0}")]
    Remote(#[from] RemoteError),
}

impl TreeError {
    /// Returns true if the path does not exist, locally or remotely.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Remote(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Snapshot handle to a node in the tree.
///
/// For files, the attributes are shared with the tree and stay live.
#[derive(Debug, Clone)]
pub enum NodeRef {
    /// A regular file.
    File {
        /// Logical path.
        path: String,
        /// Shared, live attributes.
        attr: SharedAttr,
    },
    /// A directory.
    Directory {
        /// Logical path.
        path: String,
        /// Attributes at lookup time.
        attr: DirAttr,
    },
}

impl NodeRef {
    /// Logical path of the node.
    pub fn path(&self) -> &str {
        match self {
            Self::File { path, .. } | Self::Directory { path, .. } => path,
        }
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    /// Stat-like view of the node.
    pub fn stat(&self) -> Stat {
        match self {
            Self::File { attr, .. } => attr.read().stat(),
            Self::Directory { attr, .. } => attr.stat(),
        }
    }
}

#[derive(Debug)]
struct FileNode {
    path: String,
    attr: SharedAttr,
}

#[derive(Debug)]
struct DirNode {
    path: String,
    attr: DirAttr,
    /// `None` until listed from the remote.
    children: Option<HashMap<String, Node>>,
}

#[derive(Debug)]
enum Node {
    File(FileNode),
    Directory(DirNode),
}

impl Node {
    fn from_metadata(meta: &RemoteMetadata) -> Self {
        match meta.kind {
            NodeKind::File => Node::File(FileNode {
                path: meta.path.clone(),
                attr: Arc::new(RwLock::new(FileAttr::from_metadata(meta))),
            }),
            NodeKind::Directory => Node::Directory(DirNode {
                path: meta.path.clone(),
                attr: DirAttr::from_metadata(meta),
                children: None,
            }),
        }
    }

    fn to_ref(&self) -> NodeRef {
        match self {
            Node::File(f) => f.to_ref(),
            Node::Directory(d) => d.to_ref(),
        }
    }

    /// Rewrites this node's path and, for directories, every descendant's.
    fn set_path(&mut self, new_path: String) {
        match self {
            Node::File(f) => f.path = new_path,
            Node::Directory(d) => {
                if let Some(children) = d.children.as_mut() {
                    for (name, child) in children.iter_mut() {
                        child.set_path(path::join(&new_path, name));
                    }
                }
                d.path = new_path;
            }
        }
    }
}

impl FileNode {
    fn to_ref(&self) -> NodeRef {
        NodeRef::File {
            path: self.path.clone(),
            attr: Arc::clone(&self.attr),
        }
    }
}

impl DirNode {
    fn to_ref(&self) -> NodeRef {
        NodeRef::Directory {
            path: self.path.clone(),
            attr: self.attr,
        }
    }

    /// Lists the directory from the remote if that has not happened yet.
    fn build(
        &mut self,
        store: &dyn RemoteStore,
    ) -> Result<&mut HashMap<String, Node>, TreeError> {
        if self.children.is_none() {
            let listing = store.list(&self.path)?;
            debug!(path = %self.path, entries = listing.len(), "Listed remote directory");
            let children = listing
                .iter()
                .map(|meta| (meta.name().to_string(), Node::from_metadata(meta)))
                .collect();
            self.children = Some(children);
        }
        Ok(self.children.get_or_insert_with(HashMap::new))
    }
}

/// Walks from `root` to the directory at `dir_path`, listing directories on
/// the way.
fn walk_dir<'a>(
    store: &dyn RemoteStore,
    root: &'a mut DirNode,
    dir_path: &str,
) -> Result<&'a mut DirNode, TreeError> {
    let mut dir = root;
    for name in path::components(dir_path) {
        match dir.build(store)?.get_mut(name) {
            Some(Node::Directory(child)) => dir = child,
            Some(Node::File(_)) => {
                return Err(TreeError::NotADirectory {
                    path: dir_path.to_string(),
                });
            }
            None => {
                return Err(TreeError::NotFound {
                    path: dir_path.to_string(),
                });
            }
        }
    }
    dir.build(store)?;
    Ok(dir)
}

/// Lazily populated tree of remote nodes.
pub struct NodeTree {
    store: Arc<dyn RemoteStore>,
    root: Mutex<DirNode>,
}

impl std::fmt::Debug for NodeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTree").finish_non_exhaustive()
    }
}

impl NodeTree {
    /// Creates a tree whose root will be listed on first access.
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            root: Mutex::new(DirNode {
                path: "/".to_string(),
                attr: DirAttr::new_now(),
                children: None,
            }),
        }
    }

    /// The store this tree lists from.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Looks up a node. Returns `Ok(None)` if the path does not exist.
    pub fn get(&self, path: &str) -> Result<Option<NodeRef>, TreeError> {
        let path = path::normalize(path);
        let store = self.store.as_ref();
        let mut root = self.root.lock();

        if path == "/" {
            root.build(store)?;
            return Ok(Some(root.to_ref()));
        }

        let (parent, name) = path::split(&path);
        let dir = match walk_dir(store, &mut root, parent) {
            Ok(dir) => dir,
            Err(TreeError::NotFound { .. } | TreeError::NotADirectory { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        match dir.build(store)?.get_mut(name) {
            None => Ok(None),
            Some(Node::File(file)) => Ok(Some(file.to_ref())),
            Some(Node::Directory(child)) => {
                child.build(store)?;
                Ok(Some(child.to_ref()))
            }
        }
    }

    /// Resolves the shared attributes of a file.
    pub fn file_attr(&self, path: &str) -> Result<SharedAttr, TreeError> {
        match self.get(path)? {
            Some(NodeRef::File { attr, .. }) => Ok(attr),
            Some(NodeRef::Directory { .. }) => Err(TreeError::IsADirectory {
                path: path.to_string(),
            }),
            None => Err(TreeError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    /// Stat-like view of a node.
    pub fn stat(&self, path: &str) -> Result<Stat, TreeError> {
        self.get(path)?
            .map(|node| node.stat())
            .ok_or_else(|| TreeError::NotFound {
                path: path.to_string(),
            })
    }

    /// Sorted names of a directory's children.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, TreeError> {
        let path = path::normalize(path);
        let store = self.store.as_ref();
        let mut root = self.root.lock();
        let dir = walk_dir(store, &mut root, &path)?;
        let mut names: Vec<String> = dir.build(store)?.keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Inserts a node for a path the caller has just created.
    ///
    /// Creating a file over an existing file node resets the existing
    /// attributes in place, so holders of the shared attributes see the reset.
    pub fn create(&self, path: &str, is_dir: bool) -> Result<NodeRef, TreeError> {
        let path = path::normalize(path);
        let (parent, name) = path::split(&path);
        if name.is_empty() {
            return Err(TreeError::InvalidPath { path });
        }

        let store = self.store.as_ref();
        let mut root = self.root.lock();
        let children = walk_dir(store, &mut root, parent)?.build(store)?;

        if !is_dir && let Some(Node::File(existing)) = children.get(name) {
            *existing.attr.write() = FileAttr::new_now();
            return Ok(existing.to_ref());
        }

        let node = if is_dir {
            Node::Directory(DirNode {
                path: path.clone(),
                attr: DirAttr::new_now(),
                children: Some(HashMap::new()),
            })
        } else {
            Node::File(FileNode {
                path: path.clone(),
                attr: Arc::new(RwLock::new(FileAttr::new_now())),
            })
        };
        let node_ref = node.to_ref();
        children.insert(name.to_string(), node);
        debug!(%path, is_dir, "Inserted node");
        Ok(node_ref)
    }

    /// Removes a node (and its subtree). Returns the removed node, if any.
    pub fn remove(&self, path: &str) -> Result<Option<NodeRef>, TreeError> {
        let path = path::normalize(path);
        let (parent, name) = path::split(&path);
        let store = self.store.as_ref();
        let mut root = self.root.lock();
        let dir = match walk_dir(store, &mut root, parent) {
            Ok(dir) => dir,
            Err(TreeError::NotFound { .. } | TreeError::NotADirectory { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(dir.build(store)?.remove(name).map(|node| node.to_ref()))
    }

    /// Moves a node to a new path, rewriting descendant paths.
    ///
    /// Returns `Ok(None)` if nothing exists at `from`.
    pub fn move_node(&self, from: &str, to: &str) -> Result<Option<NodeRef>, TreeError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        let (from_parent, from_name) = path::split(&from);
        let (to_parent, to_name) = path::split(&to);
        if from_name.is_empty() || to_name.is_empty() {
            return Err(TreeError::InvalidPath { path: from });
        }

        let store = self.store.as_ref();
        let mut root = self.root.lock();

        // Validate the destination before detaching anything.
        walk_dir(store, &mut root, to_parent)?;

        let detached = match walk_dir(store, &mut root, from_parent) {
            Ok(dir) => dir.build(store)?.remove(from_name),
            Err(TreeError::NotFound { .. } | TreeError::NotADirectory { .. }) => None,
            Err(e) => return Err(e),
        };
        let Some(mut node) = detached else {
            return Ok(None);
        };

        node.set_path(to.clone());
        let node_ref = node.to_ref();
        walk_dir(store, &mut root, to_parent)?
            .build(store)?
            .insert(to_name.to_string(), node);
        debug!(%from, %to, "Moved node");
        Ok(Some(node_ref))
    }

    /// Re-reads a node's metadata from the remote into the tree.
    pub fn refresh(&self, path: &str) -> Result<NodeRef, TreeError> {
        let path = path::normalize(path);
        let meta = self.store.metadata(&path)?;
        match self.get(&path)? {
            Some(NodeRef::File { path, attr }) => {
                *attr.write() = FileAttr::from_metadata(&meta);
                Ok(NodeRef::File { path, attr })
            }
            Some(NodeRef::Directory { .. }) => {
                let store = self.store.as_ref();
                let mut root = self.root.lock();
                let dir = walk_dir(store, &mut root, &path)?;
                dir.attr = DirAttr::from_metadata(&meta);
                Ok(dir.to_ref())
            }
            None => Err(TreeError::NotFound { path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreCall};
    use crate::remote::UploadBody;
    use std::time::{Duration, UNIX_EPOCH};

    fn seeded() -> (Arc<MemoryStore>, NodeTree) {
        let store = Arc::new(MemoryStore::new());
        let t = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        store.insert_file("/a.txt", b"hello", t);
        store.insert_file("/docs/b.txt", b"0123456789", t);
        store.insert_dir("/docs/empty");
        let tree = NodeTree::new(Arc::clone(&store) as Arc<dyn RemoteStore>);
        (store, tree)
    }

    #[test]
    fn test_get_file_and_directory() {
        let (_store, tree) = seeded();

        let file = tree.get("/docs/b.txt").unwrap().expect("file exists");
        assert!(!file.is_dir());
        assert_eq!(file.stat().size, 10);

        let dir = tree.get("/docs").unwrap().expect("dir exists");
        assert!(dir.is_dir());

        assert!(tree.get("/missing").unwrap().is_none());
        assert!(tree.get("/a.txt/child").unwrap().is_none());
    }

    #[test]
    fn test_directories_listed_once() {
        let (store, tree) = seeded();
        tree.get("/docs/b.txt").unwrap();
        tree.get("/docs/empty").unwrap();
        tree.get("/a.txt").unwrap();

        let lists = store
            .calls()
            .into_iter()
            .filter(|c| matches!(c, StoreCall::List(_)))
            .count();
        // root, /docs, /docs/empty
        assert_eq!(lists, 3);
    }

    #[test]
    fn test_file_attr_errors() {
        let (_store, tree) = seeded();
        assert!(matches!(
            tree.file_attr("/docs"),
            Err(TreeError::IsADirectory { .. })
        ));
        let err = tree.file_attr("/nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_and_read_dir() {
        let (_store, tree) = seeded();
        tree.create("/docs/new.txt", false).unwrap();
        tree.create("/docs/sub", true).unwrap();

        assert_eq!(
            tree.read_dir("/docs").unwrap(),
            vec!["b.txt", "empty", "new.txt", "sub"]
        );
        assert_eq!(tree.stat("/docs/new.txt").unwrap().size, 0);
        assert!(tree.create("/", true).is_err());
        assert!(tree.create("/missing/x", false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_existing_file_resets_shared_attr() {
        let (_store, tree) = seeded();
        let attr = tree.file_attr("/a.txt").unwrap();
        assert_eq!(attr.read().size, 5);

        tree.create("/a.txt", false).unwrap();
        assert_eq!(attr.read().size, 0);
        assert!(Arc::ptr_eq(&attr, &tree.file_attr("/a.txt").unwrap()));
    }

    #[test]
    fn test_remove() {
        let (_store, tree) = seeded();
        assert!(tree.remove("/docs").unwrap().is_some());
        assert!(tree.get("/docs/b.txt").unwrap().is_none());
        assert!(tree.remove("/docs").unwrap().is_none());
    }

    #[test]
    fn test_move_directory_rewrites_descendants() {
        let (_store, tree) = seeded();
        tree.get("/docs/b.txt").unwrap();

        let moved = tree.move_node("/docs", "/archive").unwrap().unwrap();
        assert_eq!(moved.path(), "/archive");

        let child = tree.get("/archive/b.txt").unwrap().unwrap();
        assert_eq!(child.path(), "/archive/b.txt");
        assert!(tree.get("/docs").unwrap().is_none());
    }

    #[test]
    fn test_move_missing_source_is_none() {
        let (_store, tree) = seeded();
        assert!(tree.move_node("/ghost", "/other").unwrap().is_none());
    }

    #[test]
    fn test_move_to_missing_parent_keeps_source() {
        let (_store, tree) = seeded();
        assert!(tree.move_node("/a.txt", "/nowhere/a.txt").is_err());
        assert!(tree.get("/a.txt").unwrap().is_some());
    }

    #[test]
    fn test_refresh_updates_shared_attr() {
        let (store, tree) = seeded();
        let attr = tree.file_attr("/a.txt").unwrap();

        store
            .upload("/a.txt", UploadBody::Bytes(b"longer content"), true)
            .unwrap();
        tree.refresh("/a.txt").unwrap();

        assert_eq!(attr.read().size, 14);
    }
}
