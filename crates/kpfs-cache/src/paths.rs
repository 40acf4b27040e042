//! Mapping from logical paths to local cache files.

use std::path::{Path, PathBuf};

use kpfs_core::path;

use crate::error::{CacheError, CacheResult};

/// Base-name prefixes of editor lock, swap, and backup files.
///
/// Files with these prefixes are cached locally but never uploaded.
pub const TEMP_PREFIXES: &[&str] = &[".~", "~"];

/// Returns true if the path's base name marks a temporary editor file.
pub fn is_temporary(logical: &str) -> bool {
    let name = path::base_name(logical);
    TEMP_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Cache directory layout: the logical hierarchy mirrored under a root.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Mirrors logical paths under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local cache file for a logical path.
    ///
    /// Rejects `..` components and the root itself.
    pub fn cache_path(&self, logical: &str) -> CacheResult<PathBuf> {
        let mut local = self.root.clone();
        let mut any = false;
        for component in path::components(logical) {
            if component == ".." {
                return Err(CacheError::InvalidPath(logical.to_string()));
            }
            local.push(component);
            any = true;
        }
        if !any {
            return Err(CacheError::InvalidPath(logical.to_string()));
        }
        Ok(local)
    }
}
