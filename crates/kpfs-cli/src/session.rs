//! One CLI invocation's view of the drive: remote store, tree, and cache.

use std::sync::Arc;

use anyhow::{Context, Result};
use kpfs_cache::CachePool;
use kpfs_core::{DirStore, NodeTree, RemoteStore};
use tracing::info_span;

use crate::config::Settings;

pub struct Session {
    pub store: Arc<dyn RemoteStore>,
    pub pool: CachePool,
}

impl Session {
    pub fn open(settings: &Settings) -> Result<Self> {
        let remote = settings.remote()?;
        let store: Arc<dyn RemoteStore> = Arc::new(
            DirStore::new(remote)
                .with_context(|| format!("Cannot use remote directory: {}", remote.display()))?,
        );
        let tree = Arc::new(NodeTree::new(Arc::clone(&store)));
        let span = info_span!("kpfs", remote = %remote.display());
        let pool = CachePool::new(&settings.cache_dir, tree, settings.cache.clone(), span)
            .with_context(|| {
                format!("Cannot open cache directory: {}", settings.cache_dir.display())
            })?;
        Ok(Self { store, pool })
    }

    pub fn tree(&self) -> &NodeTree {
        self.pool.tree()
    }

    /// Waits for background uploads and stops the workers.
    pub fn finish(self) {
        self.pool.wait_idle();
        self.pool.shutdown();
    }
}
