//! Shared fixtures for cache integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use kpfs_cache::{CacheConfig, CachePool};
use kpfs_core::{MemoryStore, NodeTree, RemoteStore, StoreCall};
use tempfile::TempDir;
use tracing::info_span;

/// Remote mtime used for seeded files.
pub const T0: u64 = 1_700_000_000;

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Routes `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with no upload debounce and fast retries.
pub fn quick_config() -> CacheConfig {
    CacheConfig::default()
        .upload_delay(Duration::ZERO)
        .retries(1, Duration::from_millis(1))
        .worker_threads(2)
}

/// A cache pool over an in-memory remote, in a temp directory.
///
/// Seed the store before the first pool call: the tree lists directories
/// once and keeps the result.
pub struct Harness {
    _dir: TempDir,
    root: PathBuf,
    pub store: Arc<MemoryStore>,
    pub pool: CachePool,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryStore::new(), quick_config(), |_| {})
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::build(MemoryStore::new(), config, |_| {})
    }

    /// Seeds the store, and optionally the cache directory, before the pool
    /// starts.
    pub fn build(
        store: MemoryStore,
        config: CacheConfig,
        prepare_cache: impl FnOnce(&Path),
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("cache");
        fs::create_dir_all(&root).expect("cache root");
        prepare_cache(&root);

        let store = Arc::new(store);
        let tree = Arc::new(NodeTree::new(Arc::clone(&store) as Arc<dyn RemoteStore>));
        let pool = CachePool::new(&root, tree, config, info_span!("cache-test"))
            .expect("pool");
        Self {
            _dir: dir,
            root,
            store,
            pool,
        }
    }

    /// Local cache file for a logical path.
    pub fn cache_file(&self, logical: &str) -> PathBuf {
        self.root.join(logical.trim_start_matches('/'))
    }

    pub fn uploads_of(&self, path: &str) -> Vec<Vec<u8>> {
        self.store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Upload { path: p, data, .. } if p == path => Some(data),
                _ => None,
            })
            .collect()
    }
}

/// A store holding one file with remote mtime [`T0`].
pub fn store_with(path: &str, data: &[u8]) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_file(path, data, at(T0));
    store
}

pub fn mtime_of(path: &Path) -> FileTime {
    FileTime::from_last_modification_time(&fs::metadata(path).expect("cache file metadata"))
}
