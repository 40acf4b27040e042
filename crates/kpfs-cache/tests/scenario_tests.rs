//! End-to-end cache scenarios against an in-memory remote.
//!
//! Each test drives the pool the way the filesystem adapter would and checks
//! the resulting remote calls and cache files.

mod common;

use std::fs;
use std::sync::atomic::Ordering;

use common::*;
use filetime::FileTime;
use kpfs_cache::{CacheConfig, CacheError, ModifiedState};
use kpfs_core::{DirStore, NodeTree, RemoteStore, StoreCall};

// =============================================================================
// Write path
// =============================================================================

#[test]
fn test_create_write_close_uploads_once() {
    let h = Harness::new();

    let file = h.pool.create("/a.txt").unwrap();
    assert_eq!(file.write(0, b"hello").unwrap(), 5);
    h.pool.close("/a.txt").unwrap();
    h.pool.wait_idle();

    let uploads: Vec<_> = h
        .store
        .calls()
        .into_iter()
        .filter(|c| matches!(c, StoreCall::Upload { .. }))
        .collect();
    // The empty placeholder from create, then the content exactly once.
    assert_eq!(
        uploads,
        vec![
            StoreCall::Upload {
                path: "/a.txt".to_string(),
                data: Vec::new(),
                overwrite: true,
            },
            StoreCall::Upload {
                path: "/a.txt".to_string(),
                data: b"hello".to_vec(),
                overwrite: true,
            },
        ]
    );
    assert_eq!(fs::read(h.cache_file("/a.txt")).unwrap(), b"hello");
    assert!(h.pool.is_empty());
}

#[test]
fn test_truncate_fresh_file_to_zero_needs_no_upload() {
    let h = Harness::with_config(CacheConfig::default());

    let file = h.pool.create("/empty.txt").unwrap();
    // The placeholder made the file visible remotely and left it clean.
    assert_eq!(h.store.upload_count("/empty.txt"), 1);
    assert_eq!(file.state(), ModifiedState::Clean);

    file.truncate(0).unwrap();
    assert_eq!(file.state(), ModifiedState::Clean);

    h.pool.close("/empty.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(h.store.upload_count("/empty.txt"), 1);
    assert_eq!(h.pool.stats().jobs_submitted.load(Ordering::Relaxed), 0);
    assert!(h.pool.is_empty());
}

#[test]
fn test_write_mid_download_uploads_only_written_bytes() {
    let h = Harness::build(
        store_with("/b.txt", b"0123456789").with_read_limit(3),
        quick_config(),
        |_| {},
    );

    let file = h.pool.open("/b.txt", libc::O_RDWR).unwrap();
    assert_eq!(file.read(0, 3).unwrap(), b"012");
    assert_eq!(file.buffered_len(), 3);

    file.write(0, b"hello").unwrap();
    assert!(!file.is_opened(), "write must drop the download stream");
    assert_eq!(file.read(0, 10).unwrap(), b"hello");

    h.pool.close("/b.txt").unwrap();
    h.pool.wait_idle();

    assert_eq!(h.uploads_of("/b.txt"), vec![b"hello".to_vec()]);
    assert_eq!(h.store.contents("/b.txt").unwrap(), b"hello");
}

#[test]
fn test_truncate_mid_download_keeps_remote_bytes() {
    let h = Harness::build(
        store_with("/b.txt", b"0123456789").with_read_limit(3),
        quick_config(),
        |_| {},
    );

    let file = h.pool.open("/b.txt", libc::O_RDWR).unwrap();
    assert_eq!(file.read(0, 3).unwrap(), b"012");

    file.truncate(8).unwrap();
    assert!(!file.is_opened());
    assert_eq!(file.read(0, 100).unwrap(), b"01234567");

    h.pool.close("/b.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(h.uploads_of("/b.txt"), vec![b"01234567".to_vec()]);
}

#[test]
fn test_truncate_past_remote_size_zero_fills_only_the_tail() {
    let h = Harness::build(
        store_with("/b.txt", b"0123456789").with_read_limit(3),
        quick_config(),
        |_| {},
    );

    let file = h.pool.open("/b.txt", libc::O_RDWR).unwrap();
    assert_eq!(file.read(0, 3).unwrap(), b"012");

    file.truncate(12).unwrap();
    assert_eq!(file.read(0, 100).unwrap(), b"0123456789\0\0");
    assert_eq!(file.size(), 12);
    assert_eq!(file.state(), ModifiedState::Dirty);
    h.pool.close("/b.txt").unwrap();
}

#[test]
fn test_flush_never_contacts_remote() {
    let h = Harness::new();
    let file = h.pool.create("/f.txt").unwrap();
    file.write(0, b"draft").unwrap();
    h.store.clear_calls();

    file.flush().unwrap();
    file.flush().unwrap();
    assert!(h.store.calls().is_empty());

    h.pool.close("/f.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(h.uploads_of("/f.txt"), vec![b"draft".to_vec()]);
}

// =============================================================================
// Read path
// =============================================================================

#[test]
fn test_cold_read_downloads_and_stamps_remote_mtime() {
    let h = Harness::build(store_with("/b.txt", b"0123456789"), quick_config(), |_| {});

    let file = h.pool.open("/b.txt", libc::O_RDONLY).unwrap();
    assert_eq!(file.read(0, 10).unwrap(), b"0123456789");
    assert_eq!(h.store.download_count("/b.txt"), 1);

    let cache = h.cache_file("/b.txt");
    assert_eq!(fs::read(&cache).unwrap().len(), 10);
    assert_eq!(
        mtime_of(&cache),
        FileTime::from_unix_time(i64::try_from(T0).unwrap(), 0)
    );

    h.pool.close("/b.txt").unwrap();
    h.pool.wait_idle();
    assert!(h.pool.is_empty());
}

#[test]
fn test_read_past_end_is_clipped() {
    let h = Harness::build(store_with("/short", b"abc"), quick_config(), |_| {});
    let file = h.pool.open("/short", 0).unwrap();
    assert_eq!(file.read(1, 100).unwrap(), b"bc");
    assert!(file.read(3, 10).unwrap().is_empty());
    h.pool.close("/short").unwrap();
}

#[test]
fn test_remote_change_forces_redownload() {
    let h = Harness::build(store_with("/doc", b"v1"), quick_config(), |_| {});
    let file = h.pool.open("/doc", 0).unwrap();
    assert_eq!(file.read(0, 10).unwrap(), b"v1");
    h.pool.close("/doc").unwrap();
    h.pool.wait_idle();

    // Someone else replaced the file remotely.
    h.store.insert_file("/doc", b"version two", at(T0 + 3600));
    h.pool.tree().refresh("/doc").unwrap();

    let file = h.pool.open("/doc", 0).unwrap();
    assert_eq!(file.read(0, 100).unwrap(), b"version two");
    assert_eq!(h.store.download_count("/doc"), 2);
    h.pool.close("/doc").unwrap();
}

// =============================================================================
// Reference counting
// =============================================================================

#[test]
fn test_two_opens_one_close_keeps_entry() {
    let h = Harness::build(store_with("/b.txt", b"0123456789"), quick_config(), |_| {});

    let first = h.pool.open("/b.txt", 0).unwrap();
    let second = h.pool.open("/b.txt", 0).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.refcount(), 2);

    h.pool.close("/b.txt").unwrap();
    assert!(h.pool.contains("/b.txt"));
    assert_eq!(first.refcount(), 1);
    assert_eq!(h.pool.stats().jobs_submitted.load(Ordering::Relaxed), 0);
    assert_eq!(h.store.upload_count("/b.txt"), 0);

    h.pool.close("/b.txt").unwrap();
    h.pool.wait_idle();
    assert!(!h.pool.contains("/b.txt"));
    assert_eq!(h.store.upload_count("/b.txt"), 0);
    // The drain job finished the download before dropping the entry.
    assert_eq!(fs::read(h.cache_file("/b.txt")).unwrap(), b"0123456789");
}

#[test]
fn test_reopen_during_upload_delay_cancels_removal() {
    let h = Harness::with_config(
        quick_config().upload_delay(std::time::Duration::from_millis(200)),
    );

    let file = h.pool.create("/busy.txt").unwrap();
    file.write(0, b"one").unwrap();
    h.pool.close("/busy.txt").unwrap();

    // Reopen while the upload job is still waiting out its delay.
    let again = h.pool.open("/busy.txt", libc::O_RDWR).unwrap();
    assert!(std::sync::Arc::ptr_eq(&file, &again));
    again.write(3, b" two").unwrap();
    h.pool.wait_idle();

    assert!(h.pool.contains("/busy.txt"));
    // Only the placeholder so far.
    assert_eq!(h.uploads_of("/busy.txt"), vec![Vec::<u8>::new()]);
    assert_eq!(h.pool.stats().jobs_aborted.load(Ordering::Relaxed), 1);

    h.pool.close("/busy.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(h.uploads_of("/busy.txt"), vec![Vec::new(), b"one two".to_vec()]);
    assert!(h.pool.is_empty());
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_open_directory_is_rejected() {
    let store = store_with("/dir/file", b"x");
    let h = Harness::build(store, quick_config(), |_| {});
    let err = h.pool.open("/dir", 0).unwrap_err();
    assert_eq!(err.to_errno(), libc::EISDIR);
    assert!(h.pool.is_empty());
}

#[test]
fn test_close_without_open() {
    let h = Harness::new();
    let err = h.pool.close("/never").unwrap_err();
    assert!(matches!(err, CacheError::NotOpen(_)));
    assert_eq!(err.to_errno(), libc::EBADF);
}

// =============================================================================
// Directory-backed remote
// =============================================================================

#[test]
fn test_round_trip_through_dir_store() {
    init_tracing();
    let remote = tempfile::tempdir().unwrap();
    fs::write(remote.path().join("readme.md"), b"# kpfs").unwrap();
    let cache = tempfile::tempdir().unwrap();

    let store: std::sync::Arc<dyn RemoteStore> =
        std::sync::Arc::new(DirStore::new(remote.path()).unwrap());
    let tree = std::sync::Arc::new(NodeTree::new(store));
    let pool = kpfs_cache::CachePool::new(
        cache.path(),
        tree,
        quick_config(),
        tracing::Span::none(),
    )
    .unwrap();

    let file = pool.open("/readme.md", libc::O_RDWR).unwrap();
    assert_eq!(file.read(0, 100).unwrap(), b"# kpfs");
    file.write(6, b"\nnotes").unwrap();
    pool.close("/readme.md").unwrap();
    pool.wait_idle();

    assert_eq!(
        fs::read(remote.path().join("readme.md")).unwrap(),
        b"# kpfs\nnotes"
    );
    // The cache file carries the remote mtime after the upload.
    let remote_mtime = FileTime::from_last_modification_time(
        &fs::metadata(remote.path().join("readme.md")).unwrap(),
    );
    assert_eq!(mtime_of(&cache.path().join("readme.md")), remote_mtime);
    pool.shutdown();
}
