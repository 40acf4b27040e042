//! Behavioral properties of the cache pool.

mod common;

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use filetime::FileTime;
use kpfs_cache::ModifiedState;
use kpfs_core::{RemoteStore, StoreCall};
use proptest::prelude::*;

// =============================================================================
// Reference counting
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The entry is registered exactly while opens outnumber closes, once
    /// background work has drained.
    #[test]
    fn test_entry_lives_while_references_remain(ops in prop::collection::vec(any::<bool>(), 1..40)) {
        let h = Harness::build(store_with("/p.txt", b"property"), quick_config(), |_| {});
        let mut open = 0usize;

        for is_open in ops {
            if is_open {
                h.pool.open("/p.txt", 0).unwrap();
                open += 1;
            } else if open > 0 {
                h.pool.close("/p.txt").unwrap();
                open -= 1;
            } else {
                continue;
            }
            h.pool.wait_idle();
            prop_assert_eq!(h.pool.contains("/p.txt"), open > 0);
            if let Some(entry) = h.pool.get("/p.txt") {
                prop_assert_eq!(entry.refcount(), open);
            }
        }

        for _ in 0..open {
            h.pool.close("/p.txt").unwrap();
        }
        h.pool.wait_idle();
        prop_assert!(h.pool.is_empty());
        prop_assert_eq!(h.store.upload_count("/p.txt"), 0);
    }
}

// =============================================================================
// Concurrent opens
// =============================================================================

#[test]
fn test_concurrent_cold_reads_see_same_content() {
    let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let h = Harness::build(
        store_with("/shared.bin", &content).with_read_limit(7),
        quick_config(),
        |_| {},
    );
    let barrier = Barrier::new(2);

    let results: Vec<Vec<u8>> = thread::scope(|s| {
        let readers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let entry = h.pool.open("/shared.bin", libc::O_RDONLY).unwrap();
                    let mut out = Vec::new();
                    let mut offset = 0u64;
                    loop {
                        let chunk = entry.read(offset, 500).unwrap();
                        if chunk.is_empty() {
                            break;
                        }
                        offset += chunk.len() as u64;
                        out.extend_from_slice(&chunk);
                    }
                    out
                })
            })
            .collect();
        readers.into_iter().map(|r| r.join().unwrap()).collect()
    });

    assert_eq!(results[0], content);
    assert_eq!(results[1], content);
    assert_eq!(h.store.download_count("/shared.bin"), 1);

    h.pool.close("/shared.bin").unwrap();
    h.pool.close("/shared.bin").unwrap();
    h.pool.wait_idle();
    assert!(h.pool.is_empty());
}

#[test]
fn test_concurrent_writers_on_distinct_files() {
    let h = Arc::new(Harness::new());

    thread::scope(|s| {
        for i in 0..8 {
            let h = Arc::clone(&h);
            s.spawn(move || {
                let path = format!("/w{i}.txt");
                let entry = h.pool.create(&path).unwrap();
                entry.write(0, path.as_bytes()).unwrap();
                h.pool.close(&path).unwrap();
            });
        }
    });
    h.pool.wait_idle();

    for i in 0..8 {
        let path = format!("/w{i}.txt");
        assert_eq!(h.store.contents(&path).unwrap(), path.as_bytes());
    }
    assert!(h.pool.is_empty());
}

// =============================================================================
// Timestamp convention
// =============================================================================

#[test]
fn test_upload_then_reopen_uses_cache() {
    let h = Harness::new();
    h.store.set_clock(Some(at(T0 + 500)));

    let entry = h.pool.create("/p3.txt").unwrap();
    entry.write(0, b"synced").unwrap();
    h.pool.close("/p3.txt").unwrap();
    h.pool.wait_idle();

    let remote = h.store.metadata("/p3.txt").unwrap();
    assert_eq!(
        mtime_of(&h.cache_file("/p3.txt")),
        FileTime::from_system_time(remote.mtime)
    );

    h.store.clear_calls();
    let entry = h.pool.open("/p3.txt", 0).unwrap();
    assert_eq!(entry.read(0, 100).unwrap(), b"synced");
    assert!(
        !h.store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Download(_)))
    );
    h.pool.close("/p3.txt").unwrap();
}

#[test]
fn test_newer_cache_file_is_uploaded_not_downloaded() {
    let h = Harness::build(store_with("/s.txt", b"remote"), quick_config(), |root| {
        let cache = root.join("s.txt");
        fs::write(&cache, b"unsent local edit").unwrap();
        filetime::set_file_mtime(
            &cache,
            FileTime::from_unix_time(i64::try_from(T0).unwrap() + 60, 0),
        )
        .unwrap();
    });

    let entry = h.pool.open("/s.txt", libc::O_RDWR).unwrap();
    assert_eq!(entry.state(), ModifiedState::StaleLocal);
    assert_eq!(h.store.download_count("/s.txt"), 0);

    h.pool.close("/s.txt").unwrap();
    h.pool.wait_idle();

    assert_eq!(h.store.download_count("/s.txt"), 0);
    assert_eq!(h.uploads_of("/s.txt"), vec![b"unsent local edit".to_vec()]);
    assert!(h.pool.is_empty());
}

#[test]
fn test_older_cache_file_is_replaced() {
    let h = Harness::build(store_with("/o.txt", b"fresh"), quick_config(), |root| {
        let cache = root.join("o.txt");
        fs::write(&cache, b"outdated").unwrap();
        filetime::set_file_mtime(
            &cache,
            FileTime::from_unix_time(i64::try_from(T0).unwrap() - 60, 0),
        )
        .unwrap();
    });

    let entry = h.pool.open("/o.txt", 0).unwrap();
    assert_eq!(entry.read(0, 100).unwrap(), b"fresh");
    assert_eq!(h.store.download_count("/o.txt"), 1);
    h.pool.close("/o.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(fs::read(h.cache_file("/o.txt")).unwrap(), b"fresh");
}

// =============================================================================
// Temporary files
// =============================================================================

#[test]
fn test_temporary_files_never_reach_remote() {
    let h = Harness::new();

    let lock = h.pool.create("/.~lock.doc#").unwrap();
    lock.write(0, b"user@host").unwrap();
    lock.flush().unwrap();
    h.pool.close("/.~lock.doc#").unwrap();

    let swap = h.pool.create("/docs-~draft").unwrap();
    swap.write(0, b"kept").unwrap();
    h.pool.close("/docs-~draft").unwrap();
    h.pool.wait_idle();

    assert_eq!(h.store.upload_count("/.~lock.doc#"), 0);
    assert_eq!(fs::read(h.cache_file("/.~lock.doc#")).unwrap(), b"user@host");
    // Only the base-name prefix marks a temporary file.
    assert!(h.store.upload_count("/docs-~draft") >= 1);
    assert!(h.pool.is_empty());
}

#[test]
fn test_temporary_file_renamed_to_real_name_uploads() {
    let h = Harness::new();

    let entry = h.pool.create("/~save.tmp").unwrap();
    entry.write(0, b"final").unwrap();
    h.pool.tree().move_node("/~save.tmp", "/report.txt").unwrap();
    h.pool.move_path("/~save.tmp", "/report.txt").unwrap();
    assert!(!entry.is_ignored());

    h.pool.close("/report.txt").unwrap();
    h.pool.wait_idle();
    assert_eq!(h.uploads_of("/report.txt"), vec![b"final".to_vec()]);
    assert_eq!(h.store.upload_count("/~save.tmp"), 0);
}
