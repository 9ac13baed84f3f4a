//! Storage accounting under concurrent mutations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::TestBackend;
use filedock::driver::UploadFile;
use filedock::storage::{directory_size, StorageManager};
use filedock::ConnectorCommand;

async fn concurrent_uploads(t: &TestBackend, count: usize, bytes: usize) -> usize {
    let root = t.root_hash();
    let mut handles = Vec::new();
    for i in 0..count {
        let connector = Arc::clone(t.backend.connector());
        let command = ConnectorCommand::new("upload")
            .with_arg("target", root.clone())
            .with_file(UploadFile::new(format!("f{i}.bin"), vec![0u8; bytes]));
        handles.push(tokio::spawn(async move { connector.process(command).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_success() {
            succeeded += 1;
        }
    }
    succeeded
}

fn walked_total(t: &TestBackend) -> u64 {
    directory_size(t.volume().root(), Some(t.volume().thumbnail_dir())).unwrap() as u64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_match_tree_walk() {
    let t = TestBackend::with_volume(|v| v.max_storage = Some(1_000_000));
    let succeeded = concurrent_uploads(&t, 24, 1000).await;
    assert_eq!(succeeded, 24);
    assert_eq!(t.usage().await, 24_000);
    assert_eq!(t.usage().await, walked_total(&t));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_never_exceed_quota() {
    let t = TestBackend::with_volume(|v| v.max_storage = Some(5000));
    let succeeded = concurrent_uploads(&t, 20, 1000).await;
    assert_eq!(succeeded, 5);

    let usage = t.usage().await;
    assert_eq!(usage, 5000);
    assert_eq!(usage, walked_total(&t));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_mutations_match_tree_walk() {
    let t = TestBackend::with_volume(|v| v.max_storage = Some(1_000_000));
    assert_eq!(concurrent_uploads(&t, 10, 500).await, 10);

    let mut handles = Vec::new();
    for i in 0..10 {
        let connector = Arc::clone(t.backend.connector());
        let command = if i % 2 == 0 {
            ConnectorCommand::new("rm").with_arg("targets[]", t.hash(&format!("f{i}.bin")))
        } else {
            ConnectorCommand::new("duplicate").with_arg("targets[]", t.hash(&format!("f{i}.bin")))
        };
        handles.push(tokio::spawn(async move { connector.process(command).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    // 5 removed, 5 duplicated.
    assert_eq!(t.usage().await, 5000);
    assert_eq!(t.usage().await, walked_total(&t));
}

#[tokio::test]
async fn test_idle_total_evicted_and_lock_exclusive() {
    let storage = Arc::new(StorageManager::with_limits(
        Duration::from_millis(20),
        Duration::from_secs(60),
        16,
    ));
    let (lock, created) = storage.lock("root", || async { Ok(42) }).await.unwrap();
    assert!(created);
    assert_eq!(lock.total(), 42);

    let second = tokio::time::timeout(
        Duration::from_millis(50),
        storage.lock("root", || async { Ok(0) }),
    )
    .await;
    assert!(second.is_err(), "second locker must wait");

    storage.unlock(Some(lock));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(storage.sweep_expired(), 1);
    assert!(!storage.contains("root"));

    let (lock, created) = storage.lock("root", || async { Ok(7) }).await.unwrap();
    assert!(created);
    assert_eq!(lock.total(), 7);
}
