use std::sync::Arc;
use std::time::Duration;

use mock::{StubActionCache, StubCAS, TestData, TestDirectory};
use store::{
    EntryType, RemoteActionCache, RemoteOptions, RemoteStore, Store, StoreError,
};
use task_executor::Executor;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn options(concurrency_limit: usize) -> RemoteOptions {
    RemoteOptions {
        concurrency_limit,
        timeout: Duration::from_secs(5),
    }
}

fn store_with_remote(cas: Arc<StubCAS>, limit: usize) -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::local_only(Executor::from_current(), dir.path())
        .unwrap()
        .with_remote(RemoteStore::new(cas, options(limit)));
    (dir, store)
}

// ===========================================================================
// Concurrency limit
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_loads_respect_concurrency_limit() {
    let cas = Arc::new(
        StubCAS::builder()
            .file(&TestData::roland())
            .latency(Duration::from_millis(50))
            .build(),
    );
    let remote = RemoteStore::new(cas.clone(), options(2));

    let loads = (0..8).map(|_| remote.load(TestData::roland().digest()));
    let results = futures::future::join_all(loads).await;

    for result in results {
        assert_eq!(result.unwrap(), Some(TestData::roland().bytes()));
    }
    assert_eq!(cas.read_request_count(), 8);
    assert_eq!(remote.requests_started(), 8);
    assert!(
        cas.peak_concurrency() <= 2,
        "peak concurrency {} exceeded limit",
        cas.peak_concurrency()
    );
    assert_eq!(remote.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limit_of_zero_still_admits_one_request() {
    let cas = Arc::new(StubCAS::builder().file(&TestData::catnip()).build());
    let remote = RemoteStore::new(cas.clone(), options(0));
    let loaded = remote.load(TestData::catnip().digest()).await.unwrap();
    assert_eq!(loaded, Some(TestData::catnip().bytes()));
    assert_eq!(cas.peak_concurrency(), 1);
}

#[tokio::test]
async fn slow_remote_times_out() {
    let cas = Arc::new(
        StubCAS::builder()
            .file(&TestData::roland())
            .latency(Duration::from_millis(500))
            .build(),
    );
    let remote = RemoteStore::new(
        cas,
        RemoteOptions {
            concurrency_limit: 1,
            timeout: Duration::from_millis(20),
        },
    );
    let err = remote.load(TestData::roland().digest()).await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout { operation: "load", .. }));
    // The permit is released after the timeout.
    assert_eq!(remote.in_flight(), 0);
}

#[tokio::test]
async fn failing_remote_reports_operation() {
    let cas = Arc::new(StubCAS::builder().always_errors().build());
    let remote = RemoteStore::new(cas, options(1));
    let err = remote
        .store_bytes(TestData::roland().digest(), TestData::roland().bytes())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("remote store_bytes failed"));
}

// ===========================================================================
// Store fall-through
// ===========================================================================

#[tokio::test]
async fn local_miss_backfills_from_remote() {
    let cas = Arc::new(StubCAS::builder().file(&TestData::roland()).build());
    let (_dir, store) = store_with_remote(cas.clone(), 4);

    let first = store
        .load_file_bytes_with(TestData::roland().digest(), <[u8]>::to_vec)
        .await
        .unwrap();
    assert_eq!(first, Some(TestData::roland().bytes().to_vec()));
    assert_eq!(cas.read_request_count(), 1);

    // Second load is served locally.
    store
        .load_file_bytes_with(TestData::roland().digest(), <[u8]>::to_vec)
        .await
        .unwrap();
    assert_eq!(cas.read_request_count(), 1);
}

#[tokio::test]
async fn materialize_pulls_tree_from_remote() {
    let cas = Arc::new(
        StubCAS::builder()
            .file(&TestData::roland())
            .directory(&TestDirectory::containing_roland())
            .directory(&TestDirectory::nested())
            .build(),
    );
    let (_dir, store) = store_with_remote(cas, 4);
    let out = TempDir::new().unwrap();
    store
        .materialize_directory(out.path().to_owned(), TestDirectory::nested().digest())
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(out.path().join("cats/roland.ext")).unwrap(),
        TestData::roland().string()
    );
}

#[tokio::test]
async fn upload_with_wrong_digest_is_rejected() {
    let cas = Arc::new(StubCAS::empty());
    let remote = RemoteStore::new(cas.clone(), options(1));
    let err = remote
        .store_bytes(TestData::roland().digest(), TestData::catnip().bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Remote { .. }));
    assert!(!cas.contains(TestData::roland().digest()));
}

#[tokio::test]
async fn ensure_remote_has_recursive_uploads_only_missing() {
    let cas = Arc::new(StubCAS::builder().file(&TestData::roland()).build());
    let (_dir, store) = store_with_remote(cas.clone(), 4);

    store
        .store_file_bytes(TestData::roland().bytes())
        .await
        .unwrap();
    store
        .record_directory(&TestDirectory::containing_roland().directory())
        .await
        .unwrap();
    store
        .record_directory(&TestDirectory::nested().directory())
        .await
        .unwrap();

    store
        .ensure_remote_has_recursive(vec![TestDirectory::nested().digest()])
        .await
        .unwrap();

    assert!(cas.contains(TestDirectory::nested().digest()));
    assert!(cas.contains(TestDirectory::containing_roland().digest()));
    // Roland was already present remotely, so only the two directories moved.
    assert_eq!(cas.write_request_count(), 2);
    assert_eq!(cas.list_request_count(), 1);
}

#[tokio::test]
async fn ensure_remote_has_files_requires_local_copy() {
    let cas = Arc::new(StubCAS::empty());
    let (_dir, store) = store_with_remote(cas, 4);
    let err = store
        .ensure_remote_has_files(vec![TestData::catnip().digest()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::MissingDigest {
            entry_type: EntryType::File,
            ..
        }
    ));
}

// ===========================================================================
// Action cache
// ===========================================================================

#[tokio::test]
async fn action_results_are_written_through_and_read_back() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(StubActionCache::new());
    let store = Store::local_only(Executor::from_current(), dir.path())
        .unwrap()
        .with_remote_action_cache(RemoteActionCache::new(cache.clone(), options(2)));

    let action = TestData::new("action").digest();
    let result = TestData::new("result").digest();
    store.record_action_result(action, result).await.unwrap();
    assert_eq!(cache.get(action), Some(result));

    // A fresh local store sees the remote entry and caches it locally.
    let other_dir = TempDir::new().unwrap();
    let remote_cache = RemoteActionCache::new(cache.clone(), options(2));
    let other = Store::local_only(Executor::from_current(), other_dir.path())
        .unwrap()
        .with_remote_action_cache(remote_cache.clone());
    assert_eq!(other.load_action_result(action).await.unwrap(), Some(result));
    assert_eq!(other.load_action_result(action).await.unwrap(), Some(result));
    assert_eq!(remote_cache.requests_started(), 1);
}
