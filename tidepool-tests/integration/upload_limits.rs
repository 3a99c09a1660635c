//! Maximum size boundary and cleanup of rejected uploads

use futures::StreamExt;
use futures::stream;
use tidepool_core::storage::test_fixtures::{chunked_stream, count_volume_files, interrupted_stream};
use tidepool_core::{StorageError, UploadRequest};

use crate::common::{TestStore, random_bytes};

fn assert_no_files_left(store: &TestStore) {
    for volume in &store.config.storage.volumes {
        assert_eq!(count_volume_files(volume), 0, "{}", volume.root.display());
    }
}

#[tokio::test]
async fn test_upload_exactly_at_limit_succeeds() {
    let store = TestStore::open(&[None, None]).await;
    let limit = store.service.max_upload_bytes() as usize;

    let entry = store
        .service
        .upload(chunked_stream(random_bytes(limit), 8192), UploadRequest::new("full.bin"))
        .await
        .unwrap();

    assert_eq!(entry.size_bytes, limit as u64);
}

#[tokio::test]
async fn test_one_byte_over_limit_leaves_nothing() {
    let store = TestStore::open(&[None, None]).await;
    let limit = store.service.max_upload_bytes();

    let result = store
        .service
        .upload(
            chunked_stream(random_bytes(limit as usize + 1), 8192),
            UploadRequest::new("over.bin"),
        )
        .await;

    match result {
        Err(StorageError::PayloadTooLarge { limit: reported }) => assert_eq!(reported, limit),
        other => panic!("Expected PayloadTooLarge, got {other:?}"),
    }
    assert_no_files_left(&store);
    assert_eq!(store.service.stats().await.total_files, 0);
}

#[tokio::test]
async fn test_failed_and_abandoned_uploads_leave_nothing() {
    let store = TestStore::open(&[None]).await;

    let interrupted = store
        .service
        .upload(interrupted_stream(random_bytes(1000)), UploadRequest::new("cut.bin"))
        .await;
    assert!(matches!(interrupted, Err(StorageError::WriteFailed { .. })));

    // A client that stops sending is dropped by the caller mid-upload.
    let stalled = stream::iter(vec![Ok(bytes::Bytes::from(random_bytes(512)))]).chain(stream::pending());
    let abandoned = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        store.service.upload(stalled, UploadRequest::new("stalled.bin")),
    )
    .await;
    assert!(abandoned.is_err());

    assert_no_files_left(&store);
}

#[tokio::test]
async fn test_no_volume_with_room_is_insufficient_storage() {
    let store = TestStore::open(&[Some(100), Some(50)]).await;

    let result = store
        .service
        .upload(
            chunked_stream(random_bytes(101), 101),
            UploadRequest::new("wide.bin").with_size_hint(101),
        )
        .await;

    match result {
        Err(StorageError::InsufficientStorage { needed, available }) => {
            assert_eq!(needed, 101);
            assert_eq!(available, 100);
        }
        other => panic!("Expected InsufficientStorage, got {other:?}"),
    }
    assert_no_files_left(&store);
}

#[tokio::test]
async fn test_unhinted_upload_too_big_for_any_volume_is_insufficient_storage() {
    let store = TestStore::open(&[Some(100), Some(50)]).await;

    let result = store
        .service
        .upload(chunked_stream(random_bytes(101), 101), UploadRequest::new("wide.bin"))
        .await;

    assert!(result.as_ref().is_err_and(|error| !error.is_retryable()));
    match result {
        Err(StorageError::InsufficientStorage { needed, available }) => {
            assert_eq!(needed, 101);
            assert_eq!(available, 100);
        }
        other => panic!("Expected InsufficientStorage, got {other:?}"),
    }
    assert_no_files_left(&store);

    let entry = store
        .service
        .upload(chunked_stream(random_bytes(100), 7), UploadRequest::new("snug.bin"))
        .await
        .unwrap();
    assert_eq!(entry.size_bytes, 100);
}
