//! Logical expiry, physical reclamation and idempotent deletes

use std::time::Duration;

use tidepool_core::storage::test_fixtures::chunked_stream;
use tidepool_core::storage::{FileRepository, MetadataStore};
use tidepool_core::{StorageError, UploadRequest};

use crate::common::{TestStore, random_bytes};

#[tokio::test]
async fn test_expiry_precedes_sweep_and_sweep_reclaims_bytes() {
    let store = TestStore::open(&[None, None]).await;
    let entry = store
        .service
        .upload(
            chunked_stream(random_bytes(2048), 512),
            UploadRequest::new("short-lived.bin").with_retention(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    let kept = store
        .service
        .upload(
            chunked_stream(random_bytes(100), 100),
            UploadRequest::new("long-lived.bin").with_retention(Duration::from_secs(3600)),
        )
        .await
        .unwrap();

    let before = store.service.stats().await;
    assert_eq!(before.total_files, 2);
    assert_eq!(before.total_bytes, 2148);

    store.clock.advance(Duration::from_secs(30));

    // Logically gone, physically still present.
    assert!(matches!(
        store.service.stat(entry.id).await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        store.service.download(entry.id).await,
        Err(StorageError::NotFound { .. })
    ));
    let volume = store.service.volumes().get(&entry.volume).unwrap();
    assert!(volume.file_path(entry.id).exists());
    let logical = store.service.stats().await;
    assert_eq!(logical.total_files, 1);

    let sweeper = store.service.sweeper(Duration::ZERO);
    let report = sweeper.sweep_expired().await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.failed, 0);

    assert!(!volume.file_path(entry.id).exists());
    let after = store.service.stats().await;
    assert_eq!(after.total_files, 1);
    assert_eq!(after.total_bytes, 100);
    let used: u64 = after.volumes.iter().filter_map(|v| v.used_bytes).sum();
    assert_eq!(used, 100);
    assert!(store.service.stat(kept.id).await.is_ok());
}

#[tokio::test]
async fn test_deletes_are_idempotent() {
    let store = TestStore::open(&[None]).await;
    let entry = store
        .service
        .upload(chunked_stream(random_bytes(64), 64), UploadRequest::new("x"))
        .await
        .unwrap();
    let volume = store.service.volumes().get(&entry.volume).unwrap();

    let repository = FileRepository::new();
    repository.delete(entry.id, volume).await.unwrap();
    repository.delete(entry.id, volume).await.unwrap();

    let metadata = tidepool_core::storage::JsonMetadataStore::open(
        &store.config.storage.metadata_dir,
        std::sync::Arc::new(store.clock.clone()),
    )
    .await
    .unwrap();
    metadata.delete(entry.id).await.unwrap();
    metadata.delete(entry.id).await.unwrap();
}

#[tokio::test]
async fn test_background_sweeper_reclaims_expired_files() {
    let store = TestStore::open(&[None]).await;
    let entry = store
        .service
        .upload(
            chunked_stream(random_bytes(10), 10),
            UploadRequest::new("tick.bin").with_retention(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    store.clock.advance(Duration::from_secs(5));

    let handle = tidepool_core::spawn_sweeper(
        store.service.sweeper(Duration::ZERO),
        store.config.sweeper.clone(),
    );
    let volume = store.service.volumes().get(&entry.volume).unwrap();
    for _ in 0..200 {
        if !volume.file_path(entry.id).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(!volume.file_path(entry.id).exists());
    assert_eq!(store.service.stats().await.total_files, 0);
}
