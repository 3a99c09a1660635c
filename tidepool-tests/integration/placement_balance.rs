//! Placement spreads uploads evenly and re-probes on every call

use tidepool_core::storage::test_fixtures::chunked_stream;
use tidepool_core::{StorageError, UploadRequest};

use crate::common::{TestStore, random_bytes};

async fn upload_sized(store: &TestStore, size: usize) -> Result<String, StorageError> {
    let entry = store
        .service
        .upload(
            chunked_stream(random_bytes(size), 64),
            UploadRequest::new("unit.bin").with_size_hint(size as u64),
        )
        .await?;
    Ok(entry.volume.to_string())
}

#[tokio::test]
async fn test_equal_uploads_are_balanced() {
    let store = TestStore::open(&[Some(100_000), Some(100_000), Some(100_000)]).await;

    for _ in 0..11 {
        upload_sized(&store, 500).await.unwrap();
    }

    let report = store.service.stats().await;
    let counts: Vec<u64> = report.volumes.iter().map(|v| v.file_count).collect();
    let max = counts.iter().max().copied().unwrap();
    let min = counts.iter().min().copied().unwrap();
    assert_eq!(counts.iter().sum::<u64>(), 11);
    assert!(max - min <= 1, "unbalanced placement: {counts:?}");
}

#[tokio::test]
async fn test_placement_reprobes_between_uploads() {
    let store = TestStore::open(&[Some(10), Some(3)]).await;
    let volume_a = store.config.storage.volumes[0].root.to_string_lossy().into_owned();
    let volume_b = store.config.storage.volumes[1].root.to_string_lossy().into_owned();

    assert_eq!(upload_sized(&store, 5).await.unwrap(), volume_a);

    // A now has 5 free and B 3: neither fits 8.
    match upload_sized(&store, 8).await {
        Err(StorageError::InsufficientStorage { needed: 8, available: 5 }) => {}
        other => panic!("Expected InsufficientStorage, got {other:?}"),
    }

    assert_eq!(upload_sized(&store, 4).await.unwrap(), volume_a);
    // A has 1 free, B still 3.
    assert_eq!(upload_sized(&store, 3).await.unwrap(), volume_b);
    assert!(matches!(
        upload_sized(&store, 2).await,
        Err(StorageError::InsufficientStorage { .. })
    ));
}
