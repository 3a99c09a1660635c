//! Many simultaneous uploads against limited room

use std::sync::Arc;

use tidepool_core::storage::test_fixtures::{chunked_stream, collect_bytes};
use tidepool_core::{StorageError, UploadRequest};

use crate::common::{TestStore, random_bytes};

const UPLOADS: usize = 40;
const FILE_SIZE: usize = 1000;
const QUOTA: u64 = 10_000;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_never_overfill_or_corrupt() {
    let store = TestStore::open(&[Some(QUOTA), Some(QUOTA)]).await;

    let mut tasks = Vec::with_capacity(UPLOADS);
    for index in 0..UPLOADS {
        let service = Arc::clone(&store.service);
        tasks.push(tokio::spawn(async move {
            let data = random_bytes(FILE_SIZE);
            let result = service
                .upload(
                    chunked_stream(data.clone(), 100),
                    UploadRequest::new(format!("upload-{index}.bin"))
                        .with_size_hint(FILE_SIZE as u64),
                )
                .await;
            (data, result)
        }));
    }

    let mut successes = Vec::new();
    for task in tasks {
        let (data, result) = task.await.unwrap();
        match result {
            Ok(entry) => successes.push((data, entry)),
            Err(StorageError::InsufficientStorage { .. } | StorageError::WriteFailed { .. }) => {}
            Err(other) => panic!("Unexpected upload error: {other:?}"),
        }
    }

    assert!(!successes.is_empty());
    assert!(successes.len() <= 2 * (QUOTA as usize / FILE_SIZE));

    for (data, entry) in &successes {
        let download = store.service.download(entry.id).await.unwrap();
        assert_eq!(download.entry.size_bytes, FILE_SIZE as u64);
        assert_eq!(&collect_bytes(download.into_stream()).await.unwrap(), data);
    }

    let report = store.service.stats().await;
    assert_eq!(report.total_files, successes.len() as u64);
    for volume in &report.volumes {
        assert!(volume.used_bytes.unwrap() <= QUOTA, "{volume:?}");
    }
    for volume in store.service.volumes().iter() {
        assert!(volume.list_temp_files().await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_uploads_with_room_all_succeed() {
    let store = TestStore::open(&[None, None, None]).await;

    let handles: Vec<_> = (0..16)
        .map(|index| {
            let service = Arc::clone(&store.service);
            tokio::spawn(async move {
                let data = random_bytes(20_000 + index);
                let entry = service
                    .upload(chunked_stream(data.clone(), 4096), UploadRequest::new("p.bin"))
                    .await
                    .unwrap();
                (data, entry)
            })
        })
        .collect();

    for handle in handles {
        let (data, entry) = handle.await.unwrap();
        let download = store.service.download(entry.id).await.unwrap();
        assert_eq!(collect_bytes(download.into_stream()).await.unwrap(), data);
    }
    assert_eq!(store.service.stats().await.total_files, 16);
}
