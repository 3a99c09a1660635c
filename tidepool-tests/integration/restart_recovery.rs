//! Metadata survives restarts and reconciliation heals partial failures

use std::time::Duration;

use tidepool_core::storage::test_fixtures::{chunked_stream, collect_bytes};
use tidepool_core::{FileId, StorageError, UploadRequest};

use crate::common::{TestStore, random_bytes};

#[tokio::test]
async fn test_entries_survive_restart() {
    let store = TestStore::open(&[None, None]).await;
    let data = random_bytes(5000);
    let entry = store
        .service
        .upload(chunked_stream(data.clone(), 700), UploadRequest::new("keep.txt"))
        .await
        .unwrap();

    let restarted = store.reopen().await;

    assert_eq!(restarted.stat(entry.id).await.unwrap(), entry);
    let download = restarted.download(entry.id).await.unwrap();
    assert_eq!(collect_bytes(download.into_stream()).await.unwrap(), data);
}

#[tokio::test]
async fn test_reconcile_heals_both_substrates() {
    let store = TestStore::open(&[None, None]).await;

    // Bytes without metadata, as after a crash between rename and record.
    let stray = FileId::generate();
    let volume = store.service.volumes().by_index(1).unwrap();
    std::fs::write(volume.file_path(stray), b"stray").unwrap();

    // Metadata without bytes, as after a crash mid-sweep.
    let entry = store
        .service
        .upload(chunked_stream(random_bytes(10), 10), UploadRequest::new("lost.bin"))
        .await
        .unwrap();
    let holder = store.service.volumes().get(&entry.volume).unwrap();
    std::fs::remove_file(holder.file_path(entry.id)).unwrap();

    let intact = store
        .service
        .upload(chunked_stream(random_bytes(10), 10), UploadRequest::new("fine.bin"))
        .await
        .unwrap();

    let sweeper = store.reopen().await.sweeper(Duration::ZERO);
    let report = sweeper.reconcile().await;
    assert_eq!(report.orphan_files_removed, 1);
    assert_eq!(report.orphan_records_removed, 1);
    assert_eq!(report.failed, 0);

    let restarted = store.reopen().await;
    assert!(!volume.file_path(stray).exists());
    assert!(matches!(
        restarted.stat(entry.id).await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(restarted.stat(intact.id).await.is_ok());
}

#[tokio::test]
async fn test_grace_period_protects_fresh_files() {
    let store = TestStore::open(&[None]).await;
    let fresh = FileId::generate();
    let volume = store.service.volumes().by_index(0).unwrap();
    std::fs::write(volume.file_path(fresh), b"in flight").unwrap();

    let report = store
        .service
        .sweeper(Duration::from_secs(600))
        .reconcile()
        .await;

    assert_eq!(report.orphan_files_removed, 0);
    assert!(volume.file_path(fresh).exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlinked_volume_alias_is_refused_and_live_files_survive() {
    let store = TestStore::open(&[None]).await;
    let entry = store
        .service
        .upload(chunked_stream(random_bytes(10), 10), UploadRequest::new("live.bin"))
        .await
        .unwrap();

    let root = store.config.storage.volumes[0].root.clone();
    let link = root.with_extension("link");
    std::os::unix::fs::symlink(&root, &link).unwrap();

    let mut aliased = store.config.storage.clone();
    aliased
        .volumes
        .push(tidepool_core::storage::VolumeConfig::new(&link));
    let result =
        tidepool_core::FileService::open(&aliased, std::sync::Arc::new(store.clock.clone())).await;
    assert!(matches!(result, Err(StorageError::VolumeUnavailable { .. })));

    let report = store.service.sweeper(Duration::ZERO).reconcile().await;
    assert_eq!(report.orphan_files_removed, 0);
    assert_eq!(report.orphan_records_removed, 0);
    assert!(store.service.download(entry.id).await.is_ok());
}
