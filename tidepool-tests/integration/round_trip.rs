//! Upload then download returns identical bytes and metadata

use tidepool_core::UploadRequest;
use tidepool_core::storage::test_fixtures::{chunked_stream, collect_bytes};

use crate::common::{TestStore, random_bytes};

#[tokio::test]
async fn test_round_trip_identity_across_sizes() {
    let store = TestStore::open(&[None, None]).await;

    for (size, chunk) in [(0, 1), (1, 1), (4096, 1000), (200_003, 65_536)] {
        let data = random_bytes(size);
        let entry = store
            .service
            .upload(
                chunked_stream(data.clone(), chunk),
                UploadRequest::new(format!("blob-{size}.bin")),
            )
            .await
            .unwrap();
        assert_eq!(entry.size_bytes, size as u64);

        let download = store.service.download(entry.id).await.unwrap();
        assert_eq!(download.entry, entry);
        assert_eq!(collect_bytes(download.into_stream()).await.unwrap(), data);
        assert_eq!(store.service.stat(entry.id).await.unwrap(), entry);
    }
}

#[tokio::test]
async fn test_reads_survive_concurrent_delete() {
    let store = TestStore::open(&[None]).await;
    let data = random_bytes(150_000);
    let entry = store
        .service
        .upload(chunked_stream(data.clone(), 10_000), UploadRequest::new("held.bin"))
        .await
        .unwrap();

    // An open download keeps streaming the complete file after removal.
    let download = store.service.download(entry.id).await.unwrap();
    store.service.delete(entry.id).await.unwrap();

    assert_eq!(collect_bytes(download.into_stream()).await.unwrap(), data);
    assert!(store.service.download(entry.id).await.is_err());
}
