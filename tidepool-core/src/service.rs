//! File service: the upload, download, stat and stats contract.
//!
//! Ties placement, the repository and the metadata store together. An entry
//! becomes visible only after both its bytes and its metadata are stored.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::stats::{StatsReport, StatsReporter};
use crate::storage::placement::choose_volume;
use crate::storage::{
    FileEntry, FileId, FileRepository, GreedyFreeSpace, JsonMetadataStore, MetadataStore,
    Placement, StorageError, StoredFile, VolumeSet,
};
use crate::sweeper::Sweeper;

/// Caller-supplied details of an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub original_name: String,
    /// Guessed from `original_name` when absent
    pub content_type: Option<String>,
    /// Declared size, used for placement and early rejection
    pub size_hint: Option<u64>,
    /// Overrides the configured retention window
    pub retention: Option<Duration>,
    /// Overrides the configured upload timeout
    pub deadline: Option<Instant>,
}

impl UploadRequest {
    pub fn new(original_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size_hint(mut self, size_bytes: u64) -> Self {
        self.size_hint = Some(size_bytes);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A live entry together with an open handle to its bytes.
#[derive(Debug)]
pub struct Download {
    pub entry: FileEntry,
    file: StoredFile,
}

impl Download {
    /// Streams the file contents.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        self.file.into_stream()
    }

    /// Splits into the entry and the byte stream.
    pub fn into_parts(
        self,
    ) -> (
        FileEntry,
        impl Stream<Item = io::Result<Bytes>> + Send + 'static,
    ) {
        (self.entry, self.file.into_stream())
    }
}

/// Expiring multi-volume file store.
pub struct FileService {
    volumes: Arc<VolumeSet>,
    repository: Arc<FileRepository>,
    metadata: Arc<dyn MetadataStore>,
    placement: Arc<dyn Placement>,
    clock: Arc<dyn Clock>,
    max_upload_bytes: u64,
    retention: Duration,
    upload_timeout: Option<Duration>,
}

impl FileService {
    /// Opens the configured volumes and metadata directory.
    ///
    /// # Errors
    ///
    /// - `StorageError::VolumeUnavailable` - If a volume or the metadata
    ///   directory cannot be used
    pub async fn open(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let volumes = Arc::new(VolumeSet::open(&config.volumes).await?);
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(JsonMetadataStore::open(&config.metadata_dir, Arc::clone(&clock)).await?);

        tracing::info!(
            "File service ready: {} volumes, max upload {} bytes, retention {:?}",
            volumes.len(),
            config.max_upload_bytes,
            config.retention
        );

        Ok(Self {
            volumes,
            repository: Arc::new(FileRepository::new()),
            metadata,
            placement: Arc::new(GreedyFreeSpace),
            clock,
            max_upload_bytes: config.max_upload_bytes,
            retention: config.retention,
            upload_timeout: config.upload_timeout,
        })
    }

    /// Replaces the placement heuristic.
    pub fn with_placement(mut self, placement: Arc<dyn Placement>) -> Self {
        self.placement = placement;
        self
    }

    /// Stores `body` and records its entry.
    ///
    /// Placement uses `size_hint` when given. Without one, the body is cut off
    /// as soon as it outgrows the free space of the chosen volume. Bytes are
    /// written before the entry is recorded; if recording fails the bytes are
    /// removed again.
    ///
    /// # Errors
    ///
    /// - `StorageError::PayloadTooLarge` - If the hint or the body exceeds the limit
    /// - `StorageError::InsufficientStorage` - If no volume has room, before or
    ///   while streaming
    /// - `StorageError::WriteFailed` - If writing fails, a concurrent commit
    ///   took the room, or the deadline passes
    /// - `StorageError::Conflict` - If the generated id is already taken
    pub async fn upload<S>(&self, body: S, request: UploadRequest) -> Result<FileEntry, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        if let Some(hint) = request.size_hint
            && hint > self.max_upload_bytes
        {
            return Err(StorageError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            });
        }

        let placed = choose_volume(
            &self.volumes,
            self.placement.as_ref(),
            request.size_hint.unwrap_or(0),
        )
        .await?;
        let volume = placed.volume;

        let id = FileId::generate();
        let write = self.repository.write_within(
            id,
            volume,
            body,
            self.max_upload_bytes,
            placed.free_bytes,
        );
        let deadline = request
            .deadline
            .or_else(|| self.upload_timeout.map(|timeout| Instant::now() + timeout));
        let size_bytes = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, write)
                .await
                .map_err(|_| {
                    StorageError::write_failed(volume.root(), "upload deadline exceeded")
                })??,
            None => write.await?,
        };

        let created_at = self.clock.now();
        let entry = FileEntry {
            id,
            volume: volume.id().clone(),
            content_type: request
                .content_type
                .filter(|content_type| !content_type.is_empty())
                .unwrap_or_else(|| {
                    mime_guess::from_path(&request.original_name)
                        .first_or_octet_stream()
                        .to_string()
                }),
            original_name: request.original_name,
            size_bytes,
            created_at,
            expires_at: expiry_time(created_at, request.retention.unwrap_or(self.retention)),
        };

        if let Err(e) = self.metadata.put(entry.clone()).await {
            if let Err(cleanup) = self.repository.delete(id, volume).await {
                tracing::warn!("Failed to remove bytes of unrecorded upload {}: {}", id, cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "Uploaded {} ({}, {} bytes) to volume {}",
            id,
            entry.original_name,
            size_bytes,
            volume.id()
        );
        Ok(entry)
    }

    /// Opens a live entry for streaming.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the id is unknown, expired or its bytes are gone
    /// - `StorageError::ReadFailed` - If the bytes cannot be opened
    pub async fn download(&self, id: FileId) -> Result<Download, StorageError> {
        let entry = self.metadata.get(id).await?;
        let Some(volume) = self.volumes.get(&entry.volume) else {
            tracing::warn!("Entry {} references unknown volume {}", id, entry.volume);
            return Err(StorageError::NotFound { id });
        };

        let file = self.repository.read(id, volume).await?;
        tracing::debug!("Serving {} from volume {}", id, volume.id());
        Ok(Download { entry, file })
    }

    /// Returns the live entry for `id`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the id is unknown or expired
    pub async fn stat(&self, id: FileId) -> Result<FileEntry, StorageError> {
        self.metadata.get(id).await
    }

    /// Removes a live entry: bytes first, then metadata.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the id is unknown or expired
    /// - `StorageError::WriteFailed` - If the bytes or the record cannot be removed
    pub async fn delete(&self, id: FileId) -> Result<(), StorageError> {
        let entry = self.metadata.get(id).await?;
        if let Some(volume) = self.volumes.get(&entry.volume) {
            self.repository.delete(id, volume).await?;
        }
        self.metadata.delete(id).await?;

        tracing::info!("Deleted {} on request", id);
        Ok(())
    }

    /// Current usage report.
    pub async fn stats(&self) -> StatsReport {
        self.stats_reporter().report().await
    }

    /// Reporter sharing this service's volumes and metadata.
    pub fn stats_reporter(&self) -> StatsReporter {
        StatsReporter::new(Arc::clone(&self.volumes), Arc::clone(&self.metadata))
    }

    /// Sweeper sharing this service's storage and clock.
    pub fn sweeper(&self, orphan_grace: Duration) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.volumes),
            Arc::clone(&self.repository),
            Arc::clone(&self.metadata),
            Arc::clone(&self.clock),
            orphan_grace,
        )
    }

    pub fn volumes(&self) -> &VolumeSet {
        &self.volumes
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Current time according to the service clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn expiry_time(created_at: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| created_at.checked_add_signed(retention))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt, stream};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TidepoolConfig;
    use crate::storage::test_fixtures::{chunked_stream, collect_bytes, count_volume_files};

    async fn create_service() -> (tempfile::TempDir, ManualClock, FileService) {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let config = TidepoolConfig::for_testing(temp_dir.path());
        let service = FileService::open(&config.storage, Arc::new(clock.clone()))
            .await
            .unwrap();
        (temp_dir, clock, service)
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (_temp_dir, _clock, service) = create_service().await;
        let data = b"hello, tidepool".to_vec();

        let entry = service
            .upload(
                chunked_stream(data.clone(), 4),
                UploadRequest::new("greeting.txt"),
            )
            .await
            .unwrap();

        assert_eq!(entry.size_bytes, data.len() as u64);
        assert_eq!(entry.content_type, "text/plain");
        assert_eq!(entry.expires_at - entry.created_at, TimeDelta::seconds(60));

        let download = service.download(entry.id).await.unwrap();
        assert_eq!(download.entry, entry);
        assert_eq!(collect_bytes(download.into_stream()).await.unwrap(), data);
        assert_eq!(service.stat(entry.id).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_explicit_content_type_and_retention() {
        let (_temp_dir, _clock, service) = create_service().await;

        let entry = service
            .upload(
                chunked_stream(vec![1, 2, 3], 3),
                UploadRequest::new("blob")
                    .with_content_type("application/x-custom")
                    .with_retention(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        assert_eq!(entry.content_type, "application/x-custom");
        assert_eq!(entry.expires_at - entry.created_at, TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_oversized_hint_is_rejected_before_reading() {
        let (_temp_dir, _clock, service) = create_service().await;
        let limit = service.max_upload_bytes();

        // Reading this body would fail the test with a different error.
        let body = stream::iter(vec![Err(io::Error::other("body must not be read"))]);
        let result = service
            .upload(body, UploadRequest::new("big.iso").with_size_hint(limit + 1))
            .await;

        match result {
            Err(StorageError::PayloadTooLarge { limit: reported }) => assert_eq!(reported, limit),
            other => panic!("Expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_found_before_sweep() {
        let (_temp_dir, clock, service) = create_service().await;
        let entry = service
            .upload(chunked_stream(vec![9; 10], 10), UploadRequest::new("a.bin"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));

        assert!(matches!(
            service.download(entry.id).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            service.stat(entry.id).await,
            Err(StorageError::NotFound { .. })
        ));
        // Bytes are still on disk until the sweeper runs.
        let volume = service.volumes().get(&entry.volume).unwrap();
        assert!(volume.file_path(entry.id).exists());
    }

    #[tokio::test]
    async fn test_delete_removes_bytes_and_entry() {
        let (_temp_dir, _clock, service) = create_service().await;
        let entry = service
            .upload(chunked_stream(vec![5; 32], 8), UploadRequest::new("x.bin"))
            .await
            .unwrap();

        service.delete(entry.id).await.unwrap();

        let volume = service.volumes().get(&entry.volume).unwrap();
        assert!(!volume.file_path(entry.id).exists());
        assert!(matches!(
            service.delete(entry.id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_deadline_is_write_failed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = TidepoolConfig::for_testing(temp_dir.path());
        let service = FileService::open(&config.storage, Arc::new(ManualClock::starting_now()))
            .await
            .unwrap();

        let body = stream::iter(vec![Ok(Bytes::from_static(b"slow"))]).chain(stream::pending());
        let request = UploadRequest::new("slow.bin")
            .with_deadline(Instant::now() + Duration::from_millis(50));
        let result = service.upload(body, request).await;

        match result {
            Err(error @ StorageError::WriteFailed { .. }) => assert!(error.is_retryable()),
            other => panic!("Expected WriteFailed, got {other:?}"),
        }
        for volume in &config.storage.volumes {
            assert_eq!(count_volume_files(volume), 0);
        }
    }

    #[test]
    fn test_expiry_time_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_time(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            expiry_time(now, Duration::from_secs(10)),
            now + TimeDelta::seconds(10)
        );
    }
}
