//! Metadata store: durable mapping from file id to its entry.
//!
//! `JsonMetadataStore` keeps one JSON record per id in a directory and an
//! in-memory index loaded at startup. A record becomes visible only after it
//! has been written, synced and renamed into place.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, stream};
use parking_lot::{Mutex, RwLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{FileEntry, FileId, StorageError, VolumeId, sync_dir};
use crate::clock::Clock;

const RECORD_EXTENSION: &str = ".json";
const TEMP_RECORD_EXTENSION: &str = ".json.tmp";

/// Live entry totals for one volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeEntryUsage {
    pub file_count: u64,
    pub bytes: u64,
}

/// Durable storage of file entries.
///
/// Every read operation except `lookup` and `list_records` hides entries
/// whose `expires_at` is at or before the store's current time.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records a new entry.
    ///
    /// # Errors
    ///
    /// - `StorageError::Conflict` - If the id already exists
    /// - `StorageError::WriteFailed` - If the record cannot be persisted
    async fn put(&self, entry: FileEntry) -> Result<(), StorageError>;

    /// Returns the live entry for `id`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If absent or expired
    async fn get(&self, id: FileId) -> Result<FileEntry, StorageError>;

    /// Returns the entry for `id` regardless of expiry.
    async fn lookup(&self, id: FileId) -> Option<FileEntry>;

    /// Lazily yields entries expired at `now`.
    ///
    /// Each item is re-checked against the store as it is pulled, so entries
    /// deleted in the meantime are skipped. Calling again starts over.
    fn list_expired(&self, now: DateTime<Utc>) -> BoxStream<'static, FileEntry>;

    /// Removes the entry for `id`. Removing an absent entry succeeds.
    ///
    /// # Errors
    ///
    /// - `StorageError::WriteFailed` - If the record exists but cannot be removed
    async fn delete(&self, id: FileId) -> Result<(), StorageError>;

    /// Live entries, oldest first.
    async fn list_all(&self) -> Vec<FileEntry>;

    /// Every record including expired ones.
    async fn list_records(&self) -> Vec<FileEntry>;

    /// Live entry counts and byte totals per volume.
    async fn usage_by_volume(&self) -> HashMap<VolumeId, VolumeEntryUsage>;
}

type Index = Arc<RwLock<HashMap<FileId, FileEntry>>>;

/// Metadata store keeping one JSON file per entry.
#[derive(Debug)]
pub struct JsonMetadataStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    index: Index,
    // Ids whose record is being written; they count as taken for `put`.
    pending: Arc<Mutex<HashSet<FileId>>>,
}

impl JsonMetadataStore {
    /// Opens the store, loading every record found in `dir`.
    ///
    /// Unreadable records are logged and skipped; leftover temporary records
    /// from an interrupted write are removed.
    ///
    /// # Errors
    ///
    /// - `StorageError::VolumeUnavailable` - If the directory cannot be created or listed
    pub async fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let unavailable = |e: io::Error| StorageError::VolumeUnavailable {
            path: dir.clone(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&dir).await.map_err(unavailable)?;
        let entries = load_records(&dir).await.map_err(unavailable)?;
        tracing::info!(
            "Loaded {} metadata records from {}",
            entries.len(),
            dir.display()
        );

        Ok(Self {
            dir,
            clock,
            index: Arc::new(RwLock::new(entries)),
            pending: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: FileId) -> PathBuf {
        self.dir.join(format!("{id}{RECORD_EXTENSION}"))
    }

    async fn write_record(&self, entry: &FileEntry) -> Result<(), StorageError> {
        let path = self.record_path(entry.id);
        let temp_path = self.dir.join(format!("{}{TEMP_RECORD_EXTENSION}", entry.id));
        let json =
            serde_json::to_vec_pretty(entry).map_err(|e| StorageError::write_failed(&path, e))?;

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await?;
            sync_dir(&self.dir).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::write_failed(&path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn put(&self, entry: FileEntry) -> Result<(), StorageError> {
        let id = entry.id;
        let reservation = {
            let index = self.index.read();
            let mut pending = self.pending.lock();
            if index.contains_key(&id) || !pending.insert(id) {
                return Err(StorageError::Conflict { id });
            }
            PendingReservation {
                id,
                pending: Arc::clone(&self.pending),
            }
        };

        self.write_record(&entry).await?;
        self.index.write().insert(id, entry);
        drop(reservation);

        tracing::debug!("Recorded metadata for {}", id);
        Ok(())
    }

    async fn get(&self, id: FileId) -> Result<FileEntry, StorageError> {
        let now = self.clock.now();
        self.index
            .read()
            .get(&id)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn lookup(&self, id: FileId) -> Option<FileEntry> {
        self.index.read().get(&id).cloned()
    }

    fn list_expired(&self, now: DateTime<Utc>) -> BoxStream<'static, FileEntry> {
        let mut ids: Vec<(DateTime<Utc>, FileId)> = self
            .index
            .read()
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| (entry.expires_at, entry.id))
            .collect();
        ids.sort();

        let index = Arc::clone(&self.index);
        stream::iter(ids)
            .filter_map(move |(_, id)| {
                let entry = index
                    .read()
                    .get(&id)
                    .filter(|entry| entry.is_expired(now))
                    .cloned();
                async move { entry }
            })
            .boxed()
    }

    async fn delete(&self, id: FileId) -> Result<(), StorageError> {
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::write_failed(&path, e)),
        }

        if self.index.write().remove(&id).is_some() {
            tracing::debug!("Removed metadata for {}", id);
        }
        Ok(())
    }

    async fn list_all(&self) -> Vec<FileEntry> {
        let now = self.clock.now();
        let mut entries: Vec<FileEntry> = self
            .index
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.created_at, entry.id));
        entries
    }

    async fn list_records(&self) -> Vec<FileEntry> {
        self.index.read().values().cloned().collect()
    }

    async fn usage_by_volume(&self) -> HashMap<VolumeId, VolumeEntryUsage> {
        let now = self.clock.now();
        let mut usage: HashMap<VolumeId, VolumeEntryUsage> = HashMap::new();
        for entry in self.index.read().values() {
            if entry.is_expired(now) {
                continue;
            }
            let totals = usage.entry(entry.volume.clone()).or_default();
            totals.file_count += 1;
            totals.bytes += entry.size_bytes;
        }
        usage
    }
}

/// Releases a pending id when the put finishes or is cancelled.
struct PendingReservation {
    id: FileId,
    pending: Arc<Mutex<HashSet<FileId>>>,
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

async fn load_records(dir: &Path) -> io::Result<HashMap<FileId, FileEntry>> {
    let mut entries = HashMap::new();
    let mut listing = fs::read_dir(dir).await?;

    while let Some(item) = listing.next_entry().await? {
        let path = item.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if name.ends_with(TEMP_RECORD_EXTENSION) {
            tracing::debug!("Removing interrupted record {}", path.display());
            if let Err(e) = fs::remove_file(&path).await {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
            continue;
        }

        let Some(stem) = name.strip_suffix(RECORD_EXTENSION) else {
            continue;
        };
        match read_record(&path).await {
            Ok(entry) if entry.id.to_string() == stem => {
                entries.insert(entry.id, entry);
            }
            Ok(entry) => {
                tracing::warn!(
                    "Skipping record {}: contains id {}",
                    path.display(),
                    entry.id
                );
            }
            Err(e) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }

    Ok(entries)
}

async fn read_record(path: &Path) -> io::Result<FileEntry> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use futures::StreamExt;

    use super::*;
    use crate::clock::ManualClock;

    fn create_test_entry(clock: &ManualClock, volume: &str, size_bytes: u64) -> FileEntry {
        let created_at = clock.now();
        FileEntry {
            id: FileId::generate(),
            volume: VolumeId::new(volume),
            original_name: "notes.txt".to_string(),
            content_type: "text/plain".to_string(),
            size_bytes,
            created_at,
            expires_at: created_at + TimeDelta::hours(1),
        }
    }

    async fn open_store(dir: &Path, clock: &ManualClock) -> JsonMetadataStore {
        JsonMetadataStore::open(dir, Arc::new(clock.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let entry = create_test_entry(&clock, "/srv/a", 12);

        let store = open_store(temp_dir.path(), &clock).await;
        store.put(entry.clone()).await.unwrap();
        assert_eq!(store.get(entry.id).await.unwrap(), entry);
        drop(store);

        let reopened = open_store(temp_dir.path(), &clock).await;
        assert_eq!(reopened.get(entry.id).await.unwrap(), entry);
    }

    #[tokio::test]
    async fn test_put_conflict() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store = open_store(temp_dir.path(), &clock).await;
        let entry = create_test_entry(&clock, "/srv/a", 1);

        store.put(entry.clone()).await.unwrap();
        let result = store.put(entry.clone()).await;

        assert!(matches!(result, Err(StorageError::Conflict { id }) if id == entry.id));
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store = open_store(temp_dir.path(), &clock).await;
        let entry = create_test_entry(&clock, "/srv/a", 5);
        store.put(entry.clone()).await.unwrap();

        clock.advance(Duration::from_secs(3599));
        assert!(store.get(entry.id).await.is_ok());

        clock.advance(Duration::from_secs(1));
        assert!(matches!(
            store.get(entry.id).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(store.list_all().await.is_empty());
        assert!(store.usage_by_volume().await.is_empty());
        assert_eq!(store.lookup(entry.id).await, Some(entry.clone()));
        assert_eq!(store.list_records().await, vec![entry]);
    }

    #[tokio::test]
    async fn test_list_expired_is_lazy_and_restartable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store = open_store(temp_dir.path(), &clock).await;

        let first = create_test_entry(&clock, "/srv/a", 1);
        let second = create_test_entry(&clock, "/srv/b", 2);
        store.put(first.clone()).await.unwrap();
        store.put(second.clone()).await.unwrap();
        clock.advance(Duration::from_secs(7200));

        let mut expired = store.list_expired(clock.now());
        let pulled = expired.next().await.unwrap();
        // Deleting the other entry before it is pulled removes it from the stream.
        let other = if pulled.id == first.id { &second } else { &first };
        store.delete(other.id).await.unwrap();
        assert!(expired.next().await.is_none());

        let again: Vec<FileEntry> = store.list_expired(clock.now()).collect().await;
        assert_eq!(again, vec![pulled]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_durable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store = open_store(temp_dir.path(), &clock).await;
        let entry = create_test_entry(&clock, "/srv/a", 1);
        store.put(entry.clone()).await.unwrap();

        store.delete(entry.id).await.unwrap();
        store.delete(entry.id).await.unwrap();
        drop(store);

        let reopened = open_store(temp_dir.path(), &clock).await;
        assert!(reopened.lookup(entry.id).await.is_none());
    }

    #[tokio::test]
    async fn test_usage_by_volume_sums_live_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let store = open_store(temp_dir.path(), &clock).await;

        for size in [10, 20] {
            store.put(create_test_entry(&clock, "/srv/a", size)).await.unwrap();
        }
        store.put(create_test_entry(&clock, "/srv/b", 7)).await.unwrap();

        let usage = store.usage_by_volume().await;
        assert_eq!(
            usage[&VolumeId::new("/srv/a")],
            VolumeEntryUsage {
                file_count: 2,
                bytes: 30
            }
        );
        assert_eq!(usage[&VolumeId::new("/srv/b")].file_count, 1);
    }

    #[tokio::test]
    async fn test_open_skips_corrupt_and_temporary_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let entry = create_test_entry(&clock, "/srv/a", 3);
        {
            let store = open_store(temp_dir.path(), &clock).await;
            store.put(entry.clone()).await.unwrap();
        }

        let corrupt = temp_dir.path().join(format!("{}.json", FileId::generate()));
        std::fs::write(&corrupt, b"{not json").unwrap();
        let leftover = temp_dir.path().join(format!("{}.json.tmp", FileId::generate()));
        std::fs::write(&leftover, b"{}").unwrap();

        let store = open_store(temp_dir.path(), &clock).await;
        assert_eq!(store.list_records().await, vec![entry]);
        assert!(!leftover.exists());
    }
}
