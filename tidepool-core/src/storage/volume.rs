//! Volume set: the fixed list of storage roots and their usage probes.
//!
//! Each volume root holds two directories: `files/` with committed files
//! named by id, and `tmp/` with uploads still in flight. Usage is always
//! recomputed by scanning both; nothing is cached between probes.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use tokio::fs;
use tokio::sync::Mutex;

use super::{FileId, StorageError, VolumeId, sync_dir};

const FILES_DIR: &str = "files";
const TEMP_DIR: &str = "tmp";
const TEMP_SUFFIX: &str = ".tmp";
const PROBE_FILE: &str = ".tidepool-probe";

/// Configuration of a single volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Root directory of the volume
    pub root: PathBuf,
    /// Quota in bytes; probed from the backing disk when absent
    pub capacity_bytes: Option<u64>,
}

impl VolumeConfig {
    /// Creates a volume configuration with a probed capacity.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity_bytes: None,
        }
    }

    /// Sets a fixed quota for the volume.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }
}

impl FromStr for VolumeConfig {
    type Err = std::convert::Infallible;

    /// Parses `<root>` or `<root>=<capacity bytes>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((root, capacity)) = s.rsplit_once('=')
            && let Ok(bytes) = capacity.trim().parse::<u64>()
        {
            return Ok(Self::new(root).with_capacity(bytes));
        }
        Ok(Self::new(s))
    }
}

/// Total size of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Known size in bytes, configured or probed from the disk
    Bounded(u64),
    /// Root is on no disk the probe knows about
    Unbounded,
}

impl Capacity {
    /// Returns the byte count, `None` when unbounded.
    pub fn as_bytes(self) -> Option<u64> {
        match self {
            Capacity::Bounded(bytes) => Some(bytes),
            Capacity::Unbounded => None,
        }
    }
}

/// Point-in-time usage snapshot of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    /// Bytes of committed files plus uploads in flight
    pub used_bytes: u64,
    pub capacity: Capacity,
    /// Bytes a new file may still occupy
    pub free_bytes: u64,
}

/// A file found while scanning a volume directory.
#[derive(Debug, Clone)]
pub struct VolumeFile {
    pub path: PathBuf,
    /// Parsed from the file name; `None` for names that are not ids
    pub id: Option<FileId>,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl VolumeFile {
    /// Time since the file was last modified, zero for future mtimes.
    pub fn age(&self) -> std::time::Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or_default()
    }
}

/// One independent storage root.
#[derive(Debug)]
pub struct Volume {
    id: VolumeId,
    root: PathBuf,
    capacity_bytes: Option<u64>,
    // Held across the quota check and the final rename, quota volumes only.
    commit_lock: Option<Mutex<()>>,
}

impl Volume {
    fn new(config: &VolumeConfig) -> Self {
        Self {
            id: VolumeId::new(config.root.to_string_lossy()),
            root: config.root.clone(),
            capacity_bytes: config.capacity_bytes,
            commit_lock: config.capacity_bytes.map(|_| Mutex::new(())),
        }
    }

    /// Returns the volume identifier.
    pub fn id(&self) -> &VolumeId {
        &self.id
    }

    /// Returns the configured root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the configured quota, if any.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.capacity_bytes
    }

    /// Final location of the file with the given id.
    pub fn file_path(&self, id: FileId) -> PathBuf {
        self.root.join(FILES_DIR).join(id.to_string())
    }

    /// Fresh temporary path for an upload of the given id.
    pub fn temp_path(&self, id: FileId) -> PathBuf {
        let nonce: u32 = rand::random();
        self.root
            .join(TEMP_DIR)
            .join(format!("{id}-{nonce:08x}{TEMP_SUFFIX}"))
    }

    async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join(FILES_DIR)).await?;
        fs::create_dir_all(self.root.join(TEMP_DIR)).await?;

        let probe = self.root.join(TEMP_DIR).join(PROBE_FILE);
        fs::write(&probe, b"probe").await?;
        fs::remove_file(&probe).await
    }

    /// Probes current usage and free space.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReadFailed` - If the volume directories cannot be scanned
    pub async fn usage(&self) -> Result<VolumeUsage, StorageError> {
        let stored = self.committed_bytes().await?;
        let in_flight: u64 = self
            .list_temp_files()
            .await?
            .iter()
            .map(|file| file.size_bytes)
            .sum();
        let used_bytes = stored + in_flight;
        let disk = probe_disk(self.root.clone()).await;

        let (capacity, free_bytes) = match (self.capacity_bytes, disk) {
            (Some(quota), Some(disk)) => (
                Capacity::Bounded(quota),
                quota.saturating_sub(used_bytes).min(disk.available),
            ),
            (Some(quota), None) => (Capacity::Bounded(quota), quota.saturating_sub(used_bytes)),
            (None, Some(disk)) => (Capacity::Bounded(disk.total), disk.available),
            (None, None) => (Capacity::Unbounded, u64::MAX),
        };

        Ok(VolumeUsage {
            used_bytes,
            capacity,
            free_bytes,
        })
    }

    /// Sum of committed file sizes, excluding uploads in flight.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReadFailed` - If the files directory cannot be scanned
    pub async fn committed_bytes(&self) -> Result<u64, StorageError> {
        Ok(self
            .list_stored_files()
            .await?
            .iter()
            .map(|file| file.size_bytes)
            .sum())
    }

    /// Lists committed files.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReadFailed` - If the files directory cannot be scanned
    pub async fn list_stored_files(&self) -> Result<Vec<VolumeFile>, StorageError> {
        let dir = self.root.join(FILES_DIR);
        scan_dir(&dir, |name| name.parse().ok())
            .await
            .map_err(|e| StorageError::read_failed(dir, e))
    }

    /// Lists temporary upload files.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReadFailed` - If the temp directory cannot be scanned
    pub async fn list_temp_files(&self) -> Result<Vec<VolumeFile>, StorageError> {
        let dir = self.root.join(TEMP_DIR);
        scan_dir(&dir, |name| {
            name.strip_suffix(TEMP_SUFFIX)
                .and_then(|stem| stem.split_once('-'))
                .and_then(|(id, _)| id.parse().ok())
        })
        .await
        .map_err(|e| StorageError::read_failed(dir, e))
    }

    /// Moves a fully written temp file to its final location.
    ///
    /// On quota volumes the committed bytes plus `size_bytes` must fit the
    /// quota; the check and rename run under the volume's commit lock so
    /// concurrent commits cannot overshoot it.
    ///
    /// # Errors
    ///
    /// - `StorageError::Conflict` - If a file with this id is already stored
    /// - `StorageError::WriteFailed` - If the quota is exhausted or the rename fails
    pub(crate) async fn commit(
        &self,
        temp_path: &Path,
        id: FileId,
        size_bytes: u64,
    ) -> Result<PathBuf, StorageError> {
        let final_path = self.file_path(id);
        let _guard = match &self.commit_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if fs::try_exists(&final_path)
            .await
            .map_err(|e| StorageError::write_failed(&final_path, e))?
        {
            return Err(StorageError::Conflict { id });
        }

        if let Some(quota) = self.capacity_bytes {
            let committed = self
                .committed_bytes()
                .await
                .map_err(|e| StorageError::write_failed(&final_path, e))?;
            if committed.saturating_add(size_bytes) > quota {
                return Err(StorageError::write_failed(
                    &final_path,
                    format!("volume quota exhausted ({committed} of {quota} bytes committed)"),
                ));
            }
        }

        fs::rename(temp_path, &final_path)
            .await
            .map_err(|e| StorageError::write_failed(&final_path, e))?;
        sync_dir(&self.root.join(FILES_DIR))
            .await
            .map_err(|e| StorageError::write_failed(&final_path, e))?;
        Ok(final_path)
    }
}

/// Fixed-at-startup list of volumes, in configuration order.
#[derive(Debug)]
pub struct VolumeSet {
    volumes: Vec<Volume>,
}

impl VolumeSet {
    /// Opens every configured volume, creating its directories and proving
    /// the root writable.
    ///
    /// # Errors
    ///
    /// - `StorageError::VolumeUnavailable` - If the list is empty, a root is
    ///   configured twice, or a root cannot be written
    pub async fn open(configs: &[VolumeConfig]) -> Result<Self, StorageError> {
        if configs.is_empty() {
            return Err(StorageError::VolumeUnavailable {
                path: PathBuf::new(),
                reason: "no volumes configured".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut volumes = Vec::with_capacity(configs.len());
        for config in configs {
            let unavailable = |reason: String| StorageError::VolumeUnavailable {
                path: config.root.clone(),
                reason,
            };

            let volume = Volume::new(config);
            volume
                .prepare()
                .await
                .map_err(|e| unavailable(e.to_string()))?;

            // Symlinks and relative spellings must not open one directory twice.
            let canonical = fs::canonicalize(&config.root)
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            if !seen.insert(canonical.clone()) {
                return Err(unavailable(format!(
                    "same directory as an earlier volume ({})",
                    canonical.display()
                )));
            }

            tracing::info!(
                "Opened volume {} (capacity: {})",
                volume.id(),
                config
                    .capacity_bytes
                    .map_or_else(|| "probed".to_string(), |bytes| format!("{bytes} bytes"))
            );
            volumes.push(volume);
        }

        Ok(Self { volumes })
    }

    /// Iterates volumes in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }

    /// Looks up a volume by id.
    pub fn get(&self, id: &VolumeId) -> Option<&Volume> {
        self.volumes.iter().find(|volume| volume.id() == id)
    }

    /// Returns the volume at a configuration index.
    pub fn by_index(&self, index: usize) -> Option<&Volume> {
        self.volumes.get(index)
    }

    /// Number of configured volumes.
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Always false for an opened set.
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct DiskSpace {
    total: u64,
    available: u64,
}

/// Finds the disk whose mount point is the longest prefix of `root`.
async fn probe_disk(root: PathBuf) -> Option<DiskSpace> {
    tokio::task::spawn_blocking(move || {
        let root = std::fs::canonicalize(&root).ok()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| DiskSpace {
                total: disk.total_space(),
                available: disk.available_space(),
            })
    })
    .await
    .ok()
    .flatten()
}

async fn scan_dir(
    dir: &Path,
    parse_id: impl Fn(&str) -> Option<FileId>,
) -> io::Result<Vec<VolumeFile>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        // Entries can vanish between listing and stat when a delete races us.
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            continue;
        }

        let id = entry.file_name().to_str().and_then(&parse_id);
        files.push(VolumeFile {
            path: entry.path(),
            id,
            size_bytes: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_fixtures::create_temp_volumes;

    #[tokio::test]
    async fn test_open_creates_volume_layout() {
        let (_temp_dir, configs) = create_temp_volumes(&[Some(100), None]);
        let volumes = VolumeSet::open(&configs).await.unwrap();

        assert_eq!(volumes.len(), 2);
        for volume in volumes.iter() {
            assert!(volume.root().join(FILES_DIR).is_dir());
            assert!(volume.root().join(TEMP_DIR).is_dir());
            assert!(!volume.root().join(TEMP_DIR).join(PROBE_FILE).exists());
        }
    }

    #[tokio::test]
    async fn test_open_rejects_empty_configuration() {
        let result = VolumeSet::open(&[]).await;
        assert!(matches!(
            result,
            Err(StorageError::VolumeUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_roots() {
        let (_temp_dir, configs) = create_temp_volumes(&[None]);
        let doubled = vec![configs[0].clone(), configs[0].clone()];

        let result = VolumeSet::open(&doubled).await;
        assert!(matches!(
            result,
            Err(StorageError::VolumeUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_aliased_roots() {
        let (_temp_dir, configs) = create_temp_volumes(&[None]);
        let root = &configs[0].root;

        let dotted = root.join("files").join("..");
        let result = VolumeSet::open(&[configs[0].clone(), VolumeConfig::new(&dotted)]).await;
        match result {
            Err(StorageError::VolumeUnavailable { path, .. }) => assert_eq!(path, dotted),
            other => panic!("Expected VolumeUnavailable, got {other:?}"),
        }

        #[cfg(unix)]
        {
            let link = root.with_extension("link");
            std::os::unix::fs::symlink(root, &link).unwrap();
            let result = VolumeSet::open(&[configs[0].clone(), VolumeConfig::new(&link)]).await;
            match result {
                Err(StorageError::VolumeUnavailable { path, .. }) => assert_eq!(path, link),
                other => panic!("Expected VolumeUnavailable, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_open_fails_when_root_is_a_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let not_a_dir = temp_dir.path().join("plain-file");
        std::fs::write(&not_a_dir, b"occupied").unwrap();

        let result = VolumeSet::open(&[VolumeConfig::new(&not_a_dir)]).await;
        match result {
            Err(StorageError::VolumeUnavailable { path, .. }) => assert_eq!(path, not_a_dir),
            other => panic!("Expected VolumeUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_usage_counts_stored_and_in_flight_bytes() {
        let (_temp_dir, configs) = create_temp_volumes(&[Some(1000)]);
        let volumes = VolumeSet::open(&configs).await.unwrap();
        let volume = volumes.by_index(0).unwrap();

        std::fs::write(volume.file_path(FileId::generate()), vec![0u8; 300]).unwrap();
        std::fs::write(volume.temp_path(FileId::generate()), vec![0u8; 200]).unwrap();

        let usage = volume.usage().await.unwrap();
        assert_eq!(usage.used_bytes, 500);
        assert_eq!(usage.capacity, Capacity::Bounded(1000));
        assert_eq!(usage.free_bytes, 500);
        assert_eq!(volume.committed_bytes().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_scan_reports_foreign_names_without_id() {
        let (_temp_dir, configs) = create_temp_volumes(&[None]);
        let volumes = VolumeSet::open(&configs).await.unwrap();
        let volume = volumes.by_index(0).unwrap();

        let id = FileId::generate();
        std::fs::write(volume.file_path(id), b"data").unwrap();
        std::fs::write(volume.root().join(FILES_DIR).join("README"), b"x").unwrap();

        let mut ids: Vec<Option<FileId>> = volume
            .list_stored_files()
            .await
            .unwrap()
            .into_iter()
            .map(|file| file.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![None, Some(id)]);
    }

    #[tokio::test]
    async fn test_commit_enforces_quota() {
        let (_temp_dir, configs) = create_temp_volumes(&[Some(10)]);
        let volumes = VolumeSet::open(&configs).await.unwrap();
        let volume = volumes.by_index(0).unwrap();

        let first = FileId::generate();
        let temp = volume.temp_path(first);
        std::fs::write(&temp, vec![1u8; 6]).unwrap();
        volume.commit(&temp, first, 6).await.unwrap();

        let second = FileId::generate();
        let temp = volume.temp_path(second);
        std::fs::write(&temp, vec![2u8; 6]).unwrap();
        let result = volume.commit(&temp, second, 6).await;

        assert!(matches!(result, Err(StorageError::WriteFailed { .. })));
        assert!(!volume.file_path(second).exists());
    }

    #[tokio::test]
    async fn test_commit_refuses_to_overwrite() {
        let (_temp_dir, configs) = create_temp_volumes(&[None]);
        let volumes = VolumeSet::open(&configs).await.unwrap();
        let volume = volumes.by_index(0).unwrap();

        let id = FileId::generate();
        std::fs::write(volume.file_path(id), b"original").unwrap();
        let temp = volume.temp_path(id);
        std::fs::write(&temp, b"impostor").unwrap();

        let result = volume.commit(&temp, id, 8).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert_eq!(std::fs::read(volume.file_path(id)).unwrap(), b"original");
    }

    #[test]
    fn test_volume_config_parsing() {
        let plain: VolumeConfig = "/srv/a".parse().unwrap();
        assert_eq!(plain, VolumeConfig::new("/srv/a"));

        let quota: VolumeConfig = "/srv/b=1048576".parse().unwrap();
        assert_eq!(quota, VolumeConfig::new("/srv/b").with_capacity(1_048_576));

        let odd: VolumeConfig = "/srv/c=big".parse().unwrap();
        assert_eq!(odd, VolumeConfig::new("/srv/c=big"));
    }
}
