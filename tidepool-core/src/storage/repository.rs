//! File repository: atomic write, read and delete of file bytes.
//!
//! Uploads stream into a temporary file on the chosen volume and are renamed
//! into place only once complete, so readers never observe partial files.
//! Opening for read and unlinking are serialized per identifier.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;

use super::{FileId, StorageError, Volume};

/// Chunk size used when streaming stored files back out.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads, writes and deletes file bytes on volumes.
#[derive(Debug, Default)]
pub struct FileRepository {
    locks: IdLocks,
}

impl FileRepository {
    /// Creates a repository with an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams `body` into the volume and commits it under `id`.
    ///
    /// The size cap is checked as bytes arrive. The temporary file is removed
    /// on every failure path, including when this future is dropped before
    /// completion.
    ///
    /// # Errors
    ///
    /// - `StorageError::PayloadTooLarge` - If more than `max_size` bytes arrive
    /// - `StorageError::Conflict` - If a file with this id is already stored
    /// - `StorageError::WriteFailed` - If the stream fails or any write fails
    pub async fn write<S>(
        &self,
        id: FileId,
        volume: &Volume,
        body: S,
        max_size: u64,
    ) -> Result<u64, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.write_within(id, volume, body, max_size, u64::MAX).await
    }

    /// Like [`write`](Self::write), but also aborts once the body outgrows
    /// `room`, the free space the volume had when it was chosen.
    ///
    /// # Errors
    ///
    /// - `StorageError::PayloadTooLarge` - If more than `max_size` bytes arrive
    /// - `StorageError::InsufficientStorage` - If more than `room` bytes arrive
    /// - `StorageError::Conflict` - If a file with this id is already stored
    /// - `StorageError::WriteFailed` - If the stream fails or any write fails
    pub async fn write_within<S>(
        &self,
        id: FileId,
        volume: &Volume,
        body: S,
        max_size: u64,
        room: u64,
    ) -> Result<u64, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let temp = TempFile::new(volume.temp_path(id));
        let mut file = fs::File::create(temp.path())
            .await
            .map_err(|e| StorageError::write_failed(temp.path(), e))?;

        let mut body = std::pin::pin!(body);
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                StorageError::write_failed(temp.path(), format!("upload stream interrupted: {e}"))
            })?;

            written += chunk.len() as u64;
            if written > max_size {
                tracing::debug!("Upload {} exceeded {} bytes, aborting", id, max_size);
                return Err(StorageError::PayloadTooLarge { limit: max_size });
            }
            if written > room {
                tracing::debug!("Upload {} outgrew volume {} ({} bytes free)", id, volume.id(), room);
                return Err(StorageError::InsufficientStorage {
                    needed: written,
                    available: room,
                });
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::write_failed(temp.path(), e))?;
        }

        file.flush()
            .await
            .map_err(|e| StorageError::write_failed(temp.path(), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::write_failed(temp.path(), e))?;
        drop(file);

        volume.commit(temp.path(), id, written).await?;
        temp.disarm();

        tracing::debug!("Stored {} ({} bytes) on volume {}", id, written, volume.id());
        Ok(written)
    }

    /// Opens a stored file for streaming.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If no file is stored under `id`
    /// - `StorageError::ReadFailed` - If the file exists but cannot be opened
    pub async fn read(&self, id: FileId, volume: &Volume) -> Result<StoredFile, StorageError> {
        let path = volume.file_path(id);
        let _lock = self.locks.lock(id).await;

        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound { id });
            }
            Err(e) => return Err(StorageError::read_failed(&path, e)),
        };
        let size_bytes = file
            .metadata()
            .await
            .map_err(|e| StorageError::read_failed(&path, e))?
            .len();

        Ok(StoredFile { file, size_bytes })
    }

    /// Removes a stored file. Removing an absent file succeeds.
    ///
    /// # Errors
    ///
    /// - `StorageError::WriteFailed` - If the file exists but cannot be removed
    pub async fn delete(&self, id: FileId, volume: &Volume) -> Result<(), StorageError> {
        let path = volume.file_path(id);
        let _lock = self.locks.lock(id).await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted {} from volume {}", id, volume.id());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::write_failed(&path, e)),
        }
    }

    /// Checks whether bytes for `id` are stored on `volume`.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReadFailed` - If existence cannot be determined
    pub async fn exists(&self, id: FileId, volume: &Volume) -> Result<bool, StorageError> {
        let path = volume.file_path(id);
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::read_failed(&path, e))
    }

    /// Removes an arbitrary file found during reconciliation.
    pub(crate) async fn remove_path(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::write_failed(path, e)),
        }
    }
}

/// Open handle to a stored file.
///
/// The handle stays readable even if the file is unlinked afterwards.
#[derive(Debug)]
pub struct StoredFile {
    file: fs::File,
    size_bytes: u64,
}

impl StoredFile {
    /// Length of the file when it was opened.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Streams exactly `size_bytes` bytes.
    ///
    /// A file that ends early yields an `UnexpectedEof` error instead of a
    /// short body.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(
            Some((self.file, self.size_bytes)),
            |state| async move {
                let (mut file, remaining) = state?;
                if remaining == 0 {
                    return None;
                }

                let chunk_size = remaining.min(READ_CHUNK_SIZE as u64) as usize;
                let mut buffer = vec![0u8; chunk_size];
                match file.read(&mut buffer).await {
                    Ok(0) => Some((
                        Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("stored file ended with {remaining} bytes missing"),
                        )),
                        None,
                    )),
                    Ok(read) => {
                        buffer.truncate(read);
                        Some((Ok(Bytes::from(buffer)), Some((file, remaining - read as u64))))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            },
        )
    }
}

/// Removes its path on drop unless disarmed.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                "Failed to remove temporary file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Per-identifier async locks, created on demand and dropped when idle.
#[derive(Debug, Default)]
struct IdLocks {
    locks: Arc<Mutex<HashMap<FileId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdLocks {
    async fn lock(&self, id: FileId) -> IdLockGuard {
        let lock = self.locks.lock().entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        IdLockGuard {
            id,
            locks: Arc::clone(&self.locks),
            _guard: guard,
        }
    }
}

struct IdLockGuard {
    id: FileId,
    locks: Arc<Mutex<HashMap<FileId, Arc<tokio::sync::Mutex<()>>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for IdLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The table and this guard hold one reference each when nobody waits.
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.id);
        }
    }
}
