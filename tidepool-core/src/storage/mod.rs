//! Storage layer for uploaded files.
//!
//! Spreads file bytes across independent volumes, records per-file metadata
//! durably, and exposes the primitives the service and sweeper build on.

pub mod metadata;
pub mod placement;
pub mod repository;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;
pub mod types;
pub mod volume;

use std::io;
use std::path::{Path, PathBuf};

pub use metadata::{JsonMetadataStore, MetadataStore, VolumeEntryUsage};
pub use placement::{GreedyFreeSpace, Placed, Placement, PlacementCandidate};
pub use repository::{FileRepository, StoredFile};
pub use types::{FileEntry, FileId, VolumeId};
pub use volume::{Capacity, Volume, VolumeConfig, VolumeSet, VolumeUsage};

/// Errors that occur during storage operations.
///
/// Per-request failures (`NotFound`, `PayloadTooLarge`,
/// `InsufficientStorage`) are recoverable at the request boundary.
/// `VolumeUnavailable` only occurs while opening the volume set and is fatal.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Identifier is unknown or its entry has expired
    #[error("File {id} not found")]
    NotFound {
        /// Identifier that was looked up
        id: FileId,
    },

    /// Upload exceeded the configured maximum size
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge {
        /// Maximum accepted upload size in bytes
        limit: u64,
    },

    /// No volume has room for the requested size
    #[error("Insufficient storage: need {needed} bytes, largest free space is {available}")]
    InsufficientStorage {
        /// Number of bytes requested
        needed: u64,
        /// Largest free space found across all volumes
        available: u64,
    },

    /// Identifier already exists
    #[error("File {id} already exists")]
    Conflict {
        /// Colliding identifier
        id: FileId,
    },

    /// Writing to a volume or the metadata directory failed
    #[error("Write failed at {path}: {reason}")]
    WriteFailed {
        /// Path that was being written
        path: PathBuf,
        /// Description of the failure
        reason: String,
    },

    /// Reading from a volume failed for a reason other than absence
    #[error("Read failed at {path}: {reason}")]
    ReadFailed {
        /// Path that was being read
        path: PathBuf,
        /// Description of the failure
        reason: String,
    },

    /// Configured volume root cannot be used
    #[error("Volume {path} unavailable: {reason}")]
    VolumeUnavailable {
        /// Configured root path
        path: PathBuf,
        /// Description of the failure
        reason: String,
    },
}

impl StorageError {
    /// Returns true when the caller may retry the same request later.
    ///
    /// Write failures usually come from transient exhaustion of the chosen
    /// volume, which a later placement may avoid.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::WriteFailed { .. })
    }

    pub(crate) fn write_failed(path: impl Into<PathBuf>, error: impl std::fmt::Display) -> Self {
        StorageError::WriteFailed {
            path: path.into(),
            reason: error.to_string(),
        }
    }

    pub(crate) fn read_failed(path: impl Into<PathBuf>, error: impl std::fmt::Display) -> Self {
        StorageError::ReadFailed {
            path: path.into(),
            reason: error.to_string(),
        }
    }
}

/// Flushes a directory so renames into it survive power loss.
///
/// Directories cannot be opened as files on Windows; there the rename is
/// left to the filesystem.
pub(crate) async fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    tokio::fs::File::open(dir).await?.sync_all().await?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_write_failures_are_retryable() {
        let write = StorageError::write_failed("/tmp/x", "disk full");
        let read = StorageError::read_failed("/tmp/x", "bad sector");
        let too_large = StorageError::PayloadTooLarge { limit: 10 };

        assert!(write.is_retryable());
        assert!(!read.is_retryable());
        assert!(!too_large.is_retryable());
    }

    #[tokio::test]
    async fn test_sync_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("record"), b"x").unwrap();

        sync_dir(temp_dir.path()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir_reports_missing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(&temp_dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn test_error_messages_name_the_failure() {
        let error = StorageError::InsufficientStorage {
            needed: 8,
            available: 5,
        };
        assert_eq!(
            error.to_string(),
            "Insufficient storage: need 8 bytes, largest free space is 5"
        );
    }
}
