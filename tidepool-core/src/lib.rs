//! Tidepool Core - expiring multi-volume file storage
//!
//! This crate provides the storage subsystem behind Tidepool: placement of
//! uploads across independent volumes, atomic file writes, durable per-file
//! metadata, the expiration sweeper, and usage statistics.

pub mod clock;
pub mod config;
pub mod service;
pub mod stats;
pub mod storage;
pub mod sweeper;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StorageConfig, SweeperConfig, TidepoolConfig};
pub use service::{Download, FileService, UploadRequest};
pub use stats::{StatsReport, StatsReporter, VolumeStats};
pub use storage::{FileEntry, FileId, StorageError, VolumeId};
pub use sweeper::{ReconcileReport, SweepReport, Sweeper, SweeperHandle, spawn_sweeper};

/// Core errors that can bubble up from any Tidepool subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TidepoolError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidepoolError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidepoolError::Storage(e) => match e {
                StorageError::NotFound { .. } => "File not found or expired".to_string(),
                StorageError::PayloadTooLarge { limit } => {
                    format!("File too large. Maximum size is {limit} bytes")
                }
                StorageError::InsufficientStorage { .. } => {
                    "Insufficient storage space available".to_string()
                }
                StorageError::VolumeUnavailable { path, reason } => {
                    format!("Storage volume {} is unusable: {reason}", path.display())
                }
                StorageError::WriteFailed { .. } => {
                    "Storing the file failed, please retry".to_string()
                }
                _ => "Storage error occurred".to_string(),
            },
            TidepoolError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            TidepoolError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TidepoolError::Configuration { .. }
                | TidepoolError::Storage(
                    StorageError::NotFound { .. } | StorageError::PayloadTooLarge { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, TidepoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let too_large = TidepoolError::from(StorageError::PayloadTooLarge { limit: 10 });
        assert!(too_large.is_user_error());
        assert_eq!(
            too_large.user_message(),
            "File too large. Maximum size is 10 bytes"
        );

        let full = TidepoolError::from(StorageError::InsufficientStorage {
            needed: 5,
            available: 1,
        });
        assert!(!full.is_user_error());
    }
}
