//! Centralized configuration for Tidepool.
//!
//! All tunable parameters are defined here with their defaults, and can be
//! overridden through `TIDEPOOL_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::TidepoolError;
use crate::storage::VolumeConfig;

/// Default maximum upload size: 5 GiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Default retention window: 24 hours.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Central configuration for all Tidepool components.
#[derive(Debug, Clone, Default)]
pub struct TidepoolConfig {
    pub storage: StorageConfig,
    pub sweeper: SweeperConfig,
}

/// Volume, metadata and upload limit configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Volume roots in placement tie-break order
    pub volumes: Vec<VolumeConfig>,
    /// Directory holding one metadata record per file
    pub metadata_dir: PathBuf,
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Retention window applied when an upload does not request one
    pub retention: Duration,
    /// Deadline applied to uploads that do not bring their own
    pub upload_timeout: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volumes: ["data/storage", "data/storage2", "data/storage3"]
                .into_iter()
                .map(VolumeConfig::new)
                .collect(),
            metadata_dir: PathBuf::from("data/metadata"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            retention: DEFAULT_RETENTION,
            upload_timeout: None,
        }
    }
}

/// Background sweeper scheduling.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between expiry sweeps
    pub sweep_interval: Duration,
    /// Minimum time between reconciliation passes
    pub reconcile_interval: Duration,
    /// Age below which unreferenced and temporary files are left alone
    pub orphan_grace: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),     // 5 minutes
            reconcile_interval: Duration::from_secs(3600), // 1 hour
            orphan_grace: Duration::from_secs(600),       // 10 minutes
        }
    }
}

impl TidepoolConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Values that fail to parse are logged and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(paths) = std::env::var_os("TIDEPOOL_VOLUMES") {
            let volumes: Vec<VolumeConfig> = std::env::split_paths(&paths)
                .filter(|path| !path.as_os_str().is_empty())
                .filter_map(|path| path.to_str().and_then(|spec| spec.parse().ok()))
                .collect();
            if volumes.is_empty() {
                tracing::warn!("TIDEPOOL_VOLUMES is set but lists no usable paths");
            } else {
                config.storage.volumes = volumes;
            }
        }

        if let Ok(dir) = std::env::var("TIDEPOOL_METADATA_DIR") {
            config.storage.metadata_dir = PathBuf::from(dir);
        }

        if let Some(bytes) = parse_env::<u64>("TIDEPOOL_MAX_UPLOAD_BYTES") {
            config.storage.max_upload_bytes = bytes;
        }
        if let Some(seconds) = parse_env::<u64>("TIDEPOOL_RETENTION_SECS") {
            config.storage.retention = Duration::from_secs(seconds);
        }
        if let Some(seconds) = parse_env::<u64>("TIDEPOOL_UPLOAD_TIMEOUT_SECS") {
            config.storage.upload_timeout = Some(Duration::from_secs(seconds));
        }

        if let Some(seconds) = parse_env::<u64>("TIDEPOOL_SWEEP_INTERVAL_SECS") {
            config.sweeper.sweep_interval = Duration::from_secs(seconds);
        }
        if let Some(seconds) = parse_env::<u64>("TIDEPOOL_RECONCILE_INTERVAL_SECS") {
            config.sweeper.reconcile_interval = Duration::from_secs(seconds);
        }
        if let Some(seconds) = parse_env::<u64>("TIDEPOOL_ORPHAN_GRACE_SECS") {
            config.sweeper.orphan_grace = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration rooted in `root` with small limits, for tests.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            storage: StorageConfig {
                volumes: vec![
                    VolumeConfig::new(root.join("volume0")),
                    VolumeConfig::new(root.join("volume1")),
                ],
                metadata_dir: root.join("metadata"),
                max_upload_bytes: 1024 * 1024,
                retention: Duration::from_secs(60),
                upload_timeout: Some(Duration::from_secs(10)),
            },
            sweeper: SweeperConfig {
                sweep_interval: Duration::from_millis(50),
                reconcile_interval: Duration::from_millis(50),
                orphan_grace: Duration::ZERO,
            },
        }
    }

    /// Checks settings that would make the service unusable.
    ///
    /// # Errors
    ///
    /// - `TidepoolError::Configuration` - If no volume is configured, the upload
    ///   limit is zero, or the sweep interval is zero
    pub fn validate(&self) -> Result<(), TidepoolError> {
        if self.storage.volumes.is_empty() {
            return Err(TidepoolError::Configuration {
                reason: "at least one volume must be configured".to_string(),
            });
        }
        if self.storage.max_upload_bytes == 0 {
            return Err(TidepoolError::Configuration {
                reason: "maximum upload size must be positive".to_string(),
            });
        }
        if self.sweeper.sweep_interval.is_zero() {
            return Err(TidepoolError::Configuration {
                reason: "sweep interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", name, value);
            None
        }
    }
}
