//! Usage statistics across volumes.

use std::sync::Arc;

use serde::Serialize;

use crate::storage::{MetadataStore, VolumeSet};

/// Usage and entry totals for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub volume: String,
    pub used_bytes: Option<u64>,
    /// `None` when the volume is unbounded or could not be probed
    pub capacity_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
    /// Live entries recorded on this volume
    pub file_count: u64,
    /// Sum of live entry sizes on this volume
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub volumes: Vec<VolumeStats>,
    pub total_files: u64,
    pub total_bytes: u64,
}

/// Builds stats reports on demand. Nothing is cached.
#[derive(Clone)]
pub struct StatsReporter {
    volumes: Arc<VolumeSet>,
    metadata: Arc<dyn MetadataStore>,
}

impl StatsReporter {
    pub fn new(volumes: Arc<VolumeSet>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { volumes, metadata }
    }

    /// Probes every volume and aggregates live entries.
    ///
    /// A failing probe is reported on its volume instead of failing the
    /// whole report.
    pub async fn report(&self) -> StatsReport {
        let entry_usage = self.metadata.usage_by_volume().await;
        let mut volumes = Vec::with_capacity(self.volumes.len());

        for volume in self.volumes.iter() {
            let entries = entry_usage.get(volume.id()).copied().unwrap_or_default();
            let mut stats = VolumeStats {
                volume: volume.id().to_string(),
                used_bytes: None,
                capacity_bytes: None,
                free_bytes: None,
                file_count: entries.file_count,
                bytes: entries.bytes,
                error: None,
            };

            match volume.usage().await {
                Ok(usage) => {
                    stats.used_bytes = Some(usage.used_bytes);
                    stats.capacity_bytes = usage.capacity.as_bytes();
                    stats.free_bytes = usage.capacity.as_bytes().map(|_| usage.free_bytes);
                }
                Err(e) => {
                    tracing::warn!("Failed to probe volume {}: {}", volume.id(), e);
                    stats.error = Some(e.to_string());
                }
            }
            volumes.push(stats);
        }

        StatsReport {
            total_files: volumes.iter().map(|stats| stats.file_count).sum(),
            total_bytes: volumes.iter().map(|stats| stats.bytes).sum(),
            volumes,
        }
    }
}
