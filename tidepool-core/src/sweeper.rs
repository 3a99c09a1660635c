//! Expiration sweeper and reconciliation.
//!
//! Runs as an independent task on a fixed interval. Expired entries lose
//! their bytes first and their metadata second, so a crash mid-sweep leaves
//! an entry that is still discoverable as expired on the next run. The
//! reconciliation pass removes whatever partial failures left behind.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::storage::{FileId, FileRepository, MetadataStore, StorageError, VolumeSet};

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries whose bytes and metadata were removed
    pub removed: usize,
    /// Entries left in place after a failure, retried next run
    pub failed: usize,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stored files with no metadata record
    pub orphan_files_removed: usize,
    /// Temporary files abandoned by interrupted uploads
    pub stale_temp_files_removed: usize,
    /// Metadata records with no bytes or an unknown volume
    pub orphan_records_removed: usize,
    pub failed: usize,
}

/// Removes expired entries and reconciles volumes with metadata.
#[derive(Clone)]
pub struct Sweeper {
    volumes: Arc<VolumeSet>,
    repository: Arc<FileRepository>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    orphan_grace: Duration,
}

impl Sweeper {
    /// Creates a sweeper over the given storage components.
    pub fn new(
        volumes: Arc<VolumeSet>,
        repository: Arc<FileRepository>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            volumes,
            repository,
            metadata,
            clock,
            orphan_grace,
        }
    }

    /// Removes every entry expired at the current time.
    ///
    /// Failures are logged and counted; the affected entries stay recorded and
    /// are retried on the next sweep.
    pub async fn sweep_expired(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut expired = self.metadata.list_expired(self.clock.now());

        while let Some(entry) = expired.next().await {
            match self.remove_if_expired(entry.id).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to sweep {}: {}", entry.id, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Removes `id` if its entry is expired at this instant.
    ///
    /// Returns false when the entry is gone or not yet expired.
    ///
    /// # Errors
    ///
    /// - `StorageError::WriteFailed` - If the bytes or the record cannot be removed
    pub async fn remove_if_expired(&self, id: FileId) -> Result<bool, StorageError> {
        let Some(entry) = self.metadata.lookup(id).await else {
            return Ok(false);
        };
        if !entry.is_expired(self.clock.now()) {
            return Ok(false);
        }

        match self.volumes.get(&entry.volume) {
            Some(volume) => self.repository.delete(id, volume).await?,
            None => tracing::warn!(
                "Expired entry {} references unknown volume {}",
                id,
                entry.volume
            ),
        }
        self.metadata.delete(id).await?;

        tracing::debug!("Swept expired entry {}", id);
        Ok(true)
    }

    /// Brings volumes and metadata back in line with each other.
    ///
    /// Unreferenced stored files and temporary files are only removed once
    /// older than the orphan grace period, so uploads between their final
    /// rename and their metadata write are left alone.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for volume in self.volumes.iter() {
            match volume.list_stored_files().await {
                Ok(files) => {
                    for file in files {
                        let Some(id) = file.id else {
                            continue;
                        };
                        if file.age() < self.orphan_grace {
                            continue;
                        }
                        let referenced = self
                            .metadata
                            .lookup(id)
                            .await
                            .is_some_and(|entry| &entry.volume == volume.id());
                        if referenced {
                            continue;
                        }

                        match self.repository.delete(id, volume).await {
                            Ok(()) => {
                                tracing::info!("Removed orphan file {} from {}", id, volume.id());
                                report.orphan_files_removed += 1;
                            }
                            Err(e) => {
                                tracing::warn!("Failed to remove orphan file {}: {}", id, e);
                                report.failed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to scan volume {}: {}", volume.id(), e);
                    report.failed += 1;
                }
            }

            match volume.list_temp_files().await {
                Ok(files) => {
                    for file in files.into_iter().filter(|file| file.age() >= self.orphan_grace) {
                        match self.repository.remove_path(&file.path).await {
                            Ok(()) => report.stale_temp_files_removed += 1,
                            Err(e) => {
                                tracing::warn!("Failed to remove stale temp file: {}", e);
                                report.failed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to scan temp files of {}: {}", volume.id(), e);
                    report.failed += 1;
                }
            }
        }

        for entry in self.metadata.list_records().await {
            let bytes_missing = match self.volumes.get(&entry.volume) {
                None => true,
                Some(volume) => match self.repository.exists(entry.id, volume).await {
                    Ok(exists) => !exists,
                    Err(e) => {
                        tracing::warn!("Failed to check bytes of {}: {}", entry.id, e);
                        report.failed += 1;
                        continue;
                    }
                },
            };
            if !bytes_missing {
                continue;
            }

            match self.metadata.delete(entry.id).await {
                Ok(()) => {
                    tracing::info!(
                        "Removed orphan record {} (volume {})",
                        entry.id,
                        entry.volume
                    );
                    report.orphan_records_removed += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to remove orphan record {}: {}", entry.id, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper after its current run and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}

/// Spawns the sweeper loop and returns its handle.
///
/// The first run happens immediately and includes reconciliation; later runs
/// reconcile at most once per `reconcile_interval`.
pub fn spawn_sweeper(sweeper: Sweeper, config: SweeperConfig) -> SweeperHandle {
    let (shutdown, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        tracing::debug!("Sweeper started (interval {:?})", config.sweep_interval);
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_reconcile: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    let swept = sweeper.sweep_expired().await;
                    if swept.removed > 0 || swept.failed > 0 {
                        tracing::info!(
                            "Sweep removed {} expired entries ({} failed)",
                            swept.removed,
                            swept.failed
                        );
                    }

                    let reconcile_due = last_reconcile
                        .is_none_or(|at| at.elapsed() >= config.reconcile_interval);
                    if reconcile_due {
                        let reconciled = sweeper.reconcile().await;
                        tracing::info!("Reconciliation finished: {:?}", reconciled);
                        last_reconcile = Some(Instant::now());
                    }
                }
            }
        }

        tracing::debug!("Sweeper stopped");
    });

    SweeperHandle { shutdown, task }
}
