//! Shared setup for integration tests

use std::sync::Arc;

use rand::Rng;
use tempfile::TempDir;
use tidepool_core::storage::test_fixtures::create_temp_volumes;
use tidepool_core::{FileService, ManualClock, TidepoolConfig};

/// A file service over temporary volumes with a manual clock.
pub struct TestStore {
    pub _temp_dir: TempDir,
    pub clock: ManualClock,
    pub config: TidepoolConfig,
    pub service: Arc<FileService>,
}

impl TestStore {
    /// Opens one volume per entry of `capacities`; `None` leaves the
    /// capacity probed from the disk.
    pub async fn open(capacities: &[Option<u64>]) -> Self {
        let (temp_dir, volumes) = create_temp_volumes(capacities);
        let mut config = TidepoolConfig::for_testing(temp_dir.path());
        config.storage.volumes = volumes;

        let clock = ManualClock::starting_now();
        let service = FileService::open(&config.storage, Arc::new(clock.clone()))
            .await
            .unwrap();

        Self {
            _temp_dir: temp_dir,
            clock,
            config,
            service: Arc::new(service),
        }
    }

    /// Opens a second service over the same directories, as after a restart.
    pub async fn reopen(&self) -> FileService {
        FileService::open(&self.config.storage, Arc::new(self.clock.clone()))
            .await
            .unwrap()
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    data
}
