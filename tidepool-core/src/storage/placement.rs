//! Placement policy: which volume receives a new file.
//!
//! Usage is probed afresh on every call. Snapshots are advisory, so two
//! concurrent uploads may pick the same volume; quota enforcement at commit
//! and the disk itself settle the outcome.

use super::{StorageError, Volume, VolumeSet};

/// Usage snapshot of one volume as seen by a placement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementCandidate {
    /// Position of the volume in configuration order
    pub index: usize,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Selection heuristic over probed candidates.
pub trait Placement: Send + Sync {
    /// Returns the configuration index of the chosen volume, or `None` when
    /// no candidate can hold `candidate_size` bytes.
    fn select(&self, candidates: &[PlacementCandidate], candidate_size: u64) -> Option<usize>;
}

/// Most free space wins; ties go to the less used volume, then to
/// configuration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyFreeSpace;

impl Placement for GreedyFreeSpace {
    fn select(&self, candidates: &[PlacementCandidate], candidate_size: u64) -> Option<usize> {
        candidates
            .iter()
            .filter(|candidate| candidate.free_bytes >= candidate_size)
            .min_by(|a, b| {
                b.free_bytes
                    .cmp(&a.free_bytes)
                    .then(a.used_bytes.cmp(&b.used_bytes))
                    .then(a.index.cmp(&b.index))
            })
            .map(|candidate| candidate.index)
    }
}

/// Volume picked for an upload and its free space when it was picked.
#[derive(Debug, Clone, Copy)]
pub struct Placed<'a> {
    pub volume: &'a Volume,
    pub free_bytes: u64,
}

/// Probes every volume and picks one for a file of `candidate_size` bytes.
///
/// Volumes whose probe fails are skipped for this decision.
///
/// # Errors
///
/// - `StorageError::InsufficientStorage` - If no volume has enough free space
pub async fn choose_volume<'a>(
    volumes: &'a VolumeSet,
    placement: &dyn Placement,
    candidate_size: u64,
) -> Result<Placed<'a>, StorageError> {
    let mut candidates = Vec::with_capacity(volumes.len());
    for (index, volume) in volumes.iter().enumerate() {
        match volume.usage().await {
            Ok(usage) => candidates.push(PlacementCandidate {
                index,
                used_bytes: usage.used_bytes,
                free_bytes: usage.free_bytes,
            }),
            Err(e) => tracing::warn!("Skipping volume {} for placement: {}", volume.id(), e),
        }
    }

    let chosen = placement
        .select(&candidates, candidate_size)
        .and_then(|index| {
            let free_bytes = candidates
                .iter()
                .find(|candidate| candidate.index == index)?
                .free_bytes;
            Some(Placed {
                volume: volumes.by_index(index)?,
                free_bytes,
            })
        });

    match chosen {
        Some(placed) => {
            tracing::debug!(
                "Placed {} bytes on volume {} ({} free)",
                candidate_size,
                placed.volume.id(),
                placed.free_bytes
            );
            Ok(placed)
        }
        None => Err(StorageError::InsufficientStorage {
            needed: candidate_size,
            available: candidates
                .iter()
                .map(|candidate| candidate.free_bytes)
                .max()
                .unwrap_or(0),
        }),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::storage::FileId;
    use crate::storage::test_fixtures::create_temp_volumes;

    fn candidate(index: usize, used_bytes: u64, free_bytes: u64) -> PlacementCandidate {
        PlacementCandidate {
            index,
            used_bytes,
            free_bytes,
        }
    }

    #[test]
    fn test_prefers_most_free_space() {
        let candidates = [candidate(0, 0, 3), candidate(1, 0, 10), candidate(2, 0, 7)];
        assert_eq!(GreedyFreeSpace.select(&candidates, 1), Some(1));
    }

    #[test]
    fn test_ties_break_on_usage_then_order() {
        let by_usage = [candidate(0, 50, 10), candidate(1, 20, 10)];
        assert_eq!(GreedyFreeSpace.select(&by_usage, 1), Some(1));

        let by_order = [candidate(0, 20, 10), candidate(1, 20, 10)];
        assert_eq!(GreedyFreeSpace.select(&by_order, 1), Some(0));
    }

    #[test]
    fn test_exact_fit_is_accepted() {
        let candidates = [candidate(0, 0, 5)];
        assert_eq!(GreedyFreeSpace.select(&candidates, 5), Some(0));
        assert_eq!(GreedyFreeSpace.select(&candidates, 6), None);
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(GreedyFreeSpace.select(&[], 0), None);
    }

    proptest! {
        #[test]
        fn prop_equal_volumes_stay_balanced(volume_count in 1usize..6, uploads in 1usize..60) {
            let size = 10u64;
            let capacity = size * 100;
            let mut used = vec![0u64; volume_count];

            for _ in 0..uploads {
                let candidates: Vec<PlacementCandidate> = used
                    .iter()
                    .enumerate()
                    .map(|(index, used)| candidate(index, *used, capacity - used))
                    .collect();
                let chosen = GreedyFreeSpace.select(&candidates, size).unwrap();
                used[chosen] += size;
            }

            let max = used.iter().max().unwrap() / size;
            let min = used.iter().min().unwrap() / size;
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn prop_choice_always_fits(
            free in proptest::collection::vec(0u64..1000, 1..8),
            size in 0u64..1200,
        ) {
            let candidates: Vec<PlacementCandidate> = free
                .iter()
                .enumerate()
                .map(|(index, free)| candidate(index, 0, *free))
                .collect();

            match GreedyFreeSpace.select(&candidates, size) {
                Some(index) => {
                    prop_assert!(free[index] >= size);
                    prop_assert_eq!(free[index], *free.iter().max().unwrap());
                }
                None => prop_assert!(free.iter().all(|free| *free < size)),
            }
        }
    }

    #[tokio::test]
    async fn test_choose_reprobes_between_calls() {
        let (_temp_dir, configs) = create_temp_volumes(&[Some(10), Some(3)]);
        let volumes = VolumeSet::open(&configs).await.unwrap();

        let first = choose_volume(&volumes, &GreedyFreeSpace, 5).await.unwrap();
        assert_eq!(first.volume.id(), volumes.by_index(0).unwrap().id());
        assert_eq!(first.free_bytes, 10);
        std::fs::write(first.volume.file_path(FileId::generate()), vec![0u8; 5]).unwrap();

        // A now has 5 free, B has 3: nothing fits 8 bytes.
        let result = choose_volume(&volumes, &GreedyFreeSpace, 8).await;
        match result {
            Err(StorageError::InsufficientStorage { needed, available }) => {
                assert_eq!(needed, 8);
                assert_eq!(available, 5);
            }
            other => panic!("Expected InsufficientStorage, got {other:?}"),
        }

        let third = choose_volume(&volumes, &GreedyFreeSpace, 4).await.unwrap();
        assert_eq!(third.volume.id(), volumes.by_index(0).unwrap().id());
        assert_eq!(third.free_bytes, 5);
    }
}
