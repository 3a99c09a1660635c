//! Test fixtures for storage testing.
//!
//! Provides temporary volume layouts and byte stream helpers for consistent
//! testing across storage-related modules and the integration test crate.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::{Stream, TryStreamExt, stream};

use super::VolumeConfig;

/// Creates one temporary volume root per entry of `capacities`.
///
/// A `Some` capacity becomes the volume quota, `None` leaves it probed.
///
/// # Panics
///
/// Panics if temporary directory creation fails. This is acceptable in test
/// fixtures where failures indicate environment issues.
pub fn create_temp_volumes(capacities: &[Option<u64>]) -> (tempfile::TempDir, Vec<VolumeConfig>) {
    let temp_dir = tempfile::tempdir().unwrap();
    let configs = capacities
        .iter()
        .enumerate()
        .map(|(index, capacity)| {
            let root = temp_dir.path().join(format!("volume{index}"));
            std::fs::create_dir_all(&root).unwrap();
            VolumeConfig {
                root,
                capacity_bytes: *capacity,
            }
        })
        .collect();

    (temp_dir, configs)
}

/// Returns a metadata directory path inside `temp_dir`.
pub fn metadata_dir(temp_dir: &tempfile::TempDir) -> PathBuf {
    temp_dir.path().join("metadata")
}

/// Splits `data` into a stream of chunks of at most `chunk_size` bytes.
pub fn chunked_stream(
    data: Vec<u8>,
    chunk_size: usize,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk_size.max(1))
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}

/// Stream that yields `prefix` and then fails, like a client disconnecting.
pub fn interrupted_stream(
    prefix: Vec<u8>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
    stream::iter(vec![
        Ok(Bytes::from(prefix)),
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "client went away",
        )),
    ])
}

/// Collects a byte stream into a single buffer.
///
/// # Errors
///
/// - `io::Error` - The first error the stream yields
pub async fn collect_bytes(
    body: impl Stream<Item = io::Result<Bytes>>,
) -> io::Result<Vec<u8>> {
    body.try_fold(Vec::new(), |mut buffer, chunk| async move {
        buffer.extend_from_slice(&chunk);
        Ok(buffer)
    })
    .await
}

/// Counts regular files under a volume's `files/` and `tmp/` directories.
pub fn count_volume_files(config: &VolumeConfig) -> usize {
    ["files", "tmp"]
        .iter()
        .filter_map(|dir| std::fs::read_dir(config.root.join(dir)).ok())
        .flat_map(|entries| entries.filter_map(Result::ok))
        .filter(|entry| entry.path().is_file())
        .count()
}
