// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of the written target partitions against the hashes recorded
//! in the manifest. This runs before any postinstall program is started so
//! that a corrupted partition is never mounted or booted.

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
};

use ring::digest::{Context, Digest, SHA256};
use thiserror::Error;
use tracing::{error, info};

use crate::{error_code::ErrorCode, install_plan::Partition, progress::ProgressAggregator};

const READ_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No partitions to verify")]
    NoPartitions,
    #[error("Failed to open {0} for reading: {1:?}")]
    Open(String, PathBuf, #[source] io::Error),
    #[error("Failed to read {0}")]
    Read(String, #[source] io::Error),
    #[error("Partition {name} ends after {actual} of {expected} bytes")]
    Truncated {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("New {name} partition verification failed: expected {expected}, actual {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::HashMismatch { .. } => ErrorCode::NewRootfsVerificationError,
            _ => ErrorCode::FilesystemVerifierError,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Hash up to `size` bytes from `reader`. Returns the digest and the number of
/// bytes that were actually available.
fn hash_prefix(
    mut reader: impl Read,
    size: u64,
    mut on_progress: impl FnMut(f64),
) -> io::Result<(Digest, u64)> {
    let mut context = Context::new(&SHA256);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut hashed = 0u64;

    while hashed < size {
        let to_read = (size - hashed).min(buf.len() as u64) as usize;

        let n = match reader.read(&mut buf[..to_read]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        context.update(&buf[..n]);
        hashed += n as u64;
        on_progress(hashed as f64 / size as f64);
    }

    Ok((context.finish(), hashed))
}

/// Check the first `target_size` bytes of one partition's device. Anything
/// past `target_size` is ignored.
pub fn verify_partition(partition: &Partition, on_progress: impl FnMut(f64)) -> Result<()> {
    let name = &partition.name;

    info!(
        "Hashing {} bytes of {name} on {:?}",
        partition.target_size, partition.target_path,
    );

    let file = File::open(&partition.target_path)
        .map_err(|e| Error::Open(name.clone(), partition.target_path.clone(), e))?;

    let (digest, hashed) = hash_prefix(file, partition.target_size, on_progress)
        .map_err(|e| Error::Read(name.clone(), e))?;

    if hashed != partition.target_size {
        return Err(Error::Truncated {
            name: name.clone(),
            expected: partition.target_size,
            actual: hashed,
        });
    }

    info!("Hash of {name}: {}", hex::encode(digest));

    if digest.as_ref() != partition.target_hash.as_slice() {
        return Err(Error::HashMismatch {
            name: name.clone(),
            expected: hex::encode(&partition.target_hash),
            actual: hex::encode(digest),
        });
    }

    Ok(())
}

/// Verify every partition in order, stopping at the first failure. Progress
/// is weighted by partition size.
pub fn verify_partitions(
    partitions: &[Partition],
    mut on_progress: impl FnMut(f64),
) -> Result<()> {
    if partitions.is_empty() {
        return Err(Error::NoPartitions);
    }

    let weights = partitions.iter().map(|p| p.target_size).collect();
    let mut aggregator = ProgressAggregator::new(weights);

    on_progress(aggregator.progress(0.0));

    for partition in partitions {
        if partition.target_size == 0 {
            info!("Skipping verification of empty partition {}", partition.name);
        } else {
            verify_partition(partition, |f| on_progress(aggregator.progress(f)))
                .inspect_err(|e| error!("{e}"))?;
        }

        aggregator.advance();
    }

    on_progress(aggregator.progress(0.0));

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use assert_matches::assert_matches;
    use ring::digest::digest;
    use tempfile::TempDir;

    use super::*;

    fn image(dir: &Path, name: &str, data: &[u8], target_size: u64) -> Partition {
        let path = dir.join(format!("{name}.img"));
        fs::write(&path, data).unwrap();

        let size = (target_size as usize).min(data.len());

        Partition {
            name: name.to_owned(),
            target_path: path.clone(),
            readonly_target_path: path,
            target_size,
            target_hash: digest(&SHA256, &data[..size]).as_ref().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn matching_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let size = READ_BUFFER_SIZE as u64;
        let partitions = [
            image(temp_dir.path(), "system", &vec![0x11; 3 * READ_BUFFER_SIZE], 3 * size),
            image(temp_dir.path(), "vendor", &vec![0x22; READ_BUFFER_SIZE], size),
        ];

        let mut progress = vec![];
        verify_partitions(&partitions, |p| progress.push(p)).unwrap();

        assert_eq!(progress.first(), Some(&0.0));
        assert_eq!(progress.last(), Some(&1.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        // The first partition is three quarters of the total.
        assert!(progress.contains(&0.75));
    }

    #[test]
    fn data_past_target_size_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let mut data = vec![0x33; 8192];
        let partition = image(temp_dir.path(), "odm", &data, 4096);

        data[5000] ^= 0xff;
        fs::write(&partition.target_path, &data).unwrap();

        verify_partition(&partition, |_| {}).unwrap();
    }

    #[test]
    fn mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let mut partition = image(temp_dir.path(), "system", &[0x44; 4096], 4096);
        partition.target_hash[0] ^= 1;

        let err = verify_partitions(&[partition], |_| {}).unwrap_err();
        assert_matches!(&err, Error::HashMismatch { name, .. } if name == "system");
        assert_eq!(err.error_code(), ErrorCode::NewRootfsVerificationError);

        let mut partition = image(temp_dir.path(), "vendor", &[0x44; 4096], 4096);
        partition.target_hash.clear();
        assert_matches!(
            verify_partition(&partition, |_| {}),
            Err(Error::HashMismatch { .. })
        );
    }

    #[test]
    fn read_failures() {
        let temp_dir = TempDir::new().unwrap();

        let partition = image(temp_dir.path(), "system", &[0x55; 1000], 4096);
        let err = verify_partition(&partition, |_| {}).unwrap_err();
        assert_matches!(err, Error::Truncated { expected: 4096, actual: 1000, .. });
        assert_eq!(err.error_code(), ErrorCode::FilesystemVerifierError);

        let mut partition = image(temp_dir.path(), "vendor", &[0x55; 4096], 4096);
        partition.target_path = temp_dir.path().join("missing.img");
        assert_matches!(
            verify_partition(&partition, |_| {}),
            Err(Error::Open(_, _, _))
        );

        let err = verify_partitions(&[], |_| {}).unwrap_err();
        assert_matches!(err, Error::NoPartitions);
        assert_eq!(err.error_code(), ErrorCode::FilesystemVerifierError);
    }

    #[test]
    fn empty_partitions_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mut empty = image(temp_dir.path(), "misc", &[], 0);
        empty.target_path = temp_dir.path().join("missing.img");

        let partitions = [empty, image(temp_dir.path(), "system", &[0x66; 4096], 4096)];
        verify_partitions(&partitions, |_| {}).unwrap();
    }
}
