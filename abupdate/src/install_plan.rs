// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, path::PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    boot_control::{self, BootControl, INVALID_SLOT, Slot, slot_name},
    error_code::ErrorCode,
    protobuf::chromeos_update_engine::{DeltaArchiveManifest, PartitionUpdate},
};

/// Download source marker for postinstall runs that were triggered
/// separately from an update, using a cached manifest.
pub const MANIFEST_BYTES_PREFIX: &str = "manifest-bytes";

pub const PROPERTY_FILE_HASH: &str = "FILE_HASH";
pub const PROPERTY_FILE_SIZE: &str = "FILE_SIZE";
pub const PROPERTY_METADATA_HASH: &str = "METADATA_HASH";
pub const PROPERTY_METADATA_SIZE: &str = "METADATA_SIZE";
pub const PROPERTY_POWERWASH: &str = "POWERWASH";
pub const PROPERTY_SWITCH_SLOT_ON_REBOOT: &str = "SWITCH_SLOT_ON_REBOOT";
pub const PROPERTY_RUN_POST_INSTALL: &str = "RUN_POST_INSTALL";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload properties line: {0:?}")]
    InvalidPropertiesLine(String),
    #[error("Duplicate payload property: {0:?}")]
    DuplicateProperty(String),
    #[error("Invalid value for payload property {0:?}: {1:?}")]
    InvalidProperty(&'static str, String),
    #[error("Size of {0} ({1}) is not aligned to the block size ({2})")]
    InvalidPartitionSize(String, u64, u32),
    #[error("Partition not found in manifest: {0}")]
    MissingPartition(String),
    #[error("Partition {0} does not have a postinstall program")]
    NoPostinstallProgram(String),
    #[error("Failed to find device for partition {0}")]
    PartitionDevice(String, #[source] boot_control::Error),
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingPartition(_) | Self::NoPostinstallProgram(_) => {
                ErrorCode::DownloadStateInitializationError
            }
            Self::InvalidPartitionSize(_, _, _) | Self::PartitionDevice(_, _) => {
                ErrorCode::DownloadManifestParseError
            }
            _ => ErrorCode::Error,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A partition to install and, optionally, run the postinstall program of.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub target_path: PathBuf,
    pub readonly_target_path: PathBuf,
    pub target_size: u64,
    pub target_hash: Vec<u8>,
    pub filesystem_type: String,
    /// Relative to the partition root. Empty if there is no program.
    pub postinstall_path: String,
    pub run_postinstall: bool,
    pub postinstall_optional: bool,
}

impl Partition {
    fn from_update(update: &PartitionUpdate) -> Self {
        let info = update.new_partition_info.as_ref();

        Self {
            name: update.partition_name.clone(),
            target_size: info.and_then(|i| i.size).unwrap_or_default(),
            target_hash: info.and_then(|i| i.hash.clone()).unwrap_or_default(),
            filesystem_type: update.filesystem_type().to_owned(),
            postinstall_path: update.postinstall_path().to_owned(),
            run_postinstall: update.run_postinstall(),
            postinstall_optional: update.postinstall_optional(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallPlan {
    /// Where the payload came from. Empty if nothing was downloaded, in which
    /// case postinstall is skipped.
    pub download_url: String,
    pub source_slot: Slot,
    pub target_slot: Slot,
    pub partitions: Vec<Partition>,
    pub powerwash_required: bool,
    pub switch_slot_on_reboot: bool,
    pub run_post_install: bool,
    pub payload_size: Option<u64>,
    pub payload_hash: Option<Vec<u8>>,
    pub metadata_size: Option<u64>,
    pub metadata_hash: Option<Vec<u8>>,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            download_url: String::new(),
            source_slot: INVALID_SLOT,
            target_slot: INVALID_SLOT,
            partitions: vec![],
            powerwash_required: false,
            switch_slot_on_reboot: true,
            run_post_install: true,
            payload_size: None,
            payload_hash: None,
            metadata_size: None,
            metadata_hash: None,
        }
    }
}

impl InstallPlan {
    /// Whether this plan was created to run a single partition's postinstall
    /// program outside of an update.
    pub fn is_triggered_postinstall(&self) -> bool {
        self.partitions.len() == 1
            && !self.switch_slot_on_reboot
            && self.download_url.starts_with(MANIFEST_BYTES_PREFIX)
    }

    /// Populate the partition list from the manifest, resolving the target
    /// devices of each partition.
    pub fn load_partitions<'a>(
        &mut self,
        updates: impl IntoIterator<Item = &'a PartitionUpdate>,
        block_size: u32,
        boot_control: &dyn BootControl,
    ) -> Result<()> {
        let mut partitions = vec![];

        for update in updates {
            let mut partition = Partition::from_update(update);

            if block_size != 0 && partition.target_size % u64::from(block_size) != 0 {
                return Err(Error::InvalidPartitionSize(
                    partition.name,
                    partition.target_size,
                    block_size,
                ));
            }

            let device = boot_control
                .partition_device(&partition.name, self.target_slot, self.source_slot, false)
                .map_err(|e| Error::PartitionDevice(partition.name.clone(), e))?;
            partition.target_path = device.rw_device_path;
            partition.readonly_target_path = device.readonly_device_path;

            partitions.push(partition);
        }

        self.partitions = partitions;

        Ok(())
    }

    /// Apply the `KEY=VALUE` payload properties.
    pub fn apply_properties(&mut self, properties: &BTreeMap<String, String>) -> Result<()> {
        let get = |key: &str| properties.get(key).map(|v| v.as_str());

        if let Some(value) = get(PROPERTY_FILE_SIZE) {
            self.payload_size = Some(parse_u64(PROPERTY_FILE_SIZE, value)?);
        }
        if let Some(value) = get(PROPERTY_FILE_HASH) {
            match STANDARD.decode(value) {
                Ok(hash) => self.payload_hash = Some(hash),
                Err(e) => warn!("Unable to decode base64 file hash: {value:?}: {e}"),
            }
        }
        if let Some(value) = get(PROPERTY_METADATA_SIZE) {
            self.metadata_size = Some(parse_u64(PROPERTY_METADATA_SIZE, value)?);
        }
        if let Some(value) = get(PROPERTY_METADATA_HASH) {
            let hash = STANDARD
                .decode(value)
                .map_err(|_| Error::InvalidProperty(PROPERTY_METADATA_HASH, value.to_owned()))?;
            self.metadata_hash = Some(hash);
        }

        self.powerwash_required = property_bool(get(PROPERTY_POWERWASH), false);
        self.switch_slot_on_reboot = property_bool(get(PROPERTY_SWITCH_SLOT_ON_REBOOT), true);
        self.run_post_install = property_bool(get(PROPERTY_RUN_POST_INSTALL), true);

        Ok(())
    }

    pub fn log(&self) {
        info!("Install plan:");
        info!("  download_url: {:?}", self.download_url);
        info!("  source_slot: {}", slot_name(self.source_slot));
        info!("  target_slot: {}", slot_name(self.target_slot));
        info!("  powerwash_required: {}", self.powerwash_required);
        info!("  switch_slot_on_reboot: {}", self.switch_slot_on_reboot);
        info!("  run_post_install: {}", self.run_post_install);

        for p in &self.partitions {
            info!(
                "  partition {}: target={:?} run_postinstall={} path={:?} optional={}",
                p.name,
                p.readonly_target_path,
                p.run_postinstall,
                p.postinstall_path,
                p.postinstall_optional,
            );
        }
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::InvalidProperty(key, value.to_owned()))
}

/// Only `0` and `1` are recognized. Anything else uses the default.
fn property_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some("0") => false,
        Some("1") => true,
        _ => default,
    }
}

/// Parse `payload_properties.txt`-style `KEY=VALUE` lines. Keys must be
/// unique.
pub fn parse_properties<'a>(
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();

    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::InvalidPropertiesLine(line.to_owned()));
        };

        if result.insert(key.to_owned(), value.to_owned()).is_some() {
            return Err(Error::DuplicateProperty(key.to_owned()));
        }
    }

    Ok(result)
}

/// Build a plan that runs the postinstall program of a single partition from
/// an already verified manifest. The slot is never switched.
pub fn triggered_postinstall_plan(
    manifest: &DeltaArchiveManifest,
    partition: &str,
    download_url: &str,
    boot_control: &dyn BootControl,
) -> Result<InstallPlan> {
    let current = boot_control.current_slot();

    let mut plan = InstallPlan {
        source_slot: current,
        target_slot: if current == 0 { 1 } else { 0 },
        switch_slot_on_reboot: false,
        run_post_install: true,
        download_url: format!("{MANIFEST_BYTES_PREFIX}:{download_url}"),
        ..Default::default()
    };

    let update = manifest
        .partitions
        .iter()
        .find(|p| p.partition_name == partition)
        .ok_or_else(|| Error::MissingPartition(partition.to_owned()))?;

    if update.postinstall_path().is_empty() {
        return Err(Error::NoPostinstallProgram(partition.to_owned()));
    }

    plan.load_partitions([update], manifest.block_size(), boot_control)?;

    Ok(plan)
}
