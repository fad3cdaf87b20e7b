// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File descriptor number that the postinstall program writes its status
/// lines to.
pub const DEFAULT_STATUS_FD: i32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostinstallConfig {
    /// Directory where target partitions are mounted while their postinstall
    /// program runs.
    pub mount_dir: PathBuf,
    /// How long to wait for progress or subprocess exit before checking
    /// control messages again.
    pub poll_interval_ms: u64,
    /// Whether the engine is running from recovery, where dynamic partitions
    /// are already mapped.
    pub recovery: bool,
    pub status_fd: i32,
}

impl Default for PostinstallConfig {
    fn default() -> Self {
        Self {
            mount_dir: PathBuf::from("/postinstall"),
            poll_interval_ms: 100,
            recovery: false,
            status_fd: DEFAULT_STATUS_FD,
        }
    }
}

impl PostinstallConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub num_slots: u32,
    pub current_slot: u32,
    /// Directory containing `<partition>_<slot suffix>` block devices.
    pub device_dir: PathBuf,
    pub virtual_ab: bool,
    /// Recovery command file written when a powerwash is scheduled.
    pub powerwash_file: Option<PathBuf>,
    /// Extra filesystem mount options per partition name.
    pub mount_options: BTreeMap<String, String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_slots: 2,
            current_slot: 0,
            device_dir: PathBuf::from("/dev/block/by-name"),
            virtual_ab: false,
            powerwash_file: None,
            mount_options: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub postinstall: PostinstallConfig,
    pub device: DeviceConfig,
}

impl Config {
    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        let config: Self =
            toml_edit::de::from_str(contents).map_err(|e| Error::Parse(path.to_owned(), e))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device.num_slots == 0 {
            return Err(Error::Invalid("num_slots must be non-zero".to_owned()));
        } else if self.device.current_slot >= self.device.num_slots {
            return Err(Error::Invalid(format!(
                "current_slot ({}) must be less than num_slots ({})",
                self.device.current_slot, self.device.num_slots,
            )));
        } else if !self.postinstall.mount_dir.is_absolute() {
            return Err(Error::Invalid(format!(
                "mount_dir must be absolute: {:?}",
                self.postinstall.mount_dir,
            )));
        } else if self.postinstall.status_fd <= 2 {
            return Err(Error::Invalid(format!(
                "status_fd must not be a standard stream: {}",
                self.postinstall.status_fd,
            )));
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

    Config::parse(path, &contents)
}
