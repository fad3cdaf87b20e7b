// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Interfaces to the bootloader slot state and other platform services that
//! the update engine depends on, plus implementations backed by a
//! [`DeviceConfig`] for running outside of a real device.

use std::{
    fs, io,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

pub type Slot = u32;

pub const INVALID_SLOT: Slot = u32::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid slot: {0}")]
    InvalidSlot(Slot),
    #[error("Partition {0:?} not found for slot {1}")]
    PartitionNotFound(String, String),
    #[error("Operation failed: {0}")]
    Failed(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable name of a slot for logging.
pub fn slot_name(slot: Slot) -> String {
    if slot == INVALID_SLOT {
        "INVALID".to_owned()
    } else if slot < 26 {
        char::from(b'A' + slot as u8).to_string()
    } else {
        "TOO_BIG".to_owned()
    }
}

/// Partition name suffix for a slot, like `_a`.
pub fn slot_suffix(slot: Slot) -> Option<String> {
    if slot < 26 {
        Some(format!("_{}", char::from(b'a' + slot as u8)))
    } else {
        None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionDevice {
    pub rw_device_path: PathBuf,
    pub readonly_device_path: PathBuf,
    pub is_dynamic: bool,
}

/// Dynamic (logical) partition management.
pub trait DynamicPartitionControl {
    fn is_virtual_ab_enabled(&self) -> bool;

    /// Map every logical partition of the target slot so that it can be
    /// mounted.
    fn map_all_partitions(&self) -> Result<()>;

    fn unmap_all_partitions(&self) -> Result<()>;

    /// Commit the update of the dynamic partition metadata. Called once all
    /// postinstall programs succeeded and the slot is about to be switched.
    fn finish_update(&self, powerwash_required: bool) -> Result<()>;
}

pub trait BootControl {
    fn num_slots(&self) -> u32;

    fn current_slot(&self) -> Slot;

    /// Resolve the block devices for `name` in `slot`.
    fn partition_device(
        &self,
        name: &str,
        slot: Slot,
        current_slot: Slot,
        not_in_payload: bool,
    ) -> Result<PartitionDevice>;

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool>;

    fn mark_slot_unbootable(&self, slot: Slot) -> Result<()>;

    fn set_active_boot_slot(&self, slot: Slot) -> Result<()>;

    fn active_boot_slot(&self) -> Slot;

    /// Mark the current boot as successful. `callback` receives whether the
    /// operation succeeded and may run on another thread.
    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> Result<()>;

    fn is_slot_marked_successful(&self, slot: Slot) -> Result<bool>;

    fn dynamic_partition_control(&self) -> &dyn DynamicPartitionControl;
}

/// Other platform services used when finalizing an update.
pub trait Hardware {
    fn schedule_powerwash(&self) -> Result<()>;

    fn cancel_powerwash(&self) -> Result<()>;

    /// Filesystem-specific mount options for a partition. May be empty.
    fn partition_mount_options(&self, partition: &str) -> String;

    fn set_warm_reset(&self, warm_reset: bool);

    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool) -> Result<()>;
}

/// Dynamic partitions of a host device. Logical partitions are expected to
/// already be mapped, so only the virtual A/B flag has any effect.
#[derive(Debug, Default)]
pub struct HostDynamicPartitions {
    virtual_ab: bool,
}

impl DynamicPartitionControl for HostDynamicPartitions {
    fn is_virtual_ab_enabled(&self) -> bool {
        self.virtual_ab
    }

    fn map_all_partitions(&self) -> Result<()> {
        debug!("Logical partitions are already mapped");
        Ok(())
    }

    fn unmap_all_partitions(&self) -> Result<()> {
        Ok(())
    }

    fn finish_update(&self, powerwash_required: bool) -> Result<()> {
        debug!("Finished dynamic partition update (powerwash: {powerwash_required})");
        Ok(())
    }
}

#[derive(Debug)]
struct SlotState {
    bootable: bool,
    successful: bool,
}

/// Slot state kept in memory. Block devices are looked up as
/// `<device_dir>/<name><suffix>`.
#[derive(Debug)]
pub struct HostBootControl {
    device_dir: PathBuf,
    current_slot: Slot,
    active_slot: AtomicU32,
    slots: Mutex<Vec<SlotState>>,
    dynamic: HostDynamicPartitions,
}

impl HostBootControl {
    pub fn new(config: &DeviceConfig) -> Self {
        let slots = (0..config.num_slots)
            .map(|_| SlotState {
                bootable: true,
                successful: false,
            })
            .collect();

        Self {
            device_dir: config.device_dir.clone(),
            current_slot: config.current_slot,
            active_slot: AtomicU32::new(config.current_slot),
            slots: Mutex::new(slots),
            dynamic: HostDynamicPartitions {
                virtual_ab: config.virtual_ab,
            },
        }
    }

    fn with_slot<T>(&self, slot: Slot, f: impl FnOnce(&mut SlotState) -> T) -> Result<T> {
        let mut slots = self.slots.lock().unwrap();
        let state = slots
            .get_mut(slot as usize)
            .ok_or(Error::InvalidSlot(slot))?;

        Ok(f(state))
    }
}

impl BootControl for HostBootControl {
    fn num_slots(&self) -> u32 {
        // The config validation guarantees this fits.
        self.slots.lock().unwrap().len() as u32
    }

    fn current_slot(&self) -> Slot {
        self.current_slot
    }

    fn partition_device(
        &self,
        name: &str,
        slot: Slot,
        _current_slot: Slot,
        _not_in_payload: bool,
    ) -> Result<PartitionDevice> {
        if slot >= self.num_slots() {
            return Err(Error::InvalidSlot(slot));
        }
        let suffix = slot_suffix(slot).ok_or(Error::InvalidSlot(slot))?;

        let path = self.device_dir.join(format!("{name}{suffix}"));
        if !path.exists() {
            return Err(Error::PartitionNotFound(name.to_owned(), slot_name(slot)));
        }

        Ok(PartitionDevice {
            rw_device_path: path.clone(),
            readonly_device_path: path,
            is_dynamic: false,
        })
    }

    fn is_slot_bootable(&self, slot: Slot) -> Result<bool> {
        self.with_slot(slot, |s| s.bootable)
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> Result<()> {
        info!("Marking slot {} as unbootable", slot_name(slot));
        self.with_slot(slot, |s| {
            s.bootable = false;
            s.successful = false;
        })
    }

    fn set_active_boot_slot(&self, slot: Slot) -> Result<()> {
        self.with_slot(slot, |s| s.bootable = true)?;
        self.active_slot.store(slot, Ordering::SeqCst);
        info!("Marked slot {} as active", slot_name(slot));

        Ok(())
    }

    fn active_boot_slot(&self) -> Slot {
        self.active_slot.load(Ordering::SeqCst)
    }

    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> Result<()> {
        let result = self.with_slot(self.current_slot, |s| s.successful = true);
        callback(result.is_ok());

        result
    }

    fn is_slot_marked_successful(&self, slot: Slot) -> Result<bool> {
        self.with_slot(slot, |s| s.successful)
    }

    fn dynamic_partition_control(&self) -> &dyn DynamicPartitionControl {
        &self.dynamic
    }
}

const POWERWASH_COMMAND: &str = "--wipe_data\n--reason=wipe_data_from_ota\n";

#[derive(Debug)]
pub struct HostHardware {
    config: DeviceConfig,
}

impl HostHardware {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Hardware for HostHardware {
    fn schedule_powerwash(&self) -> Result<()> {
        let Some(path) = &self.config.powerwash_file else {
            return Err(Error::Failed("No powerwash file configured".to_owned()));
        };

        fs::write(path, POWERWASH_COMMAND)?;
        info!("Powerwash scheduled in {path:?}");

        Ok(())
    }

    fn cancel_powerwash(&self) -> Result<()> {
        let Some(path) = &self.config.powerwash_file else {
            return Ok(());
        };

        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!("Powerwash cancelled");

        Ok(())
    }

    fn partition_mount_options(&self, partition: &str) -> String {
        self.config
            .mount_options
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    fn set_warm_reset(&self, warm_reset: bool) {
        debug!("Warm reset on next reboot: {warm_reset}");
    }

    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool) -> Result<()> {
        if reset {
            warn!("Clearing vbmeta digest for inactive slot");
        } else {
            debug!("Persisting vbmeta digest for inactive slot");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn names() {
        assert_eq!(slot_name(0), "A");
        assert_eq!(slot_name(1), "B");
        assert_eq!(slot_name(25), "Z");
        assert_eq!(slot_name(26), "TOO_BIG");
        assert_eq!(slot_name(INVALID_SLOT), "INVALID");
        assert_eq!(slot_suffix(1).as_deref(), Some("_b"));
        assert_eq!(slot_suffix(INVALID_SLOT), None);
    }

    #[test]
    fn host_slots() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("system_b"), b"").unwrap();

        let config = DeviceConfig {
            device_dir: temp_dir.path().to_owned(),
            ..Default::default()
        };
        let boot_control = HostBootControl::new(&config);

        assert_eq!(boot_control.num_slots(), 2);
        assert_eq!(boot_control.current_slot(), 0);
        assert!(!boot_control.dynamic_partition_control().is_virtual_ab_enabled());

        let device = boot_control.partition_device("system", 1, 0, false).unwrap();
        assert_eq!(device.readonly_device_path, temp_dir.path().join("system_b"));
        assert_matches!(
            boot_control.partition_device("system", 0, 0, false),
            Err(Error::PartitionNotFound(_, s)) if s == "A"
        );
        assert_matches!(
            boot_control.partition_device("system", 2, 0, false),
            Err(Error::InvalidSlot(2))
        );

        boot_control.mark_slot_unbootable(1).unwrap();
        assert!(!boot_control.is_slot_bootable(1).unwrap());
        boot_control.set_active_boot_slot(1).unwrap();
        assert!(boot_control.is_slot_bootable(1).unwrap());
        assert_eq!(boot_control.active_boot_slot(), 1);

        boot_control
            .mark_boot_successful_async(Box::new(|ok| assert!(ok)))
            .unwrap();
        assert!(boot_control.is_slot_marked_successful(0).unwrap());
    }

    #[test]
    fn host_powerwash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("command");
        let config = DeviceConfig {
            powerwash_file: Some(path.clone()),
            ..Default::default()
        };
        let hardware = HostHardware::new(&config);

        hardware.schedule_powerwash().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), POWERWASH_COMMAND);
        hardware.cancel_powerwash().unwrap();
        assert!(!path.exists());
        hardware.cancel_powerwash().unwrap();

        let hardware = HostHardware::new(&DeviceConfig::default());
        assert_matches!(hardware.schedule_powerwash(), Err(Error::Failed(_)));
    }
}
