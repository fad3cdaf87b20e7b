// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory implementations of the platform interfaces. Every type is a cheap
//! handle to shared state, so a clone can be given to the code under test while
//! the original is used to inspect what happened.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    boot_control::{
        self, BootControl, DynamicPartitionControl, Hardware, PartitionDevice, Slot, slot_suffix,
    },
    mount::Mounter,
};
#[cfg(unix)]
use crate::{error_code::ErrorCode, postinstall::PostinstallDelegate};

#[derive(Debug, Default)]
struct DynamicState {
    virtual_ab: bool,
    fail_map: bool,
    fail_finish: bool,
    map_count: usize,
    unmap_count: usize,
    finish_calls: Vec<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeDynamicPartitionControl {
    state: Arc<Mutex<DynamicState>>,
}

impl FakeDynamicPartitionControl {
    pub fn set_virtual_ab(&self, enabled: bool) {
        self.state.lock().unwrap().virtual_ab = enabled;
    }

    pub fn set_fail_map(&self, fail: bool) {
        self.state.lock().unwrap().fail_map = fail;
    }

    pub fn set_fail_finish(&self, fail: bool) {
        self.state.lock().unwrap().fail_finish = fail;
    }

    pub fn map_count(&self) -> usize {
        self.state.lock().unwrap().map_count
    }

    pub fn unmap_count(&self) -> usize {
        self.state.lock().unwrap().unmap_count
    }

    /// The `powerwash_required` argument of each `finish_update` call.
    pub fn finish_calls(&self) -> Vec<bool> {
        self.state.lock().unwrap().finish_calls.clone()
    }
}

impl DynamicPartitionControl for FakeDynamicPartitionControl {
    fn is_virtual_ab_enabled(&self) -> bool {
        self.state.lock().unwrap().virtual_ab
    }

    fn map_all_partitions(&self) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.map_count += 1;

        if state.fail_map {
            return Err(boot_control::Error::Failed("map".to_owned()));
        }

        Ok(())
    }

    fn unmap_all_partitions(&self) -> boot_control::Result<()> {
        self.state.lock().unwrap().unmap_count += 1;
        Ok(())
    }

    fn finish_update(&self, powerwash_required: bool) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.finish_calls.push(powerwash_required);

        if state.fail_finish {
            return Err(boot_control::Error::Failed("finish".to_owned()));
        }

        Ok(())
    }
}

#[derive(Debug)]
struct BootState {
    num_slots: u32,
    current_slot: Slot,
    active_slot: Slot,
    set_active_calls: Vec<Slot>,
    fail_set_active: bool,
    unbootable: BTreeSet<Slot>,
    successful: BTreeSet<Slot>,
}

/// Two slots with slot 0 booted. Every partition exists at
/// `/dev/block/by-name/<name><suffix>`.
#[derive(Clone, Debug)]
pub struct FakeBootControl {
    state: Arc<Mutex<BootState>>,
    dynamic: FakeDynamicPartitionControl,
}

impl Default for FakeBootControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBootControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BootState {
                num_slots: 2,
                current_slot: 0,
                active_slot: 0,
                set_active_calls: vec![],
                fail_set_active: false,
                unbootable: BTreeSet::new(),
                successful: BTreeSet::new(),
            })),
            dynamic: FakeDynamicPartitionControl::default(),
        }
    }

    pub fn set_current_slot(&self, slot: Slot) {
        let mut state = self.state.lock().unwrap();
        state.current_slot = slot;
        state.active_slot = slot;
    }

    pub fn set_fail_set_active(&self, fail: bool) {
        self.state.lock().unwrap().fail_set_active = fail;
    }

    pub fn set_active_calls(&self) -> Vec<Slot> {
        self.state.lock().unwrap().set_active_calls.clone()
    }

    pub fn dynamic(&self) -> &FakeDynamicPartitionControl {
        &self.dynamic
    }

    fn check_slot(state: &BootState, slot: Slot) -> boot_control::Result<()> {
        if slot >= state.num_slots {
            return Err(boot_control::Error::InvalidSlot(slot));
        }

        Ok(())
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.state.lock().unwrap().num_slots
    }

    fn current_slot(&self) -> Slot {
        self.state.lock().unwrap().current_slot
    }

    fn partition_device(
        &self,
        name: &str,
        slot: Slot,
        _current_slot: Slot,
        _not_in_payload: bool,
    ) -> boot_control::Result<PartitionDevice> {
        Self::check_slot(&self.state.lock().unwrap(), slot)?;
        let suffix = slot_suffix(slot).ok_or(boot_control::Error::InvalidSlot(slot))?;
        let path = PathBuf::from(format!("/dev/block/by-name/{name}{suffix}"));

        Ok(PartitionDevice {
            rw_device_path: path.clone(),
            readonly_device_path: path,
            is_dynamic: false,
        })
    }

    fn is_slot_bootable(&self, slot: Slot) -> boot_control::Result<bool> {
        let state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;

        Ok(!state.unbootable.contains(&slot))
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;
        state.unbootable.insert(slot);
        state.successful.remove(&slot);

        Ok(())
    }

    fn set_active_boot_slot(&self, slot: Slot) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.set_active_calls.push(slot);

        if state.fail_set_active {
            return Err(boot_control::Error::Failed("set active".to_owned()));
        }
        Self::check_slot(&state, slot)?;
        state.active_slot = slot;
        state.unbootable.remove(&slot);

        Ok(())
    }

    fn active_boot_slot(&self) -> Slot {
        self.state.lock().unwrap().active_slot
    }

    fn mark_boot_successful_async(
        &self,
        callback: Box<dyn FnOnce(bool) + Send>,
    ) -> boot_control::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let current = state.current_slot;
            state.successful.insert(current);
        }
        callback(true);

        Ok(())
    }

    fn is_slot_marked_successful(&self, slot: Slot) -> boot_control::Result<bool> {
        let state = self.state.lock().unwrap();
        Self::check_slot(&state, slot)?;

        Ok(state.successful.contains(&slot))
    }

    fn dynamic_partition_control(&self) -> &dyn DynamicPartitionControl {
        &self.dynamic
    }
}

#[derive(Debug, Default)]
struct HardwareState {
    powerwash_scheduled: bool,
    fail_schedule: bool,
    schedule_count: usize,
    cancel_count: usize,
    warm_reset: Option<bool>,
    vbmeta_calls: Vec<bool>,
    mount_options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeHardware {
    state: Arc<Mutex<HardwareState>>,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_schedule(&self, fail: bool) {
        self.state.lock().unwrap().fail_schedule = fail;
    }

    pub fn set_mount_options(&self, partition: &str, options: &str) {
        self.state
            .lock()
            .unwrap()
            .mount_options
            .insert(partition.to_owned(), options.to_owned());
    }

    pub fn is_powerwash_scheduled(&self) -> bool {
        self.state.lock().unwrap().powerwash_scheduled
    }

    pub fn schedule_count(&self) -> usize {
        self.state.lock().unwrap().schedule_count
    }

    pub fn cancel_count(&self) -> usize {
        self.state.lock().unwrap().cancel_count
    }

    pub fn warm_reset(&self) -> Option<bool> {
        self.state.lock().unwrap().warm_reset
    }

    pub fn vbmeta_calls(&self) -> Vec<bool> {
        self.state.lock().unwrap().vbmeta_calls.clone()
    }
}

impl Hardware for FakeHardware {
    fn schedule_powerwash(&self) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.schedule_count += 1;

        if state.fail_schedule {
            return Err(boot_control::Error::Failed("schedule powerwash".to_owned()));
        }
        state.powerwash_scheduled = true;

        Ok(())
    }

    fn cancel_powerwash(&self) -> boot_control::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_count += 1;
        state.powerwash_scheduled = false;

        Ok(())
    }

    fn partition_mount_options(&self, partition: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .mount_options
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    fn set_warm_reset(&self, warm_reset: bool) {
        self.state.lock().unwrap().warm_reset = Some(warm_reset);
    }

    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool) -> boot_control::Result<()> {
        self.state.lock().unwrap().vbmeta_calls.push(reset);
        Ok(())
    }
}

/// A recorded call to [`Mounter::mount_readonly`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountCall {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

#[derive(Debug, Default)]
struct MounterState {
    missing: BTreeSet<PathBuf>,
    mounted: BTreeSet<PathBuf>,
    readonly: BTreeSet<PathBuf>,
    mounts: Vec<MountCall>,
    unmounts: Vec<PathBuf>,
    fail_mount: bool,
    fail_unmount: bool,
}

/// Every path exists unless marked missing. Nothing touches the real
/// filesystem.
#[derive(Clone, Debug, Default)]
pub struct FakeMounter {
    state: Arc<Mutex<MounterState>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_missing(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().missing.insert(path.into());
    }

    /// Pretend that something is already mounted at `path`.
    pub fn set_mounted(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().mounted.insert(path.into());
    }

    pub fn set_fail_mount(&self, fail: bool) {
        self.state.lock().unwrap().fail_mount = fail;
    }

    pub fn set_fail_unmount(&self, fail: bool) {
        self.state.lock().unwrap().fail_unmount = fail;
    }

    pub fn mounts(&self) -> Vec<MountCall> {
        self.state.lock().unwrap().mounts.clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unmounts.clone()
    }

    pub fn is_readonly(&self, device: &Path) -> bool {
        self.state.lock().unwrap().readonly.contains(device)
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().mounted.iter().cloned().collect()
    }
}

fn fake_io_error(what: &str) -> std::io::Error {
    std::io::Error::other(format!("Fake {what} failure"))
}

impl Mounter for FakeMounter {
    fn exists(&self, path: &Path) -> bool {
        !self.state.lock().unwrap().missing.contains(path)
    }

    fn is_mountpoint(&self, path: &Path) -> std::io::Result<bool> {
        Ok(self.state.lock().unwrap().mounted.contains(path))
    }

    fn set_block_device_readonly(&self, device: &Path, readonly: bool) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if readonly {
            state.readonly.insert(device.to_owned());
        } else {
            state.readonly.remove(device);
        }

        Ok(())
    }

    fn mount_readonly(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mounts.push(MountCall {
            device: device.to_owned(),
            mount_point: mount_point.to_owned(),
            fs_type: fs_type.to_owned(),
            options: options.to_owned(),
        });

        if state.fail_mount {
            return Err(fake_io_error("mount"));
        }
        state.mounted.insert(mount_point.to_owned());

        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.unmounts.push(mount_point.to_owned());

        if state.fail_unmount {
            return Err(fake_io_error("unmount"));
        }
        state.mounted.remove(mount_point);

        Ok(())
    }
}

#[cfg(unix)]
pub use self::launcher::{FIRST_PID, FakeLauncher};

#[cfg(unix)]
mod launcher {
    use std::{
        collections::BTreeMap,
        ffi::OsString,
        io,
        os::fd::{OwnedFd, RawFd},
        sync::{Arc, Mutex},
    };

    use crate::subprocess::{ChildSignal, Launcher, Spawned};

    pub const FIRST_PID: i32 = 1000;

    #[derive(Debug)]
    struct LauncherState {
        next_pid: i32,
        fail_spawn: bool,
        fail_nonblocking: bool,
        spawned: Vec<Vec<OsString>>,
        status_fds: Vec<RawFd>,
        writers: BTreeMap<i32, OwnedFd>,
        exited: BTreeMap<i32, i32>,
        signals: Vec<(i32, ChildSignal)>,
        released: Vec<i32>,
    }

    /// Launches nothing. Each spawn hands out a real pipe whose write end is
    /// kept here, so tests can feed status lines and decide when and how the
    /// "process" exits.
    #[derive(Clone, Debug)]
    pub struct FakeLauncher {
        state: Arc<Mutex<LauncherState>>,
    }

    impl Default for FakeLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(LauncherState {
                    next_pid: FIRST_PID,
                    fail_spawn: false,
                    fail_nonblocking: false,
                    spawned: vec![],
                    status_fds: vec![],
                    writers: BTreeMap::new(),
                    exited: BTreeMap::new(),
                    signals: vec![],
                    released: vec![],
                })),
            }
        }

        pub fn set_fail_spawn(&self, fail: bool) {
            self.state.lock().unwrap().fail_spawn = fail;
        }

        /// Status pipes stay blocking.
        pub fn set_fail_nonblocking(&self, fail: bool) {
            self.state.lock().unwrap().fail_nonblocking = fail;
        }

        /// Pid handed out by the next spawn. Non-positive values simulate a
        /// launcher that reports an invalid process.
        pub fn set_next_pid(&self, pid: i32) {
            self.state.lock().unwrap().next_pid = pid;
        }

        /// Argument vectors of every spawn, in order.
        pub fn spawned(&self) -> Vec<Vec<OsString>> {
            self.state.lock().unwrap().spawned.clone()
        }

        pub fn status_fds(&self) -> Vec<RawFd> {
            self.state.lock().unwrap().status_fds.clone()
        }

        pub fn signals(&self) -> Vec<(i32, ChildSignal)> {
            self.state.lock().unwrap().signals.clone()
        }

        pub fn released(&self) -> Vec<i32> {
            self.state.lock().unwrap().released.clone()
        }

        /// Write to the status pipe of `pid`.
        pub fn write_status(&self, pid: i32, mut data: &[u8]) {
            let state = self.state.lock().unwrap();
            let fd = state.writers.get(&pid).expect("Status pipe is closed");

            while !data.is_empty() {
                let n = rustix::io::write(fd, data).expect("Failed to write status pipe");
                data = &data[n..];
            }
        }

        /// Close the write end of the status pipe of `pid`.
        pub fn close_status(&self, pid: i32) {
            self.state.lock().unwrap().writers.remove(&pid);
        }

        /// Make `pid` exit with `code`. Its status pipe is closed.
        pub fn exit(&self, pid: i32, code: i32) {
            let mut state = self.state.lock().unwrap();
            state.writers.remove(&pid);
            state.exited.insert(pid, code);
        }
    }

    impl Launcher for FakeLauncher {
        fn spawn(&self, argv: &[OsString], status_fd: RawFd) -> io::Result<Spawned> {
            let mut state = self.state.lock().unwrap();
            state.spawned.push(argv.to_vec());
            state.status_fds.push(status_fd);

            if state.fail_spawn {
                return Err(io::Error::new(io::ErrorKind::NotFound, "Fake spawn failure"));
            }

            let pid = state.next_pid;
            state.next_pid += 1;

            let (reader, writer) = rustix::pipe::pipe()?;
            state.writers.insert(pid, writer);

            Ok(Spawned {
                pid,
                status: reader,
            })
        }

        fn try_wait(&self, pid: i32) -> io::Result<Option<i32>> {
            Ok(self.state.lock().unwrap().exited.get(&pid).copied())
        }

        fn set_status_nonblocking(&self, status: &OwnedFd) -> io::Result<()> {
            if self.state.lock().unwrap().fail_nonblocking {
                return Err(io::Error::from_raw_os_error(libc::ENOTTY));
            }

            rustix::io::ioctl_fionbio(status, true)?;
            Ok(())
        }

        fn signal(&self, pid: i32, signal: ChildSignal) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.signals.push((pid, signal));

            if signal == ChildSignal::Terminate {
                state.writers.remove(&pid);
                state.exited.insert(pid, 128 + libc::SIGTERM);
            }

            Ok(())
        }

        fn release(&self, pid: i32) {
            self.state.lock().unwrap().released.push(pid);
        }
    }
}

#[cfg(unix)]
#[derive(Debug, Default)]
struct DelegateState {
    progress: Vec<f64>,
    completions: Vec<ErrorCode>,
}

/// Records every callback.
#[cfg(unix)]
#[derive(Clone, Debug, Default)]
pub struct RecordingDelegate {
    state: Arc<Mutex<DelegateState>>,
}

#[cfg(unix)]
impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.state.lock().unwrap().progress.clone()
    }

    pub fn last_progress(&self) -> Option<f64> {
        self.state.lock().unwrap().progress.last().copied()
    }

    pub fn completions(&self) -> Vec<ErrorCode> {
        self.state.lock().unwrap().completions.clone()
    }
}

#[cfg(unix)]
impl PostinstallDelegate for RecordingDelegate {
    fn progress_update(&mut self, progress: f64) {
        self.state.lock().unwrap().progress.push(progress);
    }

    fn action_complete(&mut self, code: ErrorCode) {
        self.state.lock().unwrap().completions.push(code);
    }
}
