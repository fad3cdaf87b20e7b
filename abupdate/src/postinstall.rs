// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Runs the postinstall programs of the target partitions once they have been
//! written.
//!
//! Partitions are processed one at a time: the partition is mounted read-only,
//! its program is launched with a status pipe, and progress lines from the pipe
//! are forwarded to the delegate until the program exits. [`PostinstallRunner`]
//! is driven either by [`PostinstallRunner::run`], which polls on its own, or by
//! calling [`PostinstallRunner::on_progress_readable`] and
//! [`PostinstallRunner::on_child_exited`] from an external event loop.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, Read},
    os::fd::{AsFd, BorrowedFd},
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread,
    time::Duration,
};

use rustix::event::{PollFd, PollFlags, Timespec, poll};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    boot_control::{BootControl, Hardware, slot_name},
    config::PostinstallConfig,
    error_code::ErrorCode,
    install_plan::InstallPlan,
    mount::{self, Mounter, ScopedMount},
    progress::{LineBuffer, ProgressAggregator, clamp_fraction, parse_progress_line},
    subprocess::{ChildSignal, Launcher},
};

const READ_CHUNK_SIZE: usize = 1024;

/// Exit code of a postinstall program that requires booting from the other
/// firmware slot first.
pub const EXIT_BOOTED_FROM_FIRMWARE_B: i32 = 3;
/// Exit code of a postinstall program that cannot update read-only firmware.
pub const EXIT_FIRMWARE_RO_NOT_UPDATABLE: i32 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No postinstall program is running")]
    NoChild,
    #[error("Failed to send {0:?} to pid {1}")]
    Signal(ChildSignal, i32, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Initializing,
    MountingPartition,
    RunningPostinstall,
    MonitoringProgress,
    PartitionComplete,
    NextPartition,
    AllComplete,
    Aborted,
}

/// Receives progress and the final result of an attempt.
pub trait PostinstallDelegate {
    /// Overall progress in `[0, 1]`.
    fn progress_update(&mut self, progress: f64);

    /// Called exactly once per attempt. An attempt that is still running when
    /// the runner is dropped completes with [`ErrorCode::UserCanceled`].
    fn action_complete(&mut self, code: ErrorCode);
}

/// Requests that can be sent to a runner while [`PostinstallRunner::run`] is
/// blocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Suspend,
    Resume,
    Cancel,
}

/// Create a channel for controlling a running [`PostinstallRunner::run`].
pub fn control_channel() -> (Sender<Control>, Receiver<Control>) {
    mpsc::channel()
}

/// Map a non-zero postinstall exit code to the failure it represents.
pub fn exit_code_error(code: i32) -> ErrorCode {
    match code {
        EXIT_BOOTED_FROM_FIRMWARE_B => ErrorCode::PostinstallBootedFromFirmwareB,
        EXIT_FIRMWARE_RO_NOT_UPDATABLE => ErrorCode::PostinstallFirmwareRONotUpdatable,
        _ => ErrorCode::PostinstallRunnerError,
    }
}

struct RunningChild {
    pid: i32,
    /// Cleared once the status pipe reaches EOF or fails.
    status: Option<File>,
    /// A blocking pipe is read at most once per readiness notification.
    nonblocking: bool,
}

pub struct PostinstallRunner {
    boot_control: Arc<dyn BootControl>,
    hardware: Arc<dyn Hardware>,
    mounter: Arc<dyn Mounter>,
    launcher: Arc<dyn Launcher>,
    delegate: Box<dyn PostinstallDelegate>,
    config: PostinstallConfig,
    plan: InstallPlan,
    state: State,
    progress: ProgressAggregator,
    current_partition: usize,
    mount: Option<ScopedMount>,
    child: Option<RunningChild>,
    line_buffer: LineBuffer,
    is_suspended: bool,
    powerwash_scheduled: bool,
    result: Option<ErrorCode>,
}

impl PostinstallRunner {
    pub fn new(
        boot_control: Arc<dyn BootControl>,
        hardware: Arc<dyn Hardware>,
        mounter: Arc<dyn Mounter>,
        launcher: Arc<dyn Launcher>,
        delegate: Box<dyn PostinstallDelegate>,
        config: PostinstallConfig,
    ) -> Self {
        Self {
            boot_control,
            hardware,
            mounter,
            launcher,
            delegate,
            config,
            plan: InstallPlan::default(),
            state: State::Idle,
            progress: ProgressAggregator::default(),
            current_partition: 0,
            mount: None,
            child: None,
            line_buffer: LineBuffer::new(),
            is_suspended: false,
            powerwash_scheduled: false,
            result: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_partition(&self) -> usize {
        self.current_partition
    }

    pub fn is_suspended(&self) -> bool {
        self.is_suspended
    }

    /// The final result, once the attempt has completed.
    pub fn result(&self) -> Option<ErrorCode> {
        self.result
    }

    pub fn child_pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.pid)
    }

    /// The status pipe of the running program, while it is being watched.
    pub fn progress_fd(&self) -> Option<BorrowedFd<'_>> {
        self.child
            .as_ref()
            .and_then(|c| c.status.as_ref())
            .map(|f| f.as_fd())
    }

    /// Start an attempt. Returns once the first program was launched or the
    /// attempt already completed.
    pub fn perform(&mut self, plan: InstallPlan) {
        assert!(
            matches!(self.state, State::Idle),
            "Postinstall runner can only be used once",
        );

        self.plan = plan;
        self.state = State::Initializing;
        self.plan.log();

        let dynamic_control = self.boot_control.dynamic_partition_control();
        if dynamic_control.is_virtual_ab_enabled()
            && !self.config.recovery
            && (!self.plan.partitions.is_empty() || self.plan.switch_slot_on_reboot)
        {
            if let Err(e) = dynamic_control.map_all_partitions() {
                error!("Failed to map all partitions: {e}");
                self.complete_postinstall(ErrorCode::PostInstallMountError);
                return;
            }
        }

        if self.plan.powerwash_required {
            if let Err(e) = self.hardware.schedule_powerwash() {
                error!("Failed to schedule powerwash: {e}");
                self.complete_postinstall(ErrorCode::PostinstallPowerwashError);
                return;
            }
            self.powerwash_scheduled = true;
        }

        let run_post_install = self.plan.run_post_install;
        for partition in &mut self.plan.partitions {
            if !run_post_install && partition.postinstall_optional {
                info!("Skipping optional postinstall for {}", partition.name);
                partition.run_postinstall = false;
            }
        }

        let weights = self
            .plan
            .partitions
            .iter()
            .map(|p| u64::from(p.run_postinstall))
            .collect();
        self.progress = ProgressAggregator::new(weights);
        self.current_partition = 0;
        self.report_progress(0.0);

        self.perform_partition_postinstall();
    }

    fn perform_partition_postinstall(&mut self) {
        if self.plan.download_url.is_empty() {
            info!("Skipping postinstall because there is no download source");
            self.complete_postinstall(ErrorCode::Success);
            return;
        }

        // Partitions that don't run postinstall are still mounted to detect
        // filesystem problems before switching slots.
        while let Some(partition) = self.plan.partitions.get(self.current_partition) {
            if partition.run_postinstall {
                break;
            }

            if !partition.postinstall_path.is_empty() {
                let name = partition.name.clone();
                info!("Mounting {name} without running postinstall");

                if let Err(e) = self.mount_partition() {
                    error!("Failed to mount {name}: {e}");
                    self.complete_postinstall(e.error_code());
                    return;
                }

                mount::log_build_info(&name, &self.config.mount_dir);

                if let Some(m) = self.mount.take() {
                    if let Err(e) = m.unmount() {
                        self.complete_partition_postinstall(1, &e.to_string());
                        return;
                    }
                }
            }

            self.current_partition += 1;
            self.progress.advance();
        }

        let Some(partition) = self.plan.partitions.get(self.current_partition) else {
            self.complete_postinstall(ErrorCode::Success);
            return;
        };
        let name = partition.name.clone();

        let program = match mount::resolve_program_path(
            &self.config.mount_dir,
            &partition.postinstall_path,
        ) {
            Ok(p) => p,
            Err(e) => {
                error!("Invalid postinstall program for {name}: {e}");
                self.complete_postinstall(e.error_code());
                return;
            }
        };

        if let Err(e) = self.mount_partition() {
            error!("Failed to mount {name}: {e}");
            self.complete_postinstall(e.error_code());
            return;
        }

        mount::log_build_info(&name, &self.config.mount_dir);
        info!(
            "Format of postinstall program {program:?}: {}",
            mount::file_format(&program),
        );

        let mut argv: Vec<OsString> = vec![
            program.into_os_string(),
            self.plan.target_slot.to_string().into(),
            self.config.status_fd.to_string().into(),
        ];
        if self.plan.is_triggered_postinstall() {
            argv.push("1".into());
        }

        self.state = State::RunningPostinstall;
        info!("Running postinstall for {name}: {argv:?}");

        let spawned = match self.launcher.spawn(&argv, self.config.status_fd) {
            Ok(s) if s.pid > 0 => s,
            Ok(s) => {
                error!("Postinstall program for {name} returned invalid pid {}", s.pid);
                self.complete_partition_postinstall(1, "Postinstall didn't launch");
                return;
            }
            Err(e) => {
                error!("Failed to launch postinstall program for {name}: {e}");
                self.complete_partition_postinstall(1, "Postinstall didn't launch");
                return;
            }
        };

        // The pipe is still watched if this fails. Closing it would kill the
        // program with SIGPIPE on its first status write.
        let nonblocking = match self.launcher.set_status_nonblocking(&spawned.status) {
            Ok(()) => true,
            Err(e) => {
                warn!("Unable to set status pipe as non-blocking: {e}");
                false
            }
        };

        self.child = Some(RunningChild {
            pid: spawned.pid,
            status: Some(File::from(spawned.status)),
            nonblocking,
        });
        self.state = State::MonitoringProgress;
    }

    fn mount_partition(&mut self) -> std::result::Result<(), mount::Error> {
        self.state = State::MountingPartition;

        let partition = &self.plan.partitions[self.current_partition];
        let options = self.hardware.partition_mount_options(&partition.name);

        let scoped = ScopedMount::new(
            self.mounter.clone(),
            &partition.readonly_target_path,
            &self.config.mount_dir,
            &partition.filesystem_type,
            &options,
        )?;
        self.mount = Some(scoped);

        Ok(())
    }

    /// Read everything currently available from the status pipe.
    pub fn on_progress_readable(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let nonblocking = child.nonblocking;
        let Some(file) = child.status.as_mut() else {
            return;
        };

        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut lines = vec![];
        let mut stop_watching = false;

        loop {
            match file.read(&mut buf) {
                Ok(0) => {
                    debug!("Status pipe reached EOF");
                    stop_watching = true;
                    break;
                }
                Ok(n) => {
                    lines.extend(self.line_buffer.push(&buf[..n]));
                    if !nonblocking {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Failed to read status pipe: {e}");
                    stop_watching = true;
                    break;
                }
            }
        }

        if stop_watching {
            if let Some(child) = &mut self.child {
                child.status = None;
            }
        }

        for line in lines {
            self.process_progress_line(&line);
        }
    }

    fn process_progress_line(&mut self, line: &str) {
        match parse_progress_line(line) {
            Some(fraction) => self.report_progress(fraction),
            None => debug!("Unhandled status line: {line:?}"),
        }
    }

    fn report_progress(&mut self, fraction: f64) {
        let progress = self.progress.progress(clamp_fraction(fraction));
        self.delegate.progress_update(progress);
    }

    /// Handle the exit of a launched program. Exits of processes other than
    /// the current one are ignored.
    pub fn on_child_exited(&mut self, pid: i32, code: i32) {
        if self.child_pid() != Some(pid) {
            debug!("Ignoring exit of stale pid {pid}");
            return;
        }

        self.complete_partition_postinstall(code, &format!("Exited with status {code}"));
    }

    /// Release everything associated with the current partition.
    fn cleanup(&mut self) {
        if let Some(m) = self.mount.take() {
            if let Err(e) = m.unmount() {
                warn!("{e}");
            }
        }

        self.child = None;
        self.line_buffer.clear();
        self.is_suspended = false;
    }

    fn complete_partition_postinstall(&mut self, code: i32, message: &str) {
        self.state = State::PartitionComplete;
        self.cleanup();

        let partition = &self.plan.partitions[self.current_partition];

        if code != 0 {
            error!("Postinstall for {} failed: {message}", partition.name);

            let error_code = exit_code_error(code);

            if partition.postinstall_optional {
                warn!("Ignoring postinstall failure ({error_code}) since it is optional");
            } else {
                self.complete_postinstall(error_code);
                return;
            }
        } else {
            info!("Postinstall for {} succeeded", partition.name);
        }

        self.progress.advance();
        self.current_partition += 1;
        self.state = State::NextPartition;
        self.report_progress(0.0);

        self.perform_partition_postinstall();
    }

    fn finalize_slot_switch(&self) -> ErrorCode {
        let dynamic_control = self.boot_control.dynamic_partition_control();

        if let Err(e) = dynamic_control.finish_update(self.plan.powerwash_required) {
            error!("Failed to finish dynamic partition update: {e}");
            return ErrorCode::PostinstallRunnerError;
        }

        if let Err(e) = self.boot_control.set_active_boot_slot(self.plan.target_slot) {
            error!(
                "Failed to set slot {} as active: {e}",
                slot_name(self.plan.target_slot),
            );
            return ErrorCode::PostinstallRunnerError;
        }

        self.hardware.set_warm_reset(true);
        if let Err(e) = self.hardware.set_vbmeta_digest_for_inactive_slot(false) {
            warn!("Failed to persist vbmeta digest for inactive slot: {e}");
        }

        ErrorCode::Success
    }

    fn complete_postinstall(&mut self, code: ErrorCode) {
        if self.result.is_some() {
            return;
        }

        self.cleanup();

        let mut code = code;
        if code == ErrorCode::Success {
            if self.plan.switch_slot_on_reboot {
                code = self.finalize_slot_switch();
            } else {
                code = ErrorCode::UpdatedButNotActive;
            }
        }

        if code.is_success() {
            self.state = State::AllComplete;
            info!("All postinstall programs completed: {code}");
        } else {
            self.state = State::Aborted;
            error!("Postinstall failed: {} ({code})", code.code());

            if self.powerwash_scheduled {
                if let Err(e) = self.hardware.cancel_powerwash() {
                    warn!("Failed to cancel powerwash: {e}");
                }
                self.powerwash_scheduled = false;
            }
        }

        self.result = Some(code);
        self.delegate.action_complete(code);
    }

    /// Pause the running program with `SIGSTOP`.
    pub fn suspend(&mut self) -> Result<()> {
        let pid = self.child_pid().ok_or(Error::NoChild)?;

        self.launcher
            .signal(pid, ChildSignal::Stop)
            .map_err(|e| Error::Signal(ChildSignal::Stop, pid, e))?;
        self.is_suspended = true;

        Ok(())
    }

    /// Continue a program paused by [`Self::suspend`]. Does nothing if the
    /// program is not suspended.
    pub fn resume(&mut self) -> Result<()> {
        let pid = self.child_pid().ok_or(Error::NoChild)?;
        if !self.is_suspended {
            return Ok(());
        }

        self.launcher
            .signal(pid, ChildSignal::Continue)
            .map_err(|e| Error::Signal(ChildSignal::Continue, pid, e))?;
        self.is_suspended = false;

        Ok(())
    }

    fn kill_child(&mut self) {
        let Some(pid) = self.child_pid() else {
            return;
        };

        // A stopped process cannot handle SIGTERM.
        if self.is_suspended {
            if let Err(e) = self.resume() {
                warn!("{e}");
            }
        }

        if let Err(e) = self.launcher.signal(pid, ChildSignal::Terminate) {
            warn!("Failed to terminate pid {pid}: {e}");
        }
        self.launcher.release(pid);
    }

    /// Cancel the attempt. The running program, if any, is terminated and the
    /// attempt completes with [`ErrorCode::UserCanceled`].
    pub fn terminate(&mut self) {
        if matches!(self.state, State::Idle) || self.result.is_some() {
            return;
        }

        info!("Terminating postinstall");
        self.kill_child();
        self.cleanup();
        self.complete_postinstall(ErrorCode::UserCanceled);
    }

    /// Wait up to `timeout` for progress or for the program to exit and
    /// handle whatever happened.
    pub fn poll_once(&mut self, timeout: Duration) -> io::Result<()> {
        let Some(pid) = self.child_pid() else {
            return Ok(());
        };

        let mut readable = false;

        if let Some(fd) = self.progress_fd() {
            let mut fds = [PollFd::new(&fd, PollFlags::IN)];
            let timeout = Timespec {
                tv_sec: timeout.as_secs().try_into().unwrap_or(i64::MAX),
                tv_nsec: timeout.subsec_nanos().into(),
            };

            match poll(&mut fds, Some(&timeout)) {
                Ok(_) => readable = !fds[0].revents().is_empty(),
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            thread::sleep(timeout);
        }

        if readable {
            self.on_progress_readable();
        }

        if let Some(code) = self.launcher.try_wait(pid)? {
            self.on_child_exited(pid, code);
        }

        Ok(())
    }

    fn handle_control(&mut self, control: Control) {
        let result = match control {
            Control::Suspend => self.suspend(),
            Control::Resume => self.resume(),
            Control::Cancel => {
                self.terminate();
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Failed to handle {control:?}: {e}");
        }
    }

    /// Run the whole attempt, blocking until it completes.
    pub fn run(&mut self, plan: InstallPlan, control: &Receiver<Control>) -> ErrorCode {
        self.perform(plan);

        let mut control_open = true;

        while self.result.is_none() {
            while control_open {
                match control.try_recv() {
                    Ok(c) => self.handle_control(c),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => control_open = false,
                }
            }

            if self.result.is_some() {
                break;
            }

            if let Err(e) = self.poll_once(self.config.poll_interval()) {
                error!("Failed to monitor postinstall program: {e}");
                self.kill_child();
                self.complete_postinstall(ErrorCode::PostinstallRunnerError);
            }
        }

        self.result.unwrap_or(ErrorCode::Error)
    }
}

impl Drop for PostinstallRunner {
    fn drop(&mut self) {
        if self.result.is_none() && !matches!(self.state, State::Idle) {
            info!("Postinstall runner dropped during an attempt");
            self.terminate();
        }

        self.kill_child();
        self.cleanup();

        if !matches!(self.state, State::Idle) && !self.plan.partitions.is_empty() {
            let dynamic_control = self.boot_control.dynamic_partition_control();
            if let Err(e) = dynamic_control.unmap_all_partitions() {
                warn!("Failed to unmap partitions: {e}");
            }
        }
    }
}

