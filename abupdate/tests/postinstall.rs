// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![cfg(unix)]

use std::{ffi::OsString, path::PathBuf, sync::Arc, thread, time::Duration};

use abupdate::{
    config::PostinstallConfig,
    error_code::ErrorCode,
    fake::{
        FIRST_PID, FakeBootControl, FakeHardware, FakeLauncher, FakeMounter, RecordingDelegate,
    },
    install_plan::{InstallPlan, MANIFEST_BYTES_PREFIX, Partition},
    postinstall::{self, Control, PostinstallRunner, State},
    subprocess::ChildSignal,
};

struct Harness {
    boot_control: FakeBootControl,
    hardware: FakeHardware,
    mounter: FakeMounter,
    launcher: FakeLauncher,
    delegate: RecordingDelegate,
    runner: PostinstallRunner,
}

impl Harness {
    fn new() -> Self {
        let boot_control = FakeBootControl::new();
        let hardware = FakeHardware::new();
        let mounter = FakeMounter::new();
        let launcher = FakeLauncher::new();
        let delegate = RecordingDelegate::new();

        let runner = PostinstallRunner::new(
            Arc::new(boot_control.clone()),
            Arc::new(hardware.clone()),
            Arc::new(mounter.clone()),
            Arc::new(launcher.clone()),
            Box::new(delegate.clone()),
            PostinstallConfig {
                poll_interval_ms: 10,
                ..Default::default()
            },
        );

        Self {
            boot_control,
            hardware,
            mounter,
            launcher,
            delegate,
            runner,
        }
    }

    /// Feed status output to the running program and let the runner read it.
    fn status(&mut self, pid: i32, data: &str) {
        self.launcher.write_status(pid, data.as_bytes());
        self.runner.on_progress_readable();
    }

    fn exit(&mut self, pid: i32, code: i32) {
        self.launcher.exit(pid, code);
        self.runner.on_child_exited(pid, code);
    }
}

fn partition(name: &str, postinstall_path: &str) -> Partition {
    let device = PathBuf::from(format!("/dev/block/by-name/{name}_b"));

    Partition {
        name: name.to_owned(),
        target_path: device.clone(),
        readonly_target_path: device,
        filesystem_type: "ext4".to_owned(),
        postinstall_path: postinstall_path.to_owned(),
        run_postinstall: !postinstall_path.is_empty(),
        ..Default::default()
    }
}

fn plan(partitions: Vec<Partition>) -> InstallPlan {
    InstallPlan {
        download_url: "file:///data/ota_package/payload.bin".to_owned(),
        source_slot: 0,
        target_slot: 1,
        partitions,
        ..Default::default()
    }
}

fn argv(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

#[test]
fn weighted_progress_across_partitions() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![
        partition("system", "bin/postinst"),
        partition("vendor", "bin/postinst"),
    ]));

    assert_eq!(h.runner.state(), State::MonitoringProgress);
    assert_eq!(h.runner.child_pid(), Some(FIRST_PID));

    h.status(FIRST_PID, "global_progress 0.5\n");
    assert_eq!(h.delegate.last_progress(), Some(0.25));

    h.exit(FIRST_PID, 0);
    assert_eq!(h.delegate.last_progress(), Some(0.5));
    assert_eq!(h.runner.child_pid(), Some(FIRST_PID + 1));

    h.status(FIRST_PID + 1, "global_progress 0.5\n");
    assert_eq!(h.delegate.last_progress(), Some(0.75));

    h.exit(FIRST_PID + 1, 0);

    assert_eq!(h.delegate.progress(), [0.0, 0.25, 0.5, 0.75, 1.0]);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
    assert_eq!(h.runner.state(), State::AllComplete);
    assert_eq!(h.runner.result(), Some(ErrorCode::Success));

    assert_eq!(h.boot_control.set_active_calls(), [1]);
    assert_eq!(h.boot_control.dynamic().finish_calls(), [false]);
    assert_eq!(h.hardware.warm_reset(), Some(true));
    assert_eq!(h.hardware.vbmeta_calls(), [false]);

    let mounts = h.mounter.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].device, PathBuf::from("/dev/block/by-name/system_b"));
    assert_eq!(mounts[0].mount_point, PathBuf::from("/postinstall"));
    assert_eq!(mounts[0].fs_type, "ext4");
    assert_eq!(h.mounter.unmounts().len(), 2);
    assert!(h.mounter.mounted().is_empty());
    assert!(h.mounter.is_readonly(&mounts[1].device));
}

#[test]
fn status_lines_split_across_reads() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    h.status(FIRST_PID, "global_pro");
    assert_eq!(h.delegate.progress(), [0.0]);

    h.status(FIRST_PID, "gress 0.3\nunknown line\nglobal_progress nan\nglobal_progress 2\n");
    assert_eq!(h.delegate.progress(), [0.0, 0.3, 1.0]);
}

#[test]
fn program_arguments() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![partition("system", "./bin/../bin/postinst")]));

    assert_eq!(h.launcher.spawned(), [argv(&["/postinstall/bin/postinst", "1", "3"])]);
    assert_eq!(h.launcher.status_fds(), [3]);
}

#[test]
fn triggered_postinstall_marker() {
    let mut h = Harness::new();
    h.runner.perform(InstallPlan {
        download_url: format!("{MANIFEST_BYTES_PREFIX}:file:///data/ota"),
        switch_slot_on_reboot: false,
        ..plan(vec![partition("system", "bin/postinst")])
    });

    assert_eq!(
        h.launcher.spawned(),
        [argv(&["/postinstall/bin/postinst", "1", "3", "1"])],
    );

    h.exit(FIRST_PID, 0);

    assert_eq!(h.delegate.completions(), [ErrorCode::UpdatedButNotActive]);
    assert!(h.boot_control.set_active_calls().is_empty());
}

#[test]
fn optional_failure_is_ignored() {
    let mut h = Harness::new();
    let mut optional = partition("system", "bin/postinst");
    optional.postinstall_optional = true;

    h.runner.perform(plan(vec![optional, partition("vendor", "bin/postinst")]));
    h.exit(FIRST_PID, 7);

    assert!(h.delegate.completions().is_empty());
    assert_eq!(h.delegate.last_progress(), Some(0.5));
    assert_eq!(h.launcher.spawned().len(), 2);

    h.exit(FIRST_PID + 1, 0);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
}

#[test]
fn required_failure_aborts() {
    let mut h = Harness::new();
    h.runner.perform(InstallPlan {
        powerwash_required: true,
        ..plan(vec![
            partition("system", "bin/postinst"),
            partition("vendor", "bin/postinst"),
        ])
    });
    assert!(h.hardware.is_powerwash_scheduled());

    h.exit(FIRST_PID, 7);

    assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallRunnerError]);
    assert_eq!(h.runner.state(), State::Aborted);
    assert_eq!(h.launcher.spawned().len(), 1);
    assert_eq!(h.hardware.cancel_count(), 1);
    assert!(!h.hardware.is_powerwash_scheduled());
    assert!(h.boot_control.set_active_calls().is_empty());
}

#[test]
fn firmware_exit_codes() {
    for (code, expected) in [
        (3, ErrorCode::PostinstallBootedFromFirmwareB),
        (4, ErrorCode::PostinstallFirmwareRONotUpdatable),
        (1, ErrorCode::PostinstallRunnerError),
        (128 + 9, ErrorCode::PostinstallRunnerError),
    ] {
        let mut h = Harness::new();
        h.runner.perform(plan(vec![partition("system", "bin/postinst")]));
        h.exit(FIRST_PID, code);

        assert_eq!(h.delegate.completions(), [expected]);
        assert_eq!(postinstall::exit_code_error(code), expected);
    }
}

#[test]
fn suspend_then_terminate() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    h.runner.suspend().unwrap();
    assert!(h.runner.is_suspended());

    h.runner.terminate();

    assert_eq!(
        h.launcher.signals(),
        [
            (FIRST_PID, ChildSignal::Stop),
            (FIRST_PID, ChildSignal::Continue),
            (FIRST_PID, ChildSignal::Terminate),
        ],
    );
    assert_eq!(h.launcher.released(), [FIRST_PID]);
    assert_eq!(h.delegate.completions(), [ErrorCode::UserCanceled]);
    assert_eq!(h.runner.child_pid(), None);
    assert!(h.mounter.mounted().is_empty());

    // The exit of the terminated program is not reported again.
    h.runner.on_child_exited(FIRST_PID, 128 + 15);
    h.runner.terminate();
    assert_eq!(h.delegate.completions(), [ErrorCode::UserCanceled]);
}

#[test]
fn resume_without_suspend() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    h.runner.resume().unwrap();
    assert!(h.launcher.signals().is_empty());

    h.runner.terminate();
    assert_eq!(h.launcher.signals(), [(FIRST_PID, ChildSignal::Terminate)]);
}

#[test]
fn control_without_program() {
    let mut h = Harness::new();

    assert!(h.runner.suspend().is_err());
    assert!(h.runner.resume().is_err());

    // Nothing has started, so there is nothing to report.
    h.runner.terminate();
    assert!(h.delegate.completions().is_empty());
}

#[test]
fn unsafe_program_path() {
    for path in ["../../etc/passwd", "/bin/sh", "bin/../../sh", "."] {
        let mut h = Harness::new();
        h.runner.perform(plan(vec![partition("system", path)]));

        assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallInvalidPath]);
        assert!(h.launcher.spawned().is_empty(), "{path:?} was launched");
        assert!(h.mounter.mounts().is_empty(), "{path:?} was mounted");
    }
}

#[test]
fn exit_before_status_is_read() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![
        partition("system", "bin/postinst"),
        partition("vendor", "bin/postinst"),
    ]));

    h.launcher.write_status(FIRST_PID, b"global_progress 0.5\n");
    h.exit(FIRST_PID, 0);

    // Unread status output of an exited program is discarded.
    assert_eq!(h.delegate.progress(), [0.0, 0.5]);

    h.status(FIRST_PID + 1, "global_progress 1\n");
    assert_eq!(h.delegate.last_progress(), Some(1.0));
}

#[test]
fn stale_exit_is_ignored() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    h.runner.on_child_exited(FIRST_PID + 100, 0);
    assert_eq!(h.runner.state(), State::MonitoringProgress);
    assert!(h.delegate.completions().is_empty());
}

#[test]
fn launch_failure() {
    let mut h = Harness::new();
    h.launcher.set_fail_spawn(true);
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallRunnerError]);
    assert!(h.mounter.mounted().is_empty());

    let mut h = Harness::new();
    h.launcher.set_next_pid(0);
    let mut optional = partition("system", "bin/postinst");
    optional.postinstall_optional = true;
    h.runner.perform(plan(vec![optional]));

    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
}

#[test]
fn mount_failure() {
    let mut h = Harness::new();
    h.mounter.set_fail_mount(true);
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert_eq!(h.delegate.completions(), [ErrorCode::PostInstallMountError]);
    assert!(h.launcher.spawned().is_empty());

    let mut h = Harness::new();
    h.mounter.set_missing("/dev/block/by-name/system_b");
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert_eq!(h.delegate.completions(), [ErrorCode::PostInstallMountError]);
}

#[test]
fn stale_mount_is_removed() {
    let mut h = Harness::new();
    h.mounter.set_mounted("/postinstall");
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert_eq!(h.mounter.unmounts(), [PathBuf::from("/postinstall")]);
    assert_eq!(h.mounter.mounts().len(), 1);
    assert_eq!(h.runner.state(), State::MonitoringProgress);
}

#[test]
fn skipped_partitions_are_still_mounted() {
    let mut h = Harness::new();
    let mut skipped = partition("system", "bin/postinst");
    skipped.run_postinstall = false;

    h.runner.perform(plan(vec![
        skipped,
        partition("odm", ""),
        partition("vendor", "bin/postinst"),
    ]));

    let mounts = h.mounter.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].device, PathBuf::from("/dev/block/by-name/system_b"));
    assert_eq!(mounts[1].device, PathBuf::from("/dev/block/by-name/vendor_b"));
    assert_eq!(h.launcher.spawned().len(), 1);
    assert_eq!(h.runner.current_partition(), 2);

    // Only the partition that runs its program carries weight.
    h.status(FIRST_PID, "global_progress 0.5\n");
    assert_eq!(h.delegate.last_progress(), Some(0.5));
}

#[test]
fn optional_programs_skipped_when_disabled() {
    let mut h = Harness::new();
    let mut optional = partition("system", "bin/postinst");
    optional.postinstall_optional = true;

    h.runner.perform(InstallPlan {
        run_post_install: false,
        ..plan(vec![optional])
    });

    assert!(h.launcher.spawned().is_empty());
    assert_eq!(h.mounter.mounts().len(), 1);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
}

#[test]
fn no_slot_switch() {
    let mut h = Harness::new();
    h.runner.perform(InstallPlan {
        switch_slot_on_reboot: false,
        ..plan(vec![partition("system", "bin/postinst")])
    });
    h.exit(FIRST_PID, 0);

    assert_eq!(h.delegate.completions(), [ErrorCode::UpdatedButNotActive]);
    assert!(h.boot_control.set_active_calls().is_empty());
    assert_eq!(h.hardware.cancel_count(), 0);
}

#[test]
fn empty_download_url() {
    let mut h = Harness::new();
    h.runner.perform(InstallPlan {
        download_url: String::new(),
        ..plan(vec![partition("system", "bin/postinst")])
    });

    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
    assert!(h.mounter.mounts().is_empty());
    assert!(h.launcher.spawned().is_empty());
}

#[test]
fn empty_plan() {
    let mut h = Harness::new();
    h.runner.perform(plan(vec![]));

    assert_eq!(h.delegate.progress(), [1.0]);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
    assert_eq!(h.boot_control.set_active_calls(), [1]);
}

#[test]
fn initialization_failures() {
    let mut h = Harness::new();
    h.boot_control.dynamic().set_virtual_ab(true);
    h.boot_control.dynamic().set_fail_map(true);
    h.runner.perform(InstallPlan {
        powerwash_required: true,
        ..plan(vec![partition("system", "bin/postinst")])
    });

    assert_eq!(h.delegate.completions(), [ErrorCode::PostInstallMountError]);
    assert_eq!(h.boot_control.dynamic().map_count(), 1);
    // Powerwash was never scheduled, so there is nothing to cancel.
    assert_eq!(h.hardware.schedule_count(), 0);
    assert_eq!(h.hardware.cancel_count(), 0);

    let mut h = Harness::new();
    h.hardware.set_fail_schedule(true);
    h.runner.perform(InstallPlan {
        powerwash_required: true,
        ..plan(vec![partition("system", "bin/postinst")])
    });

    assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallPowerwashError]);
    assert!(h.launcher.spawned().is_empty());
    assert_eq!(h.hardware.cancel_count(), 0);
}

#[test]
fn virtual_ab_mapping() {
    let mut h = Harness::new();
    h.boot_control.dynamic().set_virtual_ab(true);
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert_eq!(h.boot_control.dynamic().map_count(), 1);
    h.exit(FIRST_PID, 0);

    drop(h.runner);
    assert_eq!(h.boot_control.dynamic().unmap_count(), 1);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
}

fn powerwash_plan() -> InstallPlan {
    InstallPlan {
        powerwash_required: true,
        ..plan(vec![partition("system", "bin/postinst")])
    }
}

#[test]
fn finalization_failure() {
    let mut h = Harness::new();
    h.boot_control.dynamic().set_fail_finish(true);
    h.runner.perform(powerwash_plan());
    h.exit(FIRST_PID, 0);

    assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallRunnerError]);
    assert_eq!(h.boot_control.dynamic().finish_calls(), [true]);
    assert!(h.boot_control.set_active_calls().is_empty());
    assert_eq!(h.hardware.schedule_count(), 1);
    assert_eq!(h.hardware.cancel_count(), 1);
    assert!(!h.hardware.is_powerwash_scheduled());

    let mut h = Harness::new();
    h.boot_control.set_fail_set_active(true);
    h.runner.perform(powerwash_plan());
    h.exit(FIRST_PID, 0);

    assert_eq!(h.delegate.completions(), [ErrorCode::PostinstallRunnerError]);
    assert_eq!(h.hardware.cancel_count(), 1);
    assert!(!h.hardware.is_powerwash_scheduled());
}

#[test]
fn successful_powerwash_is_kept() {
    let mut h = Harness::new();
    h.runner.perform(powerwash_plan());
    h.exit(FIRST_PID, 0);

    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
    assert!(h.hardware.is_powerwash_scheduled());
    assert_eq!(h.hardware.cancel_count(), 0);
}

#[test]
fn blocking_status_pipe_is_still_read() {
    let mut h = Harness::new();
    h.launcher.set_fail_nonblocking(true);
    h.runner.perform(plan(vec![partition("system", "bin/postinst")]));

    assert!(h.runner.progress_fd().is_some());

    h.status(FIRST_PID, "global_progress 0.25\n");
    h.status(FIRST_PID, "global_progress 0.5\n");
    assert_eq!(h.delegate.progress(), [0.0, 0.25, 0.5]);
    assert!(h.runner.progress_fd().is_some());

    h.exit(FIRST_PID, 0);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
}

#[test]
fn drop_tears_down() {
    let h = Harness::new();
    let Harness {
        boot_control,
        hardware,
        mounter,
        launcher,
        delegate,
        mut runner,
        ..
    } = h;

    runner.perform(powerwash_plan());
    runner.suspend().unwrap();
    drop(runner);

    assert_eq!(
        launcher.signals(),
        [
            (FIRST_PID, ChildSignal::Stop),
            (FIRST_PID, ChildSignal::Continue),
            (FIRST_PID, ChildSignal::Terminate),
        ],
    );
    assert_eq!(launcher.released(), [FIRST_PID]);
    assert!(mounter.mounted().is_empty());
    assert_eq!(boot_control.dynamic().unmap_count(), 1);
    // The interrupted attempt still completes exactly once.
    assert_eq!(delegate.completions(), [ErrorCode::UserCanceled]);
    assert_eq!(hardware.cancel_count(), 1);
}

#[test]
fn run_until_exit() {
    let mut h = Harness::new();
    let (_sender, receiver) = postinstall::control_channel();

    let launcher = h.launcher.clone();
    let child = thread::spawn(move || {
        while launcher.spawned().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }

        launcher.write_status(FIRST_PID, b"global_progress 0.5\n");
        thread::sleep(Duration::from_millis(50));
        launcher.exit(FIRST_PID, 0);
    });

    let code = h
        .runner
        .run(plan(vec![partition("system", "bin/postinst")]), &receiver);
    child.join().unwrap();

    assert_eq!(code, ErrorCode::Success);
    assert_eq!(h.delegate.completions(), [ErrorCode::Success]);
    assert_eq!(h.delegate.progress().first(), Some(&0.0));
    assert_eq!(h.delegate.last_progress(), Some(1.0));
}

#[test]
fn run_cancelled() {
    let mut h = Harness::new();
    let (sender, receiver) = postinstall::control_channel();
    sender.send(Control::Suspend).unwrap();
    sender.send(Control::Cancel).unwrap();

    let code = h
        .runner
        .run(plan(vec![partition("system", "bin/postinst")]), &receiver);

    assert_eq!(code, ErrorCode::UserCanceled);
    assert_eq!(
        h.launcher.signals(),
        [
            (FIRST_PID, ChildSignal::Stop),
            (FIRST_PID, ChildSignal::Continue),
            (FIRST_PID, ChildSignal::Terminate),
        ],
    );
}
