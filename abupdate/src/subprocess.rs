// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashMap,
    ffi::OsString,
    fs::File,
    io::{self, BufRead, BufReader},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    process::{Child, Command, Stdio},
    sync::Mutex,
    thread,
};

use rustix::{
    io::{FdFlags, fcntl_setfd},
    process::{Pid, Signal, kill_process},
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildSignal {
    Stop,
    Continue,
    Terminate,
}

impl ChildSignal {
    fn to_signal(self) -> Signal {
        match self {
            Self::Stop => Signal::STOP,
            Self::Continue => Signal::CONT,
            Self::Terminate => Signal::TERM,
        }
    }
}

/// A launched child process. `status` is the read end of the pipe that the
/// child sees as its status fd.
#[derive(Debug)]
pub struct Spawned {
    pub pid: i32,
    pub status: OwnedFd,
}

/// Launches and controls postinstall programs.
pub trait Launcher {
    /// Start `argv` with the write end of a new pipe installed as
    /// `status_fd` in the child.
    fn spawn(&self, argv: &[OsString], status_fd: RawFd) -> io::Result<Spawned>;

    /// Return the exit code if the process exited. Death by signal `n` is
    /// reported as `128 + n`.
    fn try_wait(&self, pid: i32) -> io::Result<Option<i32>>;

    /// Make the read end of a status pipe non-blocking so that it can be
    /// drained without waiting for the program.
    fn set_status_nonblocking(&self, status: &OwnedFd) -> io::Result<()> {
        rustix::io::ioctl_fionbio(status, true)?;
        Ok(())
    }

    fn signal(&self, pid: i32, signal: ChildSignal) -> io::Result<()>;

    /// Stop tracking a process that will not be waited for anymore. It is
    /// reaped in the background.
    fn release(&self, pid: i32);
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Runs real processes. stdout and stderr of the child are merged and logged.
#[derive(Debug, Default)]
pub struct SubprocessLauncher {
    children: Mutex<HashMap<i32, Child>>,
}

impl SubprocessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn log_output(name: String, reader: OwnedFd) {
        let reader = BufReader::new(File::from(reader));

        for line in reader.split(b'\n') {
            match line {
                Ok(line) => info!("{name}: {}", String::from_utf8_lossy(&line)),
                Err(e) => {
                    debug!("{name}: Stopped reading output: {e}");
                    break;
                }
            }
        }
    }
}

impl Launcher for SubprocessLauncher {
    fn spawn(&self, argv: &[OsString], status_fd: RawFd) -> io::Result<Spawned> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Empty argv"));
        };

        let (status_read, status_write) = rustix::pipe::pipe()?;
        fcntl_setfd(&status_read, FdFlags::CLOEXEC)?;
        fcntl_setfd(&status_write, FdFlags::CLOEXEC)?;

        let (output_read, output_write) = rustix::pipe::pipe()?;
        fcntl_setfd(&output_read, FdFlags::CLOEXEC)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_write.try_clone()?))
            .stderr(Stdio::from(output_write));

        let status_write_raw = status_write.as_raw_fd();

        // SAFETY: Only async-signal-safe functions are called in the child.
        unsafe {
            command.pre_exec(move || {
                if status_write_raw == status_fd {
                    // dup2() is a no-op here, so only clear FD_CLOEXEC.
                    if libc::fcntl(status_fd, libc::F_SETFD, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(status_write_raw, status_fd) < 0 {
                    return Err(io::Error::last_os_error());
                }

                Ok(())
            });
        }

        let child = command.spawn()?;
        // Close the parent's copies of the write ends so that EOF is seen once
        // the child exits.
        drop(command);
        drop(status_write);

        let pid = i32::try_from(child.id())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let name = program.to_string_lossy().into_owned();
        thread::spawn(move || Self::log_output(name, output_read));

        self.children.lock().unwrap().insert(pid, child);

        debug!("Spawned {argv:?} as pid {pid}");

        Ok(Spawned {
            pid,
            status: status_read,
        })
    }

    fn try_wait(&self, pid: i32) -> io::Result<Option<i32>> {
        let mut children = self.children.lock().unwrap();
        let child = children.get_mut(&pid).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("Unknown pid: {pid}"))
        })?;

        let Some(status) = child.try_wait()? else {
            return Ok(None);
        };

        children.remove(&pid);

        Ok(Some(exit_code(status)))
    }

    fn signal(&self, pid: i32, signal: ChildSignal) -> io::Result<()> {
        let pid = Pid::from_raw(pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid pid"))?;

        kill_process(pid, signal.to_signal())?;

        Ok(())
    }

    fn release(&self, pid: i32) {
        let Some(mut child) = self.children.lock().unwrap().remove(&pid) else {
            return;
        };

        thread::spawn(move || match child.wait() {
            Ok(status) => debug!("Released pid {pid} exited: {}", exit_code(status)),
            Err(e) => warn!("Failed to wait for released pid {pid}: {e}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, time::Duration};

    use super::*;

    fn wait(launcher: &SubprocessLauncher, pid: i32) -> i32 {
        for _ in 0..500 {
            if let Some(code) = launcher.try_wait(pid).unwrap() {
                return code;
            }
            thread::sleep(Duration::from_millis(10));
        }

        panic!("Process {pid} did not exit");
    }

    fn sh(script: &str) -> Vec<OsString> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn status_pipe() {
        let launcher = SubprocessLauncher::new();
        let spawned = launcher
            .spawn(&sh("echo global_progress 0.5 >&3; echo ignored; exit 7"), 3)
            .unwrap();

        let mut status = String::new();
        File::from(spawned.status).read_to_string(&mut status).unwrap();

        assert_eq!(status, "global_progress 0.5\n");
        assert_eq!(wait(&launcher, spawned.pid), 7);
        assert!(launcher.try_wait(spawned.pid).is_err());
    }

    #[test]
    fn terminate() {
        let launcher = SubprocessLauncher::new();
        let spawned = launcher.spawn(&sh("sleep 30"), 3).unwrap();

        launcher.signal(spawned.pid, ChildSignal::Stop).unwrap();
        launcher.signal(spawned.pid, ChildSignal::Continue).unwrap();
        launcher.signal(spawned.pid, ChildSignal::Terminate).unwrap();

        assert_eq!(wait(&launcher, spawned.pid), 128 + libc::SIGTERM);
    }

    #[test]
    fn missing_program() {
        let launcher = SubprocessLauncher::new();

        assert!(launcher.spawn(&["/nonexistent/program".into()], 3).is_err());
        assert!(launcher.spawn(&[], 3).is_err());
    }
}
