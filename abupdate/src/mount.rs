// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{info, warn};

use crate::error_code::ErrorCode;

/// Filesystems to try when the manifest does not specify one.
pub const FALLBACK_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4", "squashfs", "erofs"];

/// Files that may contain build properties, relative to a partition root.
const BUILD_PROP_FILES: &[&str] = &["build.prop", "etc/build.prop", "system/build.prop"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Postinstall path is absolute: {0:?}")]
    AbsolutePath(String),
    #[error("Postinstall path escapes the mount directory: {0:?}")]
    PathEscapesMountDir(String),
    #[error("Device does not exist: {0:?}")]
    DeviceNotFound(PathBuf),
    #[error("Mount directory does not exist: {0:?}")]
    MountDirNotFound(PathBuf),
    #[error("Failed to set {0:?} read-only")]
    SetReadOnly(PathBuf, #[source] io::Error),
    #[error("Failed to mount {0:?} at {1:?}")]
    Mount(PathBuf, PathBuf, #[source] io::Error),
    #[error("Failed to unmount {0:?}")]
    Unmount(PathBuf, #[source] io::Error),
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::AbsolutePath(_) | Self::PathEscapesMountDir(_) => {
                ErrorCode::PostinstallInvalidPath
            }
            _ => ErrorCode::PostInstallMountError,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Filesystem operations needed to mount target partitions.
pub trait Mounter {
    fn exists(&self, path: &Path) -> bool;

    fn is_mountpoint(&self, path: &Path) -> io::Result<bool>;

    fn set_block_device_readonly(&self, device: &Path, readonly: bool) -> io::Result<()>;

    /// Mount `device` read-only. If `fs_type` is empty, each of the
    /// [`FALLBACK_FILESYSTEMS`] is tried.
    fn mount_readonly(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> io::Result<()>;

    fn unmount(&self, mount_point: &Path) -> io::Result<()>;
}

/// Resolve a postinstall program path relative to the mount directory. The
/// path must be relative and must not leave the mount directory, even
/// temporarily. No filesystem access is performed.
pub fn resolve_program_path(mount_dir: &Path, postinstall_path: &str) -> Result<PathBuf> {
    let path = Path::new(postinstall_path);
    if path.is_absolute() || path.has_root() {
        return Err(Error::AbsolutePath(postinstall_path.to_owned()));
    }

    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::PathEscapesMountDir(postinstall_path.to_owned()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::AbsolutePath(postinstall_path.to_owned()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::PathEscapesMountDir(postinstall_path.to_owned()));
    }

    let resolved = mount_dir.join(normalized);
    if !resolved.starts_with(mount_dir) {
        return Err(Error::PathEscapesMountDir(postinstall_path.to_owned()));
    }

    Ok(resolved)
}

/// A mounted filesystem that is unmounted when dropped.
pub struct ScopedMount {
    mounter: Arc<dyn Mounter>,
    mount_point: PathBuf,
    mounted: bool,
}

impl ScopedMount {
    /// Mount `device` read-only at `mount_point` after making sure that
    /// nothing else is mounted there.
    pub fn new(
        mounter: Arc<dyn Mounter>,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> Result<Self> {
        if !mounter.exists(device) {
            return Err(Error::DeviceNotFound(device.to_owned()));
        } else if !mounter.exists(mount_point) {
            return Err(Error::MountDirNotFound(mount_point.to_owned()));
        }

        ensure_unmounted(&*mounter, mount_point)?;

        mounter
            .set_block_device_readonly(device, true)
            .map_err(|e| Error::SetReadOnly(device.to_owned(), e))?;

        mounter
            .mount_readonly(device, mount_point, fs_type, options)
            .map_err(|e| Error::Mount(device.to_owned(), mount_point.to_owned(), e))?;

        info!("Mounted {device:?} at {mount_point:?}");

        Ok(Self {
            mounter,
            mount_point: mount_point.to_owned(),
            mounted: true,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount explicitly, reporting any error.
    pub fn unmount(mut self) -> Result<()> {
        self.mounted = false;

        self.mounter
            .unmount(&self.mount_point)
            .map_err(|e| Error::Unmount(self.mount_point.clone(), e))
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.mounter.unmount(&self.mount_point) {
                warn!("Failed to unmount {:?}: {e}", self.mount_point);
            }
        }
    }
}

/// Unmount whatever is mounted at `mount_point`, if anything.
pub fn ensure_unmounted(mounter: &dyn Mounter, mount_point: &Path) -> Result<()> {
    let mounted = mounter
        .is_mountpoint(mount_point)
        .map_err(|e| Error::Unmount(mount_point.to_owned(), e))?;

    if mounted {
        warn!("Found stale mount at {mount_point:?}");

        mounter
            .unmount(mount_point)
            .map_err(|e| Error::Unmount(mount_point.to_owned(), e))?;
    }

    Ok(())
}

/// Log the `ro.build*` properties of a mounted partition.
pub fn log_build_info(name: &str, root: &Path) {
    for file in BUILD_PROP_FILES {
        let Ok(data) = fs::read_to_string(root.join(file)) else {
            continue;
        };

        for line in data.lines().filter(|l| l.contains("ro.build")) {
            info!("{name}: {line}");
        }
    }
}

/// Describe the format of a file, for diagnostics.
pub fn file_format(path: &Path) -> String {
    let mut header = [0u8; 20];
    let n = match File::open(path).and_then(|mut f| read_up_to(&mut f, &mut header)) {
        Ok(n) => n,
        Err(_) => return "File not found.".to_owned(),
    };

    describe_elf(&header[..n]).unwrap_or_else(|| "data".to_owned())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

fn describe_elf(header: &[u8]) -> Option<String> {
    if header.len() < 20 || &header[..4] != b"\x7fELF" {
        return None;
    }

    let bits = match header[4] {
        1 => "32-bit",
        2 => "64-bit",
        _ => return None,
    };
    let (endian, machine) = match header[5] {
        1 => ("little-endian", u16::from_le_bytes([header[18], header[19]])),
        2 => ("big-endian", u16::from_be_bytes([header[18], header[19]])),
        _ => return None,
    };

    let mut result = format!("ELF {bits} {endian}");

    let arch = match machine {
        3 => Some("x86"),
        8 => Some("mips"),
        40 => Some("arm"),
        62 => Some("x86-64"),
        183 => Some("aarch64"),
        _ => None,
    };
    if let Some(arch) = arch {
        result.push(' ');
        result.push_str(arch);
    }

    Some(result)
}

#[cfg(target_os = "linux")]
pub use self::linux::SystemMounter;

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        ffi::CString,
        fs::{self, File},
        io,
        os::unix::{ffi::OsStrExt, fs::MetadataExt, io::AsRawFd},
        path::Path,
        thread,
        time::Duration,
    };

    use tracing::{debug, warn};

    use super::{FALLBACK_FILESYSTEMS, Mounter};

    const UNMOUNT_MAX_RETRIES: usize = 5;
    const UNMOUNT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

    // linux/fs.h: _IO(0x12, 93) and _IO(0x12, 94).
    const BLKROSET: libc::Ioctl = 0x125d;
    const BLKROGET: libc::Ioctl = 0x125e;

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn c_str(s: &str) -> io::Result<CString> {
        CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    /// Mounts filesystems with the real mount syscalls. Requires root.
    #[derive(Debug, Default)]
    pub struct SystemMounter;

    impl SystemMounter {
        fn mount_one(
            device: &CString,
            mount_point: &CString,
            fs_type: &str,
            options: &CString,
        ) -> io::Result<()> {
            let fs_type = c_str(fs_type)?;

            // SAFETY: All pointers are valid NUL-terminated strings.
            let ret = unsafe {
                libc::mount(
                    device.as_ptr(),
                    mount_point.as_ptr(),
                    fs_type.as_ptr(),
                    libc::MS_RDONLY,
                    options.as_ptr().cast(),
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }

        fn set_force_ro(device: &Path, readonly: bool) -> io::Result<()> {
            let name = device
                .canonicalize()?
                .file_name()
                .map(|n| n.to_owned())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No device name"))?;
            let path = Path::new("/sys/block").join(name).join("force_ro");

            fs::write(path, if readonly { "1" } else { "0" })
        }
    }

    impl Mounter for SystemMounter {
        fn exists(&self, path: &Path) -> bool {
            path.exists()
        }

        fn is_mountpoint(&self, path: &Path) -> io::Result<bool> {
            let metadata = fs::symlink_metadata(path)?;
            let parent = fs::symlink_metadata(path.join(".."))?;

            // A different device means something is mounted. The same inode
            // means this is the root directory.
            Ok(metadata.dev() != parent.dev() || metadata.ino() == parent.ino())
        }

        fn set_block_device_readonly(&self, device: &Path, readonly: bool) -> io::Result<()> {
            let file = File::open(device)?;
            let fd = file.as_raw_fd();

            let mut current: libc::c_int = 0;
            // SAFETY: BLKROGET writes a single int.
            let ret = unsafe { libc::ioctl(fd, BLKROGET, &mut current as *mut libc::c_int) };
            if ret == 0 && (current != 0) == readonly {
                return Ok(());
            }

            let value = libc::c_int::from(readonly);
            // SAFETY: BLKROSET reads a single int.
            let ret = unsafe { libc::ioctl(fd, BLKROSET, &value as *const libc::c_int) };
            if ret == 0 {
                return Ok(());
            }

            let e = io::Error::last_os_error();
            debug!("BLKROSET failed on {device:?}: {e}; trying force_ro");

            Self::set_force_ro(device, readonly).map_err(|_| e)
        }

        fn mount_readonly(
            &self,
            device: &Path,
            mount_point: &Path,
            fs_type: &str,
            options: &str,
        ) -> io::Result<()> {
            let device = c_path(device)?;
            let mount_point = c_path(mount_point)?;
            let options = c_str(options)?;

            if !fs_type.is_empty() {
                return Self::mount_one(&device, &mount_point, fs_type, &options);
            }

            let mut last_error = None;

            for fs_type in FALLBACK_FILESYSTEMS {
                match Self::mount_one(&device, &mount_point, fs_type, &options) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!("Failed to mount as {fs_type}: {e}");
                        last_error = Some(e);
                    }
                }
            }

            Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::Unsupported)))
        }

        fn unmount(&self, mount_point: &Path) -> io::Result<()> {
            let target = c_path(mount_point)?;

            for attempt in 0..UNMOUNT_MAX_RETRIES {
                // SAFETY: target is a valid NUL-terminated string.
                if unsafe { libc::umount2(target.as_ptr(), 0) } == 0 {
                    return Ok(());
                }

                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EBUSY) if attempt + 1 < UNMOUNT_MAX_RETRIES => {
                        thread::sleep(UNMOUNT_RETRY_INTERVAL);
                    }
                    Some(libc::EBUSY) => break,
                    Some(libc::EINVAL) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("Not a mountpoint: {mount_point:?}"),
                        ));
                    }
                    _ => return Err(e),
                }
            }

            warn!("Mount point still busy, lazily detaching: {mount_point:?}");

            // SAFETY: target is a valid NUL-terminated string.
            if unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) } < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }
}
