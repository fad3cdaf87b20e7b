// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! abupdate is primarily an application and not a library. The semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.

pub mod boot_control;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error_code;
pub mod fake;
pub mod format;
pub mod install_plan;
pub mod mount;
#[cfg(unix)]
pub mod postinstall;
pub mod progress;
pub mod protobuf;
#[cfg(unix)]
pub mod status;
#[cfg(unix)]
pub mod subprocess;
pub mod util;
pub mod verify;
