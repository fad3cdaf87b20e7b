// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Write;

use tracing::warn;

use crate::{error_code::ErrorCode, postinstall::PostinstallDelegate};

/// Progress changes smaller than this are not reported.
const PROGRESS_THRESHOLD: f64 = 0.005;

/// Reports progress and failures to recovery using its status protocol.
pub struct RecoveryStatusReporter<W: Write> {
    writer: W,
    last_progress: Option<f64>,
}

impl<W: Write> RecoveryStatusReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            last_progress: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn send(&mut self, line: &str) {
        if let Err(e) = writeln!(self.writer, "{line}").and_then(|()| self.writer.flush()) {
            warn!("Failed to write recovery status: {e}");
        }
    }
}

impl<W: Write> PostinstallDelegate for RecoveryStatusReporter<W> {
    fn progress_update(&mut self, progress: f64) {
        if let Some(last) = self.last_progress {
            if (progress - last).abs() <= PROGRESS_THRESHOLD {
                return;
            }
        }

        self.last_progress = Some(progress);
        self.send(&format!("set_progress {progress:.2}"));
    }

    fn action_complete(&mut self, code: ErrorCode) {
        if code.is_success() {
            return;
        }

        self.send(&format!(
            "ui_print Error applying update: {} ({})",
            code.code(),
            code.as_str(),
        ));
    }
}
