// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use memchr::memchr_iter;
use tracing::warn;

/// Prefix of the status lines that report progress.
pub const GLOBAL_PROGRESS_PREFIX: &str = "global_progress";

/// Floats longer than this are not attempted.
const MAX_FLOAT_LEN: usize = 64;

/// Longest status line that is kept. Longer lines are discarded up to the next
/// newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Clamp a fraction to `[0, 1]`. Non-finite and negative values become 0.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if !fraction.is_finite() || fraction < 0.0 {
        0.0
    } else if fraction > 1.0 {
        1.0
    } else {
        fraction
    }
}

/// Overall progress when the partition being processed has `current_weight`
/// and is `fraction` done.
pub fn weighted_progress(
    accumulated_weight: u64,
    current_weight: u64,
    fraction: f64,
    total_weight: u64,
) -> f64 {
    if total_weight == 0 {
        return 1.0;
    }

    (accumulated_weight as f64 + current_weight as f64 * clamp_fraction(fraction))
        / total_weight as f64
}

/// Tracks the weighted progress across a sequence of partitions.
#[derive(Clone, Debug, Default)]
pub struct ProgressAggregator {
    weights: Vec<u64>,
    total_weight: u64,
    accumulated_weight: u64,
    current: usize,
}

impl ProgressAggregator {
    pub fn new(weights: Vec<u64>) -> Self {
        let total_weight = weights.iter().sum();

        Self {
            weights,
            total_weight,
            accumulated_weight: 0,
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Overall progress with the current partition `fraction` done.
    pub fn progress(&self, fraction: f64) -> f64 {
        match self.weights.get(self.current) {
            Some(&weight) => {
                weighted_progress(self.accumulated_weight, weight, fraction, self.total_weight)
            }
            None => 1.0,
        }
    }

    /// Mark the current partition as done and move to the next one.
    pub fn advance(&mut self) {
        if let Some(weight) = self.weights.get(self.current) {
            self.accumulated_weight += weight;
            self.current += 1;
        }
    }
}

/// Parse a `global_progress <float>` status line. Like `sscanf`, the longest
/// valid float prefix after the keyword is used and trailing text is ignored.
/// Lines with any other keyword, without a number, or with a NaN value yield
/// [`None`].
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.strip_prefix(GLOBAL_PROGRESS_PREFIX)?.trim_start();

    let value = (1..=rest.len().min(MAX_FLOAT_LEN))
        .rev()
        .filter(|&n| rest.is_char_boundary(n))
        .find_map(|n| rest[..n].parse::<f64>().ok())?;

    if value.is_nan() { None } else { Some(value) }
}

/// Splits a byte stream into lines. A trailing partial line is kept until the
/// rest of it arrives.
#[derive(Clone, Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// The current line exceeded [`MAX_LINE_LEN`] and is being skipped.
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every line completed by it, without the
    /// trailing newline.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        for pos in memchr_iter(b'\n', data) {
            self.append(&data[start..pos]);
            if !self.overflowed {
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            }
            self.pending.clear();
            self.overflowed = false;
            start = pos + 1;
        }

        self.append(&data[start..]);

        lines
    }

    fn append(&mut self, data: &[u8]) {
        if self.overflowed {
            return;
        }

        if self.pending.len() + data.len() > MAX_LINE_LEN {
            warn!("Discarding status line longer than {MAX_LINE_LEN} bytes");
            self.pending.clear();
            self.overflowed = true;
        } else {
            self.pending.extend_from_slice(data);
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.overflowed = false;
    }
}
