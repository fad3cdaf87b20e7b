// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt::Write;

use tracing::error;

const HEX_DUMP_WIDTH: usize = 16;

/// Format a byte array as hex dump lines, 16 bytes per line, each prefixed by
/// its offset.
pub fn hex_dump_lines(data: &[u8]) -> Vec<String> {
    data.chunks(HEX_DUMP_WIDTH)
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!("0x{:08x} : ", i * HEX_DUMP_WIDTH);
            for b in chunk {
                let _ = write!(line, "{b:02x} ");
            }
            line
        })
        .collect()
}

/// Log a byte array as a hex dump at the error level.
pub fn log_hex_dump(data: &[u8]) {
    error!("Logging array of length: {}", data.len());

    for line in hex_dump_lines(data) {
        error!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_format() {
        let data = (0u8..20).collect::<Vec<_>>();
        let lines = hex_dump_lines(&data);

        assert_eq!(
            lines,
            [
                "0x00000000 : 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f ",
                "0x00000010 : 10 11 12 13 ",
            ],
        );
        assert!(hex_dump_lines(&[]).is_empty());
    }
}
