// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use abupdate::format::payload::{ParseStatus, PayloadMetadata};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(ParseStatus::Complete(metadata)) = PayloadMetadata::parse_header(data) {
                    let _ = metadata.total_size();

                    if data.len() as u64 >= metadata.metadata_size {
                        let _ = metadata.manifest(data);
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
