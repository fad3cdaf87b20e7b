// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use abupdate::{
        format::payload,
        install_plan::{self, InstallPlan},
    };
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = payload::read_payload_info(data, data.len() as u64);

                if let Ok(text) = std::str::from_utf8(data) {
                    if let Ok(properties) = install_plan::parse_properties(text.lines()) {
                        let _ = InstallPlan::default().apply_properties(&properties);
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
