// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, info};

use crate::{
    boot_control::{BootControl, HostBootControl, HostHardware, slot_name},
    cli::status,
    config::Config,
    crypto::{self, PayloadVerifier},
    error_code::ErrorCode,
    format::payload,
    install_plan::{self, InstallPlan},
    mount::SystemMounter,
    postinstall::{self, Control, PostinstallDelegate, PostinstallRunner},
    status::RecoveryStatusReporter,
    subprocess::SubprocessLauncher,
    verify,
};

/// Prints progress for interactive use.
struct ConsoleDelegate {
    last_percent: Option<u32>,
}

impl PostinstallDelegate for ConsoleDelegate {
    fn progress_update(&mut self, progress: f64) {
        let percent = (progress * 100.0).round() as u32;

        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            status!("Postinstall progress: {percent}%");
        }
    }

    fn action_complete(&mut self, code: ErrorCode) {
        status!("Postinstall finished: {code} ({})", code.code());
    }
}

fn load_verifier(cli: &PostinstallCli) -> Result<PayloadVerifier> {
    let mut keys = vec![];

    for path in &cli.cert {
        let cert = crypto::read_pem_cert_file(path)
            .with_context(|| format!("Failed to load certificate: {path:?}"))?;
        keys.push(crypto::get_public_key(&cert)?);
    }
    for path in &cli.public_key {
        keys.push(
            crypto::read_pem_public_key_file(path)
                .with_context(|| format!("Failed to load public key: {path:?}"))?,
        );
    }

    PayloadVerifier::new(keys).context("Failed to set up payload verifier")
}

fn build_plan(cli: &PostinstallCli, boot_control: &dyn BootControl) -> Result<InstallPlan> {
    let mut plan = InstallPlan::default();

    if let Some(path) = &cli.properties {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload properties: {path:?}"))?;
        let properties = install_plan::parse_properties(data.lines())
            .with_context(|| format!("Failed to parse payload properties: {path:?}"))?;
        plan.apply_properties(&properties)
            .with_context(|| format!("Invalid payload properties: {path:?}"))?;
    }

    let verifier = load_verifier(cli)?;
    let file = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to get file size: {:?}", cli.payload))?
        .len();

    let (header, data) = payload::read_metadata(BufReader::new(file), size)
        .map_err(|e| anyhow!("[{}] {e}", e.error_code()))
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.payload))?;
    let manifest = payload::verify_and_parse(
        &header,
        &data,
        cli.metadata_signature.as_deref().unwrap_or_default(),
        plan.metadata_hash.as_deref(),
        &verifier,
    )
    .map_err(|e| anyhow!("[{}] {e}", e.error_code()))
    .with_context(|| format!("Failed to verify payload metadata: {:?}", cli.payload))?;

    let download_url = cli
        .download_url
        .clone()
        .unwrap_or_else(|| format!("file://{}", cli.payload.display()));

    if let Some(partition) = &cli.partition {
        let triggered = install_plan::triggered_postinstall_plan(
            &manifest,
            partition,
            &download_url,
            boot_control,
        )
        .map_err(|e| anyhow!("[{}] {e}", e.error_code()))
        .with_context(|| format!("Failed to build postinstall plan for {partition:?}"))?;

        return Ok(triggered);
    }

    let current = boot_control.current_slot();
    if boot_control.num_slots() < 2 {
        bail!("A/B updates require at least two slots");
    }

    plan.download_url = download_url;
    plan.source_slot = current;
    plan.target_slot = (current + 1) % boot_control.num_slots();
    plan.load_partitions(&manifest.partitions, manifest.block_size(), boot_control)
        .with_context(|| format!("Failed to load partitions from {:?}", cli.payload))?;

    Ok(plan)
}

pub fn postinstall_main(cli: &PostinstallCli, config: &Config) -> Result<()> {
    let boot_control = Arc::new(HostBootControl::new(&config.device));
    let hardware = Arc::new(HostHardware::new(&config.device));

    let plan = build_plan(cli, &*boot_control)?;
    info!(
        "Running postinstall for slot {} ({} partitions)",
        slot_name(plan.target_slot),
        plan.partitions.len(),
    );

    let mut delegate: Box<dyn PostinstallDelegate> = if cli.recovery_status {
        Box::new(RecoveryStatusReporter::new(io::stdout()))
    } else {
        Box::new(ConsoleDelegate { last_percent: None })
    };

    // Partitions are not rewritten for a triggered run, so there is nothing
    // new to check.
    if cli.partition.is_none() && !cli.skip_verification {
        let mut last_percent = None;

        let result = verify::verify_partitions(&plan.partitions, |progress| {
            let percent = (progress * 100.0).round() as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                debug!("Verification progress: {percent}%");
            }
        });

        if let Err(e) = result {
            let code = e.error_code();
            delegate.action_complete(code);

            return Err(e).with_context(|| format!("[{code}] Target partitions do not match"));
        }

        status!("Verified {} target partitions", plan.partitions.len());
    }

    let (sender, receiver) = postinstall::control_channel();
    ctrlc::set_handler(move || {
        // The receiver is only gone once the runner is done.
        let _ = sender.send(Control::Cancel);
    })
    .context("Failed to set signal handler")?;

    let mut runner = PostinstallRunner::new(
        boot_control,
        hardware,
        Arc::new(SystemMounter),
        Arc::new(SubprocessLauncher::new()),
        delegate,
        config.postinstall.clone(),
    );

    let code = runner.run(plan, &receiver);
    if !code.is_success() {
        bail!("Postinstall failed: {code} ({})", code.code());
    }

    Ok(())
}

/// Run the postinstall programs from a payload's target partitions.
///
/// The payload metadata is verified before anything is mounted. Without
/// --partition, the target partitions are checked against the manifest
/// hashes, every partition is processed, and the target slot is marked active
/// on success.
#[derive(Debug, Parser)]
pub struct PostinstallCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,

    /// Trusted certificate (PEM).
    #[arg(long, value_name = "FILE", value_parser, required_unless_present = "public_key")]
    cert: Vec<PathBuf>,

    /// Trusted public key (PKCS8 PEM).
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Vec<PathBuf>,

    /// Base64-encoded raw metadata signature.
    #[arg(long, value_name = "BASE64")]
    metadata_signature: Option<String>,

    /// Path to payload properties file.
    #[arg(long, value_name = "FILE", value_parser)]
    properties: Option<PathBuf>,

    /// Only run the postinstall program of this partition.
    ///
    /// The slot is not switched afterwards.
    #[arg(long, value_name = "NAME")]
    partition: Option<String>,

    /// Source of the payload, as recorded in the install plan.
    ///
    /// An empty value skips postinstall entirely.
    #[arg(long, value_name = "URL")]
    download_url: Option<String>,

    /// Write recovery status commands to stdout.
    #[arg(long)]
    recovery_status: bool,

    /// Skip checking the target partitions against the manifest hashes.
    #[arg(long)]
    skip_verification: bool,
}
