// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{status, warning},
    crypto::{self, PayloadVerifier},
    format::payload::{self, PayloadMetadata},
    install_plan::{self, InstallPlan},
    protobuf::chromeos_update_engine::DeltaArchiveManifest,
};

fn open_reader(path: &Path) -> Result<(BufReader<File>, u64)> {
    let file =
        File::open(path).with_context(|| format!("Failed to open payload for reading: {path:?}"))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to get file size: {path:?}"))?
        .len();

    Ok((BufReader::new(file), size))
}

fn load_verifier(group: &KeyGroup) -> Result<PayloadVerifier> {
    let mut keys = vec![];

    for path in &group.cert {
        let cert = crypto::read_pem_cert_file(path)
            .with_context(|| format!("Failed to load certificate: {path:?}"))?;
        let key = crypto::get_public_key(&cert)
            .with_context(|| format!("Failed to get public key from certificate: {path:?}"))?;
        keys.push(key);
    }

    for path in &group.public_key {
        let key = crypto::read_pem_public_key_file(path)
            .with_context(|| format!("Failed to load public key: {path:?}"))?;
        keys.push(key);
    }

    PayloadVerifier::new(keys).context("Failed to set up payload verifier")
}

fn load_properties(path: &Path) -> Result<InstallPlan> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload properties: {path:?}"))?;
    let properties = install_plan::parse_properties(data.lines())
        .with_context(|| format!("Failed to parse payload properties: {path:?}"))?;

    let mut plan = InstallPlan::default();
    plan.apply_properties(&properties)
        .with_context(|| format!("Invalid payload properties: {path:?}"))?;

    Ok(plan)
}

fn display_metadata(header: &PayloadMetadata, manifest: &DeltaArchiveManifest) {
    println!("Major version: {}", header.major_version);
    println!("Manifest size: {}", header.manifest_size);
    println!("Metadata size: {}", header.metadata_size);
    println!("Metadata signature size: {}", header.metadata_signature_size);
    println!("Block size: {}", manifest.block_size());
    println!("Partitions:");

    for p in &manifest.partitions {
        let size = p
            .new_partition_info
            .as_ref()
            .and_then(|i| i.size)
            .unwrap_or_default();

        print!("- {}: {size} bytes", p.partition_name);
        if !p.postinstall_path().is_empty() {
            print!(
                ", postinstall={:?} run={} optional={}",
                p.postinstall_path(),
                p.run_postinstall(),
                p.postinstall_optional(),
            );
        }
        println!();
    }
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let (reader, size) = open_reader(&cli.input)?;
    let info = payload::read_payload_info(reader, size)
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.input))?;

    display_metadata(&info.header, &info.manifest);
    println!("Signatures: {}", info.signatures.signatures.len());

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli) -> Result<()> {
    let verifier = load_verifier(&cli.key)?;

    let plan = match &cli.properties {
        Some(path) => Some(load_properties(path)?),
        None => None,
    };

    let metadata_signature = match &cli.metadata_signature_file {
        Some(path) => fs::read_to_string(path)
            .map(|s| s.trim().to_owned())
            .with_context(|| format!("Failed to read metadata signature: {path:?}"))?,
        None => cli.metadata_signature.clone().unwrap_or_default(),
    };

    let (reader, size) = open_reader(&cli.input)?;
    let (header, data) = payload::read_metadata(reader, size)
        .map_err(|e| anyhow!("[{}] {e}", e.error_code()))
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.input))?;

    let expected_hash = plan.as_ref().and_then(|p| p.metadata_hash.as_deref());

    if let Some(expected_size) = plan.as_ref().and_then(|p| p.metadata_size) {
        if expected_size != header.metadata_size {
            bail!(
                "Metadata size mismatch: expected {expected_size}, actual {}",
                header.metadata_size,
            );
        }
    }

    if expected_hash.is_none() {
        warning!("No expected metadata hash. Only the signature will be checked.");
    }

    let manifest = payload::verify_and_parse(
        &header,
        &data,
        &metadata_signature,
        expected_hash,
        &verifier,
    )
    .map_err(|e| anyhow!("[{}] {e}", e.error_code()))
    .with_context(|| format!("Failed to verify payload metadata: {:?}", cli.input))?;

    status!(
        "Payload metadata is valid ({} partitions)",
        manifest.partitions.len(),
    );

    Ok(())
}

pub fn payload_main(cli: &PayloadCli) -> Result<()> {
    match &cli.command {
        PayloadCommand::Info(c) => info_subcommand(c),
        PayloadCommand::Verify(c) => verify_subcommand(c),
    }
}

#[derive(Debug, Args)]
struct KeyGroup {
    /// Trusted certificate (PEM).
    ///
    /// Can be specified multiple times.
    #[arg(long, value_name = "FILE", value_parser, required_unless_present = "public_key")]
    cert: Vec<PathBuf>,

    /// Trusted public key (PKCS8 PEM).
    ///
    /// Can be specified multiple times.
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Vec<PathBuf>,
}

/// Show the payload header and manifest summary.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify the payload metadata hash and signature.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    #[command(flatten)]
    key: KeyGroup,

    /// Base64-encoded raw metadata signature.
    ///
    /// If specified, this takes precedence over the signature embedded in the
    /// payload.
    #[arg(long, value_name = "BASE64", group = "signature")]
    metadata_signature: Option<String>,

    /// File containing the base64-encoded raw metadata signature.
    #[arg(long, value_name = "FILE", value_parser, group = "signature")]
    metadata_signature_file: Option<PathBuf>,

    /// Path to payload properties file.
    ///
    /// METADATA_HASH and METADATA_SIZE are checked against the payload.
    #[arg(long, value_name = "FILE", value_parser)]
    properties: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum PayloadCommand {
    Info(InfoCli),
    Verify(VerifyCli),
}

/// Inspect and verify OTA payloads.
#[derive(Debug, Parser)]
pub struct PayloadCli {
    #[command(subcommand)]
    command: PayloadCommand,
}
