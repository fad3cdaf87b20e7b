// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, debug};

use crate::{
    cli::payload,
    config::{self, Config},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Message only.
    #[default]
    Short,
    /// Include timestamps, levels, and targets.
    Long,
}

pub fn init_logging(level: LogLevel, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::from(level));

    match format {
        LogFormat::Short => builder
            .without_time()
            .with_level(false)
            .with_target(false)
            .init(),
        LogFormat::Long => builder.init(),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Payload(payload::PayloadCli),
    #[cfg(target_os = "linux")]
    Postinstall(crate::cli::postinstall::PostinstallCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,

    /// Path to TOML config file.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let Some(path) = &cli.config else {
        debug!("No config file specified. Using defaults.");
        return Ok(Config::default());
    };

    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config: {path:?}"))?;

    Ok(config)
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    let config = load_config(&cli)?;

    match &cli.command {
        Command::Payload(c) => payload::payload_main(c),
        #[cfg(target_os = "linux")]
        Command::Postinstall(c) => crate::cli::postinstall::postinstall_main(c, &config),
    }
}
