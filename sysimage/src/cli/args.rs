// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{reset, service, settings, update},
    config::Config,
};

/// Exit code when another instance already holds the service lock.
pub const EXIT_ALREADY_RUNNING: u8 = 2;

const DEFAULT_CONFIG_DIR: &str = "/etc/sysimage/config.d";

#[derive(Debug, Subcommand)]
pub enum Command {
    Update(update::UpdateCli),
    Info(update::InfoCli),
    Channels(update::ChannelsCli),
    Settings(settings::SettingsCli),
    Reset(reset::ResetCli),
    Service(service::ServiceCli),
}

#[derive(Debug, Parser)]
#[command(version, about = "Signed system-image update client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration directory.
    #[arg(short = 'C', long, global = true, default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Increase logging verbosity.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn init_logging(logging_initialized: &AtomicBool, cli: &Cli, config: &Config) {
    let directive = match cli.verbose {
        0 => config.system.loglevel.clone(),
        1 => "info".to_owned(),
        2 => "debug".to_owned(),
        _ => "trace".to_owned(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sysimage={directive}")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // Log to the configured file when there is one, otherwise to stderr.
    let logfile = config.system.logfile.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match logfile {
        Some(file) => builder
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init(),
        None => builder
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init(),
    }

    logging_initialized.store(true, Ordering::SeqCst);
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::from_dir(&cli.config_dir)
        .with_context(|| format!("Failed to load config from {:?}", cli.config_dir))?;

    init_logging(logging_initialized, &cli, &config);

    match cli.command {
        Command::Update(c) => update::update_main(&c, config, cancel_signal),
        Command::Info(c) => update::info_main(&c, config),
        Command::Channels(c) => update::channels_main(&c, config),
        Command::Settings(c) => settings::settings_main(&c, config),
        Command::Reset(c) => reset::reset_main(&c, config),
        Command::Service(c) => service::service_main(&c, config, cancel_signal),
    }
}
