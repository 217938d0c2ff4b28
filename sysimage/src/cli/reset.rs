// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;

use crate::{cli::status, config::Config, hooks, staging};

/// Wipe the data partition via the recovery environment.
#[derive(Args, Debug)]
pub struct ResetCli {
    /// Additionally arrange a factory wipe and leave the production reset
    /// flag, for devices headed back to stock.
    #[arg(long)]
    production: bool,
}

pub fn reset_main(cli: &ResetCli, config: Config) -> Result<ExitCode> {
    staging::stage_reset(&config, cli.production).context("Could not stage the reset")?;

    if cli.production {
        status!("Performing a production factory reset");
    } else {
        status!("Performing a factory reset");
    }

    let hooks = hooks::resolve(&config.hooks)?;
    hooks.apply.apply().context("Could not apply the reset")?;

    Ok(ExitCode::SUCCESS)
}
