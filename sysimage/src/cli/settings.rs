// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::{config::Config, settings::Settings};

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Print the value of a setting.
    Get { key: String },
    /// Set a setting. Invalid values for predefined keys are ignored.
    Set { key: String, value: String },
    /// Delete a setting, reverting it to its default.
    Del { key: String },
    /// Print all stored settings.
    Show,
}

/// Inspect and modify the persistent settings.
#[derive(Args, Debug)]
pub struct SettingsCli {
    #[command(subcommand)]
    command: SettingsCommand,
}

pub fn settings_main(cli: &SettingsCli, config: Config) -> Result<ExitCode> {
    let mut settings = Settings::open(&config.system.settings_db)?;

    match &cli.command {
        SettingsCommand::Get { key } => {
            println!("{}", settings.get(key)?);
        }
        SettingsCommand::Set { key, value } => {
            settings.set(key, value)?;
        }
        SettingsCommand::Del { key } => {
            settings.delete(key)?;
        }
        SettingsCommand::Show => {
            for (key, value) in settings.all()? {
                println!("{key}={value}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
