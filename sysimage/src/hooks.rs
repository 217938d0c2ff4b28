// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! Capability hooks. Each hook is selected by name in the `[hooks]` config
//! section from a fixed registry; there is no dynamic loading.

use std::{io, process::Command};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::HooksConfig,
    download::LinkType,
    scores::{self, Scorer},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown device hook: {0:?}")]
    UnknownDevice(String),
    #[error("Unknown scorer: {0:?}")]
    UnknownScorer(String),
    #[error("Unknown apply hook: {0:?}")]
    UnknownApply(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Queries about the device the engine runs on.
pub trait DeviceHook: Send {
    /// The device model name used to look up the per-device index.
    fn device_name(&self) -> Option<String>;

    /// The current network link, for GSM download gating.
    fn link_type(&self) -> LinkType {
        LinkType::Unknown
    }

    /// Battery charge percentage, for the `min_battery` download gate.
    /// `None` means unknown, which never blocks.
    fn battery_level(&self) -> Option<u8> {
        None
    }
}

/// Reads the device name from Android system properties, falling back to
/// the device-info tool.
pub struct SystemProperty;

const BATTERY_CAPACITY_FILE: &str = "/sys/class/power_supply/battery/capacity";

impl DeviceHook for SystemProperty {
    fn battery_level(&self) -> Option<u8> {
        std::fs::read_to_string(BATTERY_CAPACITY_FILE)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn device_name(&self) -> Option<String> {
        for command in [
            &["getprop", "ro.product.device"][..],
            &["device-info", "get", "name"][..],
        ] {
            let output = Command::new(command[0]).args(&command[1..]).output();

            if let Ok(output) = output {
                if output.status.success() {
                    let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
        }

        warn!("Could not determine device name from getprop or device-info");
        None
    }
}

/// Never reports a device name; the `[service]` config must provide one.
pub struct NoDevice;

impl DeviceHook for NoDevice {
    fn device_name(&self) -> Option<String> {
        None
    }
}

/// Applies the staged update.
pub trait ApplyHook: Send {
    /// Returns true when applying means the system is rebooting.
    fn apply(&self) -> io::Result<bool>;
}

/// Apply the update by rebooting into the recovery environment.
pub struct Reboot;

impl ApplyHook for Reboot {
    fn apply(&self) -> io::Result<bool> {
        info!("Rebooting into recovery");

        let status = Command::new("/sbin/reboot")
            .args(["-f", "recovery"])
            .status()?;

        if !status.success() {
            return Err(io::Error::other(format!("reboot exited with {status}")));
        }

        // This code may or may not run; we're racing the reboot.
        Ok(true)
    }
}

/// No-op apply, for dry runs and testing.
pub struct Noop;

impl ApplyHook for Noop {
    fn apply(&self) -> io::Result<bool> {
        Ok(false)
    }
}

/// The resolved hook set for this run.
pub struct Hooks {
    pub device: Box<dyn DeviceHook>,
    pub scorer: Box<dyn Scorer>,
    pub apply: Box<dyn ApplyHook>,
}

pub fn resolve(config: &HooksConfig) -> Result<Hooks> {
    let device: Box<dyn DeviceHook> = match config.device.as_str() {
        "system-property" => Box::new(SystemProperty),
        "none" => Box::new(NoDevice),
        other => return Err(Error::UnknownDevice(other.to_owned())),
    };

    let scorer =
        scores::by_name(&config.scorer).ok_or_else(|| Error::UnknownScorer(config.scorer.clone()))?;

    let apply: Box<dyn ApplyHook> = match config.apply.as_str() {
        "reboot" => Box::new(Reboot),
        "noop" => Box::new(Noop),
        other => return Err(Error::UnknownApply(other.to_owned())),
    };

    Ok(Hooks {
        device,
        scorer,
        apply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hooks_config(device: &str, scorer: &str, apply: &str) -> HooksConfig {
        HooksConfig {
            device: device.to_owned(),
            scorer: scorer.to_owned(),
            apply: apply.to_owned(),
        }
    }

    #[test]
    fn registry_lookup() {
        let hooks = resolve(&hooks_config("none", "weighted", "noop")).unwrap();

        assert_eq!(hooks.device.device_name(), None);
        assert_eq!(hooks.scorer.name(), "weighted");
        assert!(!hooks.apply.apply().unwrap());
    }

    #[test]
    fn unknown_names_rejected() {
        assert!(matches!(
            resolve(&hooks_config("bogus", "weighted", "noop")),
            Err(Error::UnknownDevice(_)),
        ));
        assert!(matches!(
            resolve(&hooks_config("none", "bogus", "noop")),
            Err(Error::UnknownScorer(_)),
        ));
        assert!(matches!(
            resolve(&hooks_config("none", "weighted", "bogus")),
            Err(Error::UnknownApply(_)),
        ));
    }
}
