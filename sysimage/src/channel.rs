// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse channels file")]
    Parse(#[source] serde_json::Error),
    #[error("No such channel: {0}")]
    NoChannel(String),
    #[error("Channel {0} has no entry for device: {1}")]
    NoDevice(String, String),
}

type Result<T> = std::result::Result<T, Error>;

/// Server-relative paths to a device keyring archive and its detached
/// signature.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyringRef {
    pub path: String,
    pub signature: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceEntry {
    pub index: String,
    pub keyring: Option<KeyringRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub hidden: bool,
    pub alias: Option<String>,
    pub devices: BTreeMap<String, DeviceEntry>,
}

/// The parsed `channels.json` file.
#[derive(Clone, Debug, Deserialize)]
pub struct Channels(BTreeMap<String, Channel>);

/// The channel resolution for this device, including whether selecting the
/// channel amounts to a pending channel switch through an alias.
pub struct Resolved<'a> {
    pub name: &'a str,
    pub channel: &'a Channel,
    pub device: &'a DeviceEntry,
    /// `Some((from, to))` when the channel is an alias that now points at a
    /// different target than the one recorded at the last applied upgrade.
    /// The first upgrade after such a retarget must treat the current build
    /// number as 0. A device with no recorded target has not switched.
    pub switch: Option<(String, String)>,
}

impl Channels {
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(Error::Parse)
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = (&str, &Channel)> {
        self.0.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Look up the configured channel and device. Hidden channels resolve
    /// normally when named explicitly.
    pub fn resolve<'a>(
        &'a self,
        channel_name: &str,
        device_name: &str,
        recorded_target: Option<&str>,
    ) -> Result<Resolved<'a>> {
        let (name, channel) = self
            .0
            .get_key_value(channel_name)
            .ok_or_else(|| Error::NoChannel(channel_name.to_owned()))?;

        let device = channel.devices.get(device_name).ok_or_else(|| {
            Error::NoDevice(channel_name.to_owned(), device_name.to_owned())
        })?;

        // Only a *recorded* target that no longer matches the alias marks a
        // switch. Absent bookkeeping means the device has simply been
        // following the alias all along.
        let switch = match (&channel.alias, recorded_target) {
            (Some(target), Some(recorded)) if recorded != target.as_str() => {
                Some((recorded.to_owned(), target.clone()))
            }
            _ => None,
        };

        Ok(Resolved {
            name,
            channel,
            device,
            switch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNELS_JSON: &str = r#"{
        "stable": {
            "devices": {
                "frieza": {
                    "index": "/stable/frieza/index.json",
                    "keyring": {
                        "path": "/stable/frieza/device-signing.tar.gz",
                        "signature": "/stable/frieza/device-signing.tar.gz.asc"
                    }
                }
            }
        },
        "daily": {
            "alias": "rolling",
            "hidden": true,
            "devices": {
                "frieza": { "index": "/daily/frieza/index.json" }
            }
        }
    }"#;

    #[test]
    fn resolve_plain_channel() {
        let channels = Channels::parse(CHANNELS_JSON).unwrap();
        let resolved = channels.resolve("stable", "frieza", None).unwrap();

        assert_eq!(resolved.name, "stable");
        assert_eq!(resolved.device.index, "/stable/frieza/index.json");
        assert!(resolved.device.keyring.is_some());
        assert!(resolved.switch.is_none());
        assert!(!resolved.channel.hidden);
    }

    #[test]
    fn alias_retarget_detected() {
        let channels = Channels::parse(CHANNELS_JSON).unwrap();

        // Recorded target differs from the alias target: the alias was
        // retargeted since the last upgrade.
        let resolved = channels.resolve("daily", "frieza", Some("oldstyle")).unwrap();
        assert_eq!(
            resolved.switch,
            Some(("oldstyle".to_owned(), "rolling".to_owned())),
        );

        // Recorded target matches: no switch.
        let resolved = channels.resolve("daily", "frieza", Some("rolling")).unwrap();
        assert!(resolved.switch.is_none());
    }

    #[test]
    fn alias_without_recorded_target_is_not_a_switch() {
        let channels = Channels::parse(CHANNELS_JSON).unwrap();

        // Nothing recorded yet: the device has just been following the
        // alias, so the real build number must be used.
        let resolved = channels.resolve("daily", "frieza", None).unwrap();
        assert!(resolved.switch.is_none());
    }

    #[test]
    fn missing_channel_and_device() {
        let channels = Channels::parse(CHANNELS_JSON).unwrap();

        assert!(matches!(
            channels.resolve("nightly", "frieza", None),
            Err(Error::NoChannel(_)),
        ));
        assert!(matches!(
            channels.resolve("stable", "cooler", None),
            Err(Error::NoDevice(..)),
        ));
    }
}
