// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config directory: {0:?}")]
    ReadDir(PathBuf, #[source] io::Error),
    #[error("Failed to read config file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("{path:?}: line {line} is neither a section nor a key/value pair")]
    Malformed { path: PathBuf, line: usize },
    #[error("{path:?}: line {line} has a key/value pair outside of a section")]
    OrphanKey { path: PathBuf, line: usize },
    #[error("No config files found in: {0:?}")]
    Empty(PathBuf),
    #[error("Missing section: [{0}]")]
    MissingSection(&'static str),
    #[error("Missing key: [{0}] {1}")]
    MissingKey(&'static str, &'static str),
    #[error("Invalid value for [{section}] {key}: {value:?}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
    #[error("Both the HTTP and HTTPS ports are disabled")]
    BothPortsDisabled,
}

type Result<T> = std::result::Result<T, Error>;

/// A network port that may be administratively disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Disabled,
    Number(u16),
}

/// Which download backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloaderKind {
    #[default]
    Internal,
    Helper,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub base: String,
    pub http_port: Port,
    pub https_port: Port,
    pub channel: String,
    /// Concrete channel that the configured channel's alias pointed at on
    /// the last completed upgrade. Used to detect a pending channel switch.
    pub channel_target: Option<String>,
    pub device: Option<String>,
    pub build_number: Option<u64>,
    pub version_detail: Option<String>,
}

impl ServiceConfig {
    fn base_for(&self, scheme: &str, port: Port, default_port: u16) -> Option<String> {
        match port {
            Port::Disabled => None,
            Port::Number(p) if p == default_port => Some(format!("{scheme}://{}", self.base)),
            Port::Number(p) => Some(format!("{scheme}://{}:{p}", self.base)),
        }
    }

    pub fn http_base(&self) -> Option<String> {
        self.base_for("http", self.http_port, 80)
    }

    pub fn https_base(&self) -> Option<String> {
        self.base_for("https", self.https_port, 443)
    }

    /// Base URL for server fetches. HTTPS is preferred; HTTP is used only
    /// when HTTPS is disabled.
    pub fn secure_base(&self) -> String {
        self.https_base()
            .or_else(|| self.http_base())
            .expect("validated at load time")
    }
}

#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub tempdir: PathBuf,
    pub logfile: Option<PathBuf>,
    pub loglevel: String,
    /// Per-step timeout. Zero disables the timeout.
    pub timeout: Duration,
    pub build_file: Option<PathBuf>,
    pub settings_db: PathBuf,
    pub downloader: DownloaderKind,
    pub downloader_helper: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct GpgConfig {
    pub archive_master: PathBuf,
    pub image_master: PathBuf,
    pub image_signing: PathBuf,
    pub device_signing: PathBuf,
}

#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    pub cache_partition: PathBuf,
    pub data_partition: PathBuf,
}

#[derive(Clone, Debug)]
pub struct HooksConfig {
    pub device: String,
    pub scorer: String,
    pub apply: String,
}

#[derive(Clone, Debug)]
pub struct DbusConfig {
    /// Idle lifetime of the service. Zero disables the idle timer.
    pub lifetime: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub dir: PathBuf,
    pub service: ServiceConfig,
    pub system: SystemConfig,
    pub gpg: GpgConfig,
    pub updater: UpdaterConfig,
    pub hooks: HooksConfig,
    pub dbus: DbusConfig,
}

impl Config {
    /// Load the merged configuration from a directory of `NN_*.ini` files.
    /// Files are merged in ascending order of their numeric prefix, with
    /// later files overriding earlier ones key by key. Dangling symlinks are
    /// skipped.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut files = vec![];

        let entries = fs::read_dir(dir).map_err(|e| Error::ReadDir(dir.to_owned(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::ReadDir(dir.to_owned(), e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(prefix) = numeric_prefix(name) else {
                continue;
            };

            let path = entry.path();
            // Symlinks pointing at nothing are silently ignored.
            if !path.exists() {
                continue;
            }

            files.push((prefix, name.to_owned(), path));
        }

        if files.is_empty() {
            return Err(Error::Empty(dir.to_owned()));
        }

        files.sort();

        let mut sections = Sections::new();
        for (_, _, path) in &files {
            let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.clone(), e))?;
            parse_into(&mut sections, path, &data)?;
        }

        Self::from_sections(dir, sections)
    }

    fn from_sections(dir: &Path, sections: Sections) -> Result<Self> {
        let service = {
            let s = section(&sections, "service")?;
            let config = ServiceConfig {
                base: required(s, "service", "base")?,
                http_port: parse_port("service", "http_port", &required(s, "service", "http_port")?)?,
                https_port: parse_port(
                    "service",
                    "https_port",
                    &required(s, "service", "https_port")?,
                )?,
                channel: required(s, "service", "channel")?,
                channel_target: optional(s, "channel_target"),
                device: optional(s, "device"),
                build_number: optional(s, "build_number")
                    .map(|v| {
                        v.parse().map_err(|_| Error::InvalidValue {
                            section: "service",
                            key: "build_number",
                            value: v,
                        })
                    })
                    .transpose()?,
                version_detail: optional(s, "version_detail"),
            };

            if config.http_port == Port::Disabled && config.https_port == Port::Disabled {
                return Err(Error::BothPortsDisabled);
            }

            config
        };

        let system = {
            let s = section(&sections, "system")?;
            SystemConfig {
                tempdir: PathBuf::from(required(s, "system", "tempdir")?),
                logfile: optional(s, "logfile").map(PathBuf::from),
                loglevel: optional(s, "loglevel").unwrap_or_else(|| "error".to_owned()),
                timeout: parse_duration("system", "timeout", &required(s, "system", "timeout")?)?,
                build_file: optional(s, "build_file").map(PathBuf::from),
                settings_db: PathBuf::from(required(s, "system", "settings_db")?),
                downloader: match optional(s, "downloader").as_deref() {
                    None | Some("internal") => DownloaderKind::Internal,
                    Some("helper") => DownloaderKind::Helper,
                    Some(other) => {
                        return Err(Error::InvalidValue {
                            section: "system",
                            key: "downloader",
                            value: other.to_owned(),
                        });
                    }
                },
                downloader_helper: optional(s, "downloader_helper").map(PathBuf::from),
            }
        };

        let gpg = {
            let s = section(&sections, "gpg")?;
            GpgConfig {
                archive_master: PathBuf::from(required(s, "gpg", "archive_master")?),
                image_master: PathBuf::from(required(s, "gpg", "image_master")?),
                image_signing: PathBuf::from(required(s, "gpg", "image_signing")?),
                device_signing: PathBuf::from(required(s, "gpg", "device_signing")?),
            }
        };

        let updater = {
            let s = section(&sections, "updater")?;
            UpdaterConfig {
                cache_partition: PathBuf::from(required(s, "updater", "cache_partition")?),
                data_partition: PathBuf::from(required(s, "updater", "data_partition")?),
            }
        };

        let hooks = {
            let s = section(&sections, "hooks")?;
            HooksConfig {
                device: required(s, "hooks", "device")?,
                scorer: required(s, "hooks", "scorer")?,
                apply: required(s, "hooks", "apply")?,
            }
        };

        let dbus = {
            let s = section(&sections, "dbus")?;
            DbusConfig {
                lifetime: parse_duration("dbus", "lifetime", &required(s, "dbus", "lifetime")?)?,
            }
        };

        Ok(Self {
            dir: dir.to_owned(),
            service,
            system,
            gpg,
            updater,
            hooks,
            dbus,
        })
    }

    /// The device's current build number: the explicit config value if set,
    /// otherwise the contents of the build file, otherwise 0.
    pub fn build_number(&self) -> u64 {
        if let Some(n) = self.service.build_number {
            return n;
        }

        if let Some(path) = &self.system.build_file {
            if let Ok(data) = fs::read_to_string(path) {
                if let Ok(n) = data.trim().parse() {
                    return n;
                }
            }
        }

        0
    }
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// The numeric prefix of a `NN_*.ini` file name, or `None` if the name does
/// not match that pattern.
fn numeric_prefix(name: &str) -> Option<u32> {
    let rest = name.strip_suffix(".ini")?;
    let (digits, tail) = rest.split_at(rest.find('_')?);

    if digits.is_empty() || !tail.starts_with('_') {
        return None;
    }

    digits.parse().ok()
}

fn parse_into(sections: &mut Sections, path: &Path, data: &str) -> Result<()> {
    let mut current: Option<String> = None;

    for (i, raw) in data.lines().enumerate() {
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_owned());
            sections.entry(name.trim().to_owned()).or_default();
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::Malformed {
                path: path.to_owned(),
                line: i + 1,
            });
        };
        let Some(section) = &current else {
            return Err(Error::OrphanKey {
                path: path.to_owned(),
                line: i + 1,
            });
        };

        sections
            .get_mut(section)
            .unwrap()
            .insert(key.trim().to_owned(), value.trim().to_owned());
    }

    Ok(())
}

fn section<'a>(sections: &'a Sections, name: &'static str) -> Result<&'a BTreeMap<String, String>> {
    sections.get(name).ok_or(Error::MissingSection(name))
}

fn required(
    section: &BTreeMap<String, String>,
    section_name: &'static str,
    key: &'static str,
) -> Result<String> {
    section
        .get(key)
        .cloned()
        .ok_or(Error::MissingKey(section_name, key))
}

fn optional(section: &BTreeMap<String, String>, key: &str) -> Option<String> {
    section.get(key).cloned()
}

fn parse_port(section: &'static str, key: &'static str, value: &str) -> Result<Port> {
    if value == "disabled" {
        return Ok(Port::Disabled);
    }

    value
        .parse()
        .map(Port::Number)
        .map_err(|_| Error::InvalidValue {
            section,
            key,
            value: value.to_owned(),
        })
}

/// Parse a duration with `w`, `d`, `h`, `m`, or `s` unit suffixes. Multiple
/// components may be concatenated (eg. `1h30m`). A bare integer is a number
/// of seconds. Values less than or equal to zero produce a zero duration,
/// which callers treat as "disabled".
pub fn parse_duration(section: &'static str, key: &'static str, value: &str) -> Result<Duration> {
    let invalid = || Error::InvalidValue {
        section,
        key,
        value: value.to_owned(),
    };

    let value = value.trim();

    // A bare (possibly negative) integer is a number of seconds.
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(Duration::from_secs(secs.max(0) as u64));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut seen = false;

    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let unit = match c {
            'w' => 7 * 24 * 3600,
            'd' => 24 * 3600,
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };

        if digits.is_empty() {
            return Err(invalid());
        }

        let n: u64 = digits.parse().map_err(|_| invalid())?;
        total = total
            .checked_add(n.checked_mul(unit).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        digits.clear();
        seen = true;
    }

    if !digits.is_empty() || !seen {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}
