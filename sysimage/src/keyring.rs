// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    crypto::{self, Verifier},
    download, util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Keyring archive not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Keyring archive has no {0} member")]
    MissingMember(&'static str),
    #[error("Keyring type mismatch; wanted: {wanted}, got: {got}")]
    TypeMismatch { wanted: &'static str, got: String },
    #[error("Keyring model mismatch; wanted: {wanted:?}, got: {got}")]
    ModelMismatch { wanted: Option<String>, got: String },
    #[error("Keyring expired at {0}: {1}")]
    Expired(DateTime<Utc>, &'static str),
    #[error("Bad signature on {0} keyring")]
    BadSignature(&'static str),
    #[error("Failed to parse keyring manifest")]
    Manifest(#[source] serde_json::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Download error")]
    Download(#[from] download::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

const MANIFEST_MEMBER: &str = "keyring.json";
const KEYS_MEMBER: &str = "keyring.pem";

/// The role a keyring plays in the trust chain. Every keyring except the
/// pre-installed archive master is signed by a strictly more authoritative
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    ArchiveMaster,
    ImageMaster,
    ImageSigning,
    DeviceSigning,
    Blacklist,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArchiveMaster => "archive-master",
            Self::ImageMaster => "image-master",
            Self::ImageSigning => "image-signing",
            Self::DeviceSigning => "device-signing",
            Self::Blacklist => "blacklist",
        }
    }

    /// Server-relative path of this keyring's archive.
    pub fn server_path(self) -> String {
        format!("gpg/{}.tar.gz", self.as_str())
    }
}

/// The JSON manifest stored inside a keyring archive.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A loaded and validated keyring.
pub struct Keyring {
    pub role: Role,
    pub path: PathBuf,
    pub keys: Vec<RsaPublicKey>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Keyring {
    /// Load a keyring archive from disk, validating the manifest type and
    /// model, and checking expiry against the wall clock. The archive master
    /// never expires.
    pub fn load(role: Role, path: &Path, device: Option<&str>) -> Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut manifest_data = None;
        let mut keys_data = None;

        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_owned());

            match name.as_deref() {
                Some(MANIFEST_MEMBER) => {
                    let mut data = String::new();
                    entry.read_to_string(&mut data)?;
                    manifest_data = Some(data);
                }
                Some(KEYS_MEMBER) => {
                    let mut data = String::new();
                    entry.read_to_string(&mut data)?;
                    keys_data = Some(data);
                }
                _ => {}
            }
        }

        let manifest_data = manifest_data.ok_or(Error::MissingMember(MANIFEST_MEMBER))?;
        let keys_data = keys_data.ok_or(Error::MissingMember(KEYS_MEMBER))?;

        let manifest: Manifest =
            serde_json::from_str(&manifest_data).map_err(Error::Manifest)?;

        if manifest.kind != role.as_str() {
            return Err(Error::TypeMismatch {
                wanted: role.as_str(),
                got: manifest.kind,
            });
        }

        if let Some(model) = &manifest.model {
            if device != Some(model.as_str()) {
                return Err(Error::ModelMismatch {
                    wanted: device.map(|d| d.to_owned()),
                    got: model.clone(),
                });
            }
        }

        let expiry = manifest
            .expiry
            .and_then(|e| DateTime::<Utc>::from_timestamp(e, 0));

        let keyring = Self {
            role,
            path: path.to_owned(),
            keys: crypto::read_pem_public_keys(&keys_data)?,
            expiry,
        };

        keyring.ensure_valid()?;

        Ok(keyring)
    }

    /// Check expiry against the wall clock. The archive master never
    /// expires.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.role == Role::ArchiveMaster {
            return Ok(());
        }

        if let Some(expiry) = self.expiry {
            if expiry < Utc::now() {
                return Err(Error::Expired(expiry, self.role.as_str()));
            }
        }

        Ok(())
    }

    pub fn fingerprints(&self) -> Result<HashSet<String>> {
        self.keys.iter().map(|k| Ok(crypto::fingerprint(k)?)).collect()
    }
}

/// Write a keyring archive (`keyring.json` + `keyring.pem` in a gzipped
/// tarball). The client only consumes keyrings, but local tooling and the
/// test suite need to produce them.
pub fn write_archive(path: &Path, manifest: &Manifest, pem_data: &str) -> Result<()> {
    let manifest_json = serde_json::to_vec(manifest).map_err(Error::Manifest)?;

    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    for (name, data) in [
        (MANIFEST_MEMBER, manifest_json.as_slice()),
        (KEYS_MEMBER, pem_data.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data)?;
    }

    builder.into_inner()?.finish()?.sync_all()?;

    Ok(())
}

/// Manages the on-disk keyrings and their renewal from the server.
pub struct KeyringStore {
    base_url: String,
    timeout: Duration,
    tempdir: PathBuf,
    archive_master_path: PathBuf,
    image_master_path: PathBuf,
    image_signing_path: PathBuf,
    device_signing_path: PathBuf,
    device: Option<String>,
}

impl KeyringStore {
    pub fn new(config: &Config, device: Option<String>) -> Self {
        Self {
            base_url: config.service.secure_base(),
            timeout: config.system.timeout,
            tempdir: config.system.tempdir.clone(),
            archive_master_path: config.gpg.archive_master.clone(),
            image_master_path: config.gpg.image_master.clone(),
            image_signing_path: config.gpg.image_signing.clone(),
            device_signing_path: config.gpg.device_signing.clone(),
            device,
        }
    }

    pub fn device_signing_path(&self) -> &Path {
        &self.device_signing_path
    }

    /// The pre-installed trust root. It is never downloaded; its absence is
    /// fatal.
    pub fn archive_master(&self) -> Result<Keyring> {
        Keyring::load(Role::ArchiveMaster, &self.archive_master_path, None)
    }

    /// Load the image master keyring, downloading a fresh copy if it is
    /// missing or expired, or if `force` is set.
    pub fn image_master(&self, force: bool) -> Result<Keyring> {
        self.cached_or_fetch(
            Role::ImageMaster,
            &self.image_master_path,
            &self.archive_master()?,
            &HashSet::new(),
            force,
        )
    }

    /// Load the image signing keyring, downloading a fresh copy if it is
    /// missing or expired, or if `force` is set.
    pub fn image_signing(
        &self,
        image_master: &Keyring,
        blacklist: &HashSet<String>,
        force: bool,
    ) -> Result<Keyring> {
        self.cached_or_fetch(
            Role::ImageSigning,
            &self.image_signing_path,
            image_master,
            blacklist,
            force,
        )
    }

    /// Load the previously fetched device signing keyring if one exists on
    /// disk. Absence is not an error.
    pub fn local_device_signing(&self) -> Result<Option<Keyring>> {
        match Keyring::load(
            Role::DeviceSigning,
            &self.device_signing_path,
            self.device.as_deref(),
        ) {
            Ok(k) => Ok(Some(k)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch the device signing keyring declared by the channel entry.
    pub fn fetch_device_signing(
        &self,
        archive_path: &str,
        signature_path: &str,
        image_signing: &Keyring,
        blacklist: &HashSet<String>,
    ) -> Result<Keyring> {
        self.fetch_and_validate(
            Role::DeviceSigning,
            archive_path,
            Some(signature_path),
            &self.device_signing_path,
            image_signing,
            blacklist,
        )
    }

    /// Probe the server for a blacklist keyring. A 404 means there is no
    /// blacklist and is not an error. The archive lands in the temporary
    /// directory; it is copied to the data partition at staging time.
    pub fn fetch_blacklist(&self, image_master: &Keyring) -> Result<Option<(Keyring, PathBuf)>> {
        let dest = self.tempdir.join("blacklist.tar.gz");

        match self.fetch_and_validate(
            Role::Blacklist,
            &Role::Blacklist.server_path(),
            None,
            &dest,
            image_master,
            &HashSet::new(),
        ) {
            Ok(keyring) => {
                info!("Found signed blacklist");
                Ok(Some((keyring, dest)))
            }
            Err(Error::Download(download::Error::NotFound(_))) => {
                info!("No blacklist found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn cached_or_fetch(
        &self,
        role: Role,
        path: &Path,
        parent: &Keyring,
        blacklist: &HashSet<String>,
        force: bool,
    ) -> Result<Keyring> {
        if !force {
            match Keyring::load(role, path, self.device.as_deref()) {
                Ok(k) => return Ok(k),
                Err(Error::NotFound(_)) => {
                    info!("No {} keyring found, downloading", role.as_str());
                }
                Err(Error::Expired(when, _)) => {
                    info!("{} keyring expired at {}, re-downloading", role.as_str(), when);
                }
                Err(e) => return Err(e),
            }
        }

        self.fetch_and_validate(role, &role.server_path(), None, path, parent, blacklist)
    }

    /// Download a keyring archive plus its detached signature, verify the
    /// signature against the parent keyring, validate the archive contents,
    /// and move both files into place.
    fn fetch_and_validate(
        &self,
        role: Role,
        archive_path: &str,
        signature_path: Option<&str>,
        dest: &Path,
        parent: &Keyring,
        blacklist: &HashSet<String>,
    ) -> Result<Keyring> {
        parent.ensure_valid()?;

        let url = join_url(&self.base_url, archive_path);
        let asc_url = match signature_path {
            Some(p) => join_url(&self.base_url, p),
            None => format!("{url}.asc"),
        };

        let temp_archive = self.tempdir.join("keyring.tar.gz");
        let temp_asc = self.tempdir.join("keyring.tar.gz.asc");

        debug!("Fetching {} keyring: {url}", role.as_str());
        download::fetch(&url, &temp_archive, self.timeout)?;
        download::fetch(&asc_url, &temp_asc, self.timeout)?;

        let verifier = Verifier::new(parent.keys.clone(), blacklist.clone())?;
        if !verifier.verify(&temp_archive, &temp_asc)? {
            util::safe_remove(&temp_archive)?;
            util::safe_remove(&temp_asc)?;
            return Err(Error::BadSignature(role.as_str()));
        }

        // Validate before moving into place so a bad archive never
        // overwrites a good one.
        Keyring::load(role, &temp_archive, self.device.as_deref())?;

        if let Some(parent_dir) = dest.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        let dest_asc = asc_path(dest);
        fs::copy(&temp_archive, dest)?;
        fs::copy(&temp_asc, &dest_asc)?;
        if temp_archive != *dest {
            util::safe_remove(&temp_archive)?;
            util::safe_remove(&temp_asc)?;
        }

        Keyring::load(role, dest, self.device.as_deref())
    }
}

/// The path of a file's sibling detached signature.
pub fn asc_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".asc");
    PathBuf::from(s)
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
