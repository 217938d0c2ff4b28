// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! The update engine state machine. Every step is restartable from its
//! predecessor: all fetches are idempotent and downloads resume from
//! partial files.

use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    candidates::{self, Filter},
    channel::{self, Channels},
    config::Config,
    crypto::Verifier,
    download::{self, BatchOptions, BatchStatus, DownloadHandle, DownloadRequest, Downloader},
    hooks::Hooks,
    index::{Image, Index},
    keyring::{self, Keyring, KeyringStore},
    phase, scores, staging, util,
};

/// The engine's position in the check → download → apply sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Init,
    ConfigLoaded,
    KeyringsReady,
    ChannelsFetched,
    IndexFetched,
    PathComputed,
    NoUpdate,
    ReadyToDownload,
    Downloading,
    DownloadPaused,
    Downloaded,
    Staged,
    Applied,
    Failed,
}

/// Failure classification, which decides retry and recovery behavior at
/// step boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Network,
    Signature,
    KeyringExpired,
    Structural,
    Policy,
    Cancelled,
    Apply,
}

#[derive(Clone, Debug)]
pub struct StateError {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason(), self.message)
    }
}

impl std::error::Error for StateError {}

impl StateError {
    fn new(kind: FailureKind, error: impl fmt::Display) -> Self {
        Self {
            kind,
            message: error.to_string(),
        }
    }

    /// The short reason string surfaced in `UpdateFailed` events.
    pub fn reason(&self) -> &'static str {
        match self.kind {
            FailureKind::Config => "config",
            FailureKind::Network => "network",
            FailureKind::Signature => "signature",
            FailureKind::KeyringExpired => "keyring expired",
            FailureKind::Structural => "structural",
            FailureKind::Policy => "policy",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Apply => "apply",
        }
    }
}

type Result<T> = std::result::Result<T, StateError>;

/// Config-directory override recording which concrete channel the configured
/// alias pointed at when the last upgrade was applied. Its numeric prefix
/// puts it after the stock config files so the recorded value wins.
const CHANNEL_TARGET_FILE: &str = "99_channel.ini";

/// One-shot behavior overrides, mostly driven by CLI flags.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub build: Option<u64>,
    pub channel: Option<String>,
    pub device: Option<String>,
    pub filter: Option<Filter>,
    pub maximage: Option<u64>,
    /// Override the computed device phase percentage.
    pub percentage: Option<u8>,
    /// One-shot bypass of the GSM download gate.
    pub allow_gsm: bool,
}

/// The outcome of a completed check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub available: bool,
    /// Target build number, or 0 when no update is available.
    pub target_version: u64,
    /// Total download size in bytes.
    pub size: u64,
    /// One description map per step of the winning path.
    pub descriptions: Vec<std::collections::BTreeMap<String, String>>,
    /// Winning path versions, oldest first.
    pub versions: Vec<u64>,
    pub error_reason: String,
    /// `Some((from, to))` when this upgrade switches channels through an
    /// alias.
    pub channel_switch: Option<(String, String)>,
    /// Component version breakdown of the target build, when published.
    pub target_version_detail: Option<String>,
}

pub enum DownloadOutcome {
    Downloaded,
    Paused,
}

/// The established trust chain for one run.
struct Trust {
    store: KeyringStore,
    image_master: Keyring,
    image_signing: Keyring,
    blacklist_fps: HashSet<String>,
    /// Base URL for metadata fetches.
    base: String,
}

pub struct StateMachine {
    config: Arc<Config>,
    hooks: Hooks,
    downloader: Box<dyn Downloader>,
    overrides: Overrides,
    state: UpdateState,
    device: Option<String>,
    /// Current build for candidate calculation; squashed to 0 on the first
    /// run after a channel alias retarget.
    build: u64,
    /// Target of the resolved channel's alias, recorded into the config
    /// directory once the upgrade is applied.
    alias_target: Option<String>,
    blacklist: Option<(HashSet<String>, PathBuf)>,
    image_signing: Option<Keyring>,
    device_signing: Option<Keyring>,
    index: Option<Index>,
    winner: Vec<Image>,
    result: Option<CheckResult>,
    handle: Option<Arc<dyn DownloadHandle>>,
}

impl StateMachine {
    pub fn new(
        config: Arc<Config>,
        hooks: Hooks,
        downloader: Box<dyn Downloader>,
        overrides: Overrides,
    ) -> Self {
        Self {
            config,
            hooks,
            downloader,
            overrides,
            state: UpdateState::ConfigLoaded,
            device: None,
            build: 0,
            alias_target: None,
            blacklist: None,
            image_signing: None,
            device_signing: None,
            index: None,
            winner: vec![],
            result: None,
            handle: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn winner(&self) -> &[Image] {
        &self.winner
    }

    /// The directory verified downloads land in before staging.
    pub fn download_dir(&self) -> PathBuf {
        self.config.system.tempdir.join("files")
    }

    fn fail(&mut self, error: StateError) -> StateError {
        self.state = UpdateState::Failed;
        error
    }

    /// Run the engine through path computation. Invoking this twice without
    /// an intervening state change returns the identical cached result.
    pub fn check(&mut self) -> Result<CheckResult> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }

        match self.check_inner() {
            Ok(result) => {
                self.result = Some(result.clone());
                Ok(result)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Fetch and verify the channels file without computing a path. Used by
    /// the channel-listing front end.
    pub fn channels(&mut self) -> Result<Channels> {
        let mut trust = self.establish_trust()?;

        self.fetch_channels(&mut trust)
    }

    fn check_inner(&mut self) -> Result<CheckResult> {
        let mut trust = self.establish_trust()?;
        let channels = self.fetch_channels(&mut trust)?;
        let device = self.resolve_device()?;

        // Resolve the channel and device entry. An unknown channel or
        // device is simply "nothing to update".
        let channel_name = self
            .overrides
            .channel
            .clone()
            .unwrap_or_else(|| self.config.service.channel.clone());

        let resolved = match channels.resolve(
            &channel_name,
            &device,
            self.config.service.channel_target.as_deref(),
        ) {
            Ok(r) => r,
            Err(e @ (channel::Error::NoChannel(_) | channel::Error::NoDevice(..))) => {
                info!("No matching channel/device: {e}");
                let result = CheckResult {
                    error_reason: e.to_string(),
                    ..Default::default()
                };
                self.state = UpdateState::NoUpdate;
                return Ok(result);
            }
            Err(e) => return Err(StateError::new(FailureKind::Structural, e)),
        };

        // First run after an alias retarget: candidate calculation pretends
        // the device has nothing installed so a full path is considered.
        let channel_switch = resolved.switch.clone();
        self.alias_target = resolved.channel.alias.clone();
        self.build = match self.overrides.build {
            Some(b) => b,
            None if channel_switch.is_some() => 0,
            None => self.config.build_number(),
        };

        // The device keyring is optional; when the channel declares one, it
        // must validate against the image signing key.
        self.device_signing = match &resolved.device.keyring {
            Some(kr) => Some(
                trust
                    .store
                    .fetch_device_signing(
                        &kr.path,
                        &kr.signature,
                        &trust.image_signing,
                        &trust.blacklist_fps,
                    )
                    .map_err(classify_keyring)?,
            ),
            None => trust.store.local_device_signing().map_err(classify_keyring)?,
        };

        // Fetch and verify the per-channel, per-device index.
        let index_path = self.config.system.tempdir.join("index.json");
        let index_asc = keyring::asc_path(&index_path);

        self.fetch_with_retry(
            &keyring::join_url(&trust.base, &resolved.device.index),
            &index_path,
        )?;
        self.fetch_with_retry(
            &keyring::join_url(&trust.base, &format!("{}.asc", resolved.device.index)),
            &index_asc,
        )?;

        let verifier = self.metadata_verifier(
            &trust.image_signing,
            self.device_signing.as_ref(),
            &trust.blacklist_fps,
        )?;
        if !verifier
            .verify(&index_path, &index_asc)
            .map_err(|e| StateError::new(FailureKind::Signature, e))?
        {
            return Err(StateError::new(
                FailureKind::Signature,
                "index.json signature did not verify",
            ));
        }

        let index_data = std::fs::read_to_string(&index_path)
            .map_err(|e| StateError::new(FailureKind::Network, e))?;
        let index =
            Index::parse(&index_data).map_err(|e| StateError::new(FailureKind::Structural, e))?;

        self.state = UpdateState::IndexFetched;
        self.image_signing = Some(trust.image_signing);

        // Compute the winning path.
        let percentage = match self.overrides.percentage {
            Some(p) => p,
            None => {
                let machine_id = phase::machine_id().unwrap_or_else(|e| {
                    warn!("No machine id found ({e}); disabling phased gating");
                    String::new()
                });
                if machine_id.is_empty() {
                    0
                } else {
                    phase::phased_percentage(&machine_id, &channel_name, index.max_version())
                }
            }
        };
        debug!("Device phase percentage: {percentage}");

        let mut paths = candidates::get_candidates(&index, self.build, percentage);
        if let Some(filter) = self.overrides.filter {
            paths = candidates::apply_filter(paths, filter);
        }

        let winner = scores::choose(self.hooks.scorer.as_ref(), paths);

        let winner: Vec<Image> = match winner {
            None => vec![],
            Some(path) => {
                let capped = match self.overrides.maximage {
                    Some(cap) => candidates::version_filter(&path, cap).ok_or_else(|| {
                        StateError::new(
                            FailureKind::Structural,
                            format!("version cap {cap} removed every step of the winning path"),
                        )
                    })?,
                    None => path,
                };

                capped.into_iter().cloned().collect()
            }
        };

        self.index = Some(index);
        self.state = UpdateState::PathComputed;

        let result = if winner.is_empty() {
            info!("No update available");
            self.state = UpdateState::NoUpdate;
            CheckResult {
                channel_switch,
                ..Default::default()
            }
        } else {
            let target = winner.last().map(|i| i.version).unwrap_or(0);
            info!(
                "Upgrade path is {}",
                winner
                    .iter()
                    .map(|i| i.version.to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            );

            self.state = UpdateState::ReadyToDownload;
            CheckResult {
                available: true,
                target_version: target,
                size: winner.iter().map(|i| i.size()).sum(),
                descriptions: winner.iter().map(|i| i.descriptions.clone()).collect(),
                versions: winner.iter().map(|i| i.version).collect(),
                error_reason: String::new(),
                channel_switch,
                target_version_detail: winner.last().and_then(|i| i.version_detail.clone()),
            }
        };

        self.winner = winner;

        Ok(result)
    }

    /// Enqueue the winning path's files, returning the shared handle so the
    /// caller can relay pause/resume/cancel while waiting. Resumes the
    /// existing batch when paused. `allow_gsm` reflects the caller's policy
    /// (the "always" auto-download setting); the one-shot override flag
    /// also lifts the gate.
    pub fn start_download(
        &mut self,
        link: download::LinkType,
        allow_gsm: bool,
    ) -> Result<Arc<dyn DownloadHandle>> {
        match self.state {
            UpdateState::ReadyToDownload | UpdateState::Downloading => {}
            UpdateState::DownloadPaused => {
                if let Some(handle) = &self.handle {
                    handle.resume();
                    self.state = UpdateState::Downloading;
                    return Ok(handle.clone());
                }
            }
            other => {
                return Err(StateError::new(
                    FailureKind::Structural,
                    format!("cannot download from state {other:?}"),
                ));
            }
        }

        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let requests = self.plan_downloads()?;
        let options = BatchOptions {
            allow_gsm: allow_gsm || self.overrides.allow_gsm,
            link,
            timeout: self.config.system.timeout,
            ..Default::default()
        };

        if options.gated() {
            info!("Cellular link and GSM downloads are not allowed; batch stays queued");
        }

        let handle = self
            .downloader
            .enqueue(requests, &options)
            .map_err(classify_download)?;

        self.handle = Some(handle.clone());
        self.state = UpdateState::Downloading;

        Ok(handle)
    }

    /// Complete a download cycle: classify the batch outcome and, on
    /// success, verify every data file's detached signature. A signature
    /// failure triggers one signing-keyring re-pull and a single retry
    /// before becoming fatal.
    pub fn finish_download(
        &mut self,
        status: download::Result<BatchStatus>,
    ) -> Result<DownloadOutcome> {
        match status {
            Ok(BatchStatus::Completed) => {}
            Ok(BatchStatus::Paused) => {
                self.state = UpdateState::DownloadPaused;
                return Ok(DownloadOutcome::Paused);
            }
            Err(e) => {
                self.handle = None;
                return Err(self.fail(classify_download(e)));
            }
        }

        self.handle = None;

        match self.verify_downloads() {
            Ok(()) => {}
            Err(e) if e.kind == FailureKind::Signature => {
                info!("Downloaded file signature failed; refreshing signing keyrings");
                self.refresh_signing_keyrings()?;
                self.verify_downloads().map_err(|e| self.fail(e))?;
            }
            Err(e) => return Err(self.fail(e)),
        }

        self.state = UpdateState::Downloaded;
        info!("All files downloaded and verified");

        Ok(DownloadOutcome::Downloaded)
    }

    /// Stage the verified files and invoke the apply hook. Valid only after
    /// a completed download. Returns whether the hook initiated a reboot.
    pub fn apply(&mut self) -> Result<bool> {
        match self.state {
            UpdateState::Downloaded | UpdateState::Staged => {}
            other => {
                return Err(StateError::new(
                    FailureKind::Structural,
                    format!("cannot apply from state {other:?}"),
                ));
            }
        }

        if self.state == UpdateState::Downloaded {
            let blacklist_path = self.blacklist.as_ref().map(|(_, p)| p.clone());

            staging::stage(
                &self.config,
                &self.winner,
                &self.download_dir(),
                blacklist_path.as_deref(),
            )
            .map_err(|e| {
                let error = StateError::new(FailureKind::Structural, e);
                self.fail(error)
            })?;

            self.state = UpdateState::Staged;
        }

        // Record the alias target before handing off to the apply hook; a
        // reboot hook may never return.
        self.record_channel_target().map_err(|e| self.fail(e))?;

        let rebooting = self.hooks.apply.apply().map_err(|e| {
            let error = StateError::new(FailureKind::Apply, e);
            self.fail(error)
        })?;

        self.state = UpdateState::Applied;

        Ok(rebooting)
    }

    /// Establish the trust chain: image master, optional blacklist, image
    /// signing. A blacklist that fails verification triggers one image
    /// master re-pull in case the master rotated.
    fn establish_trust(&mut self) -> Result<Trust> {
        std::fs::create_dir_all(&self.config.system.tempdir)
            .map_err(|e| StateError::new(FailureKind::Config, e))?;

        let device = self.resolve_device()?;
        let store = KeyringStore::new(&self.config, Some(device));

        let mut image_master = store.image_master(false).map_err(classify_keyring)?;

        let blacklist = match store.fetch_blacklist(&image_master) {
            Ok(b) => b,
            Err(keyring::Error::BadSignature(_)) => {
                info!("Blacklist not signed by image master; refreshing master key");
                image_master = store.image_master(true).map_err(classify_keyring)?;
                store.fetch_blacklist(&image_master).map_err(classify_keyring)?
            }
            Err(e) => return Err(classify_keyring(e)),
        };

        let blacklist_fps = match &blacklist {
            Some((keyring, _)) => keyring.fingerprints().map_err(classify_keyring)?,
            None => HashSet::new(),
        };
        self.blacklist = blacklist.map(|(_, path)| (blacklist_fps.clone(), path));

        let image_signing = store
            .image_signing(&image_master, &blacklist_fps, false)
            .map_err(classify_keyring)?;

        self.state = UpdateState::KeyringsReady;

        Ok(Trust {
            store,
            image_master,
            image_signing,
            blacklist_fps,
            base: self.config.service.secure_base(),
        })
    }

    /// Fetch and verify channels.json. A bad signature triggers one image
    /// signing re-pull in case the signing key rotated.
    fn fetch_channels(&mut self, trust: &mut Trust) -> Result<Channels> {
        let channels_path = self.config.system.tempdir.join("channels.json");
        let channels_asc = keyring::asc_path(&channels_path);

        self.fetch_with_retry(
            &keyring::join_url(&trust.base, "channels.json"),
            &channels_path,
        )?;
        self.fetch_with_retry(
            &keyring::join_url(&trust.base, "channels.json.asc"),
            &channels_asc,
        )?;

        let mut verifier =
            self.metadata_verifier(&trust.image_signing, None, &trust.blacklist_fps)?;
        let mut verified = verifier
            .verify(&channels_path, &channels_asc)
            .map_err(|e| StateError::new(FailureKind::Signature, e))?;

        if !verified {
            info!("channels.json not properly signed; refreshing signing key");
            trust.image_signing = trust
                .store
                .image_signing(&trust.image_master, &trust.blacklist_fps, true)
                .map_err(classify_keyring)?;
            verifier = self.metadata_verifier(&trust.image_signing, None, &trust.blacklist_fps)?;
            verified = verifier
                .verify(&channels_path, &channels_asc)
                .map_err(|e| StateError::new(FailureKind::Signature, e))?;
        }
        if !verified {
            return Err(StateError::new(
                FailureKind::Signature,
                "channels.json signature did not verify",
            ));
        }

        let channels_data = std::fs::read_to_string(&channels_path)
            .map_err(|e| StateError::new(FailureKind::Network, e))?;
        let channels = Channels::parse(&channels_data)
            .map_err(|e| StateError::new(FailureKind::Structural, e))?;

        self.state = UpdateState::ChannelsFetched;

        Ok(channels)
    }

    /// Persist the concrete channel the configured alias resolved to, as a
    /// config-directory override picked up by the next run. Without this
    /// record a later alias retarget could not be told apart from an
    /// ordinary check.
    fn record_channel_target(&self) -> Result<()> {
        let Some(target) = &self.alias_target else {
            return Ok(());
        };
        if self.config.service.channel_target.as_deref() == Some(target.as_str()) {
            return Ok(());
        }

        let data = format!("[service]\nchannel_target: {target}\n");

        util::atomic_write(&self.config.dir.join(CHANNEL_TARGET_FILE), data.as_bytes())
            .map_err(|e| StateError::new(FailureKind::Structural, e))
    }

    fn resolve_device(&mut self) -> Result<String> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let device = self
            .overrides
            .device
            .clone()
            .or_else(|| self.config.service.device.clone())
            .or_else(|| self.hooks.device.device_name())
            .ok_or_else(|| {
                StateError::new(FailureKind::Config, "cannot determine device name")
            })?;

        self.device = Some(device.clone());

        Ok(device)
    }

    fn metadata_verifier(
        &self,
        image_signing: &Keyring,
        device_signing: Option<&Keyring>,
        blacklist: &HashSet<String>,
    ) -> Result<Verifier> {
        image_signing.ensure_valid().map_err(classify_keyring)?;

        let mut keys = image_signing.keys.clone();
        if let Some(ds) = device_signing {
            ds.ensure_valid().map_err(classify_keyring)?;
            keys.extend(ds.keys.iter().cloned());
        }

        Verifier::new(keys, blacklist.clone())
            .map_err(|e| StateError::new(FailureKind::Signature, e))
    }

    /// Fetch a metadata file with bounded backoff on transient network
    /// errors.
    fn fetch_with_retry(&self, url: &str, dest: &std::path::Path) -> Result<()> {
        let mut attempt = 0u32;

        loop {
            match download::fetch(url, dest, self.config.system.timeout) {
                Ok(()) => return Ok(()),
                Err(e @ download::Error::NotFound(_)) => {
                    return Err(StateError::new(FailureKind::Network, e));
                }
                Err(e) if attempt + 1 < 3 => {
                    attempt += 1;
                    warn!("Retrying fetch of {url} (attempt {attempt}): {e}");
                    thread::sleep(Duration::from_secs(1 << attempt));
                }
                Err(e) => return Err(classify_download(e)),
            }
        }
    }

    fn plan_downloads(&self) -> Result<Vec<DownloadRequest>> {
        let download_dir = self.download_dir();
        let base = self.config.service.secure_base();
        let mut requests = vec![];

        for image in &self.winner {
            for record in &image.files {
                let name = file_name(&record.path)?;
                let sig_name = file_name(&record.signature)?;

                requests.push(DownloadRequest {
                    url: keyring::join_url(&base, &record.path),
                    dest: download_dir.join(name),
                    checksum: Some(record.checksum.clone()),
                    size: record.size,
                });
                requests.push(DownloadRequest {
                    url: keyring::join_url(&base, &record.signature),
                    dest: download_dir.join(sig_name),
                    // No size or checksum is published for signature files.
                    checksum: None,
                    size: 0,
                });
            }
        }

        download::validate_batch(requests).map_err(classify_download)
    }

    fn verify_downloads(&self) -> Result<()> {
        let image_signing = self.image_signing.as_ref().ok_or_else(|| {
            StateError::new(FailureKind::Structural, "image signing keyring not loaded")
        })?;
        let blacklist = self
            .blacklist
            .as_ref()
            .map(|(fps, _)| fps.clone())
            .unwrap_or_default();

        let verifier =
            self.metadata_verifier(image_signing, self.device_signing.as_ref(), &blacklist)?;

        let download_dir = self.download_dir();
        for image in &self.winner {
            for record in &image.files {
                let data = download_dir.join(file_name(&record.path)?);
                let sig = download_dir.join(file_name(&record.signature)?);

                if !verifier
                    .verify(&data, &sig)
                    .map_err(|e| StateError::new(FailureKind::Signature, e))?
                {
                    return Err(StateError::new(
                        FailureKind::Signature,
                        format!("signature did not verify: {data:?}"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Re-pull the signing keyrings (and blacklist) after a data file
    /// signature failure, in case of a key rotation.
    fn refresh_signing_keyrings(&mut self) -> Result<()> {
        let store = KeyringStore::new(&self.config, self.device.clone());

        let image_master = store.image_master(false).map_err(classify_keyring)?;

        let blacklist = store
            .fetch_blacklist(&image_master)
            .map_err(classify_keyring)?;
        let blacklist_fps = match &blacklist {
            Some((keyring, _)) => keyring.fingerprints().map_err(classify_keyring)?,
            None => HashSet::new(),
        };
        self.blacklist = blacklist.map(|(_, path)| (blacklist_fps.clone(), path));

        self.image_signing = Some(
            store
                .image_signing(&image_master, &blacklist_fps, true)
                .map_err(classify_keyring)?,
        );

        Ok(())
    }
}

fn file_name(server_path: &str) -> Result<String> {
    std::path::Path::new(server_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_owned())
        .ok_or_else(|| {
            StateError::new(
                FailureKind::Structural,
                format!("file has no base name: {server_path:?}"),
            )
        })
}

fn classify_keyring(error: keyring::Error) -> StateError {
    let kind = match &error {
        keyring::Error::Expired(..) => FailureKind::KeyringExpired,
        keyring::Error::BadSignature(_) => FailureKind::Signature,
        keyring::Error::Download(e) => return classify_download_ref(e),
        keyring::Error::Io(_) => FailureKind::Network,
        keyring::Error::NotFound(_)
        | keyring::Error::MissingMember(_)
        | keyring::Error::TypeMismatch { .. }
        | keyring::Error::ModelMismatch { .. }
        | keyring::Error::Manifest(_)
        | keyring::Error::Crypto(_) => FailureKind::Structural,
    };

    StateError::new(kind, error)
}

fn classify_download(error: download::Error) -> StateError {
    classify_download_ref(&error)
}

fn classify_download_ref(error: &download::Error) -> StateError {
    let kind = match error {
        download::Error::NotFound(_) | download::Error::Http { .. } | download::Error::Io(_) => {
            FailureKind::Network
        }
        download::Error::DuplicateDestination(_) | download::Error::ChecksumMismatch { .. } => {
            FailureKind::Structural
        }
        download::Error::Cancelled => FailureKind::Cancelled,
        download::Error::Helper(_) | download::Error::HelperNotConfigured => FailureKind::Network,
    };

    StateError::new(kind, error)
}
