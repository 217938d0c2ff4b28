// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

pub mod helper;
pub mod http;

use std::{
    collections::BTreeMap,
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

use crate::{
    config::{Config, DownloaderKind},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("HTTP request failed: {url}")]
    Http {
        url: String,
        #[source]
        source: attohttpc::Error,
    },
    #[error("Two downloads share destination {0:?} with different sources")]
    DuplicateDestination(PathBuf),
    #[error("Checksum mismatch for {path:?}: expected {expected}, got {got}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        got: String,
    },
    #[error("Download was cancelled")]
    Cancelled,
    #[error("Download helper failed: {0}")]
    Helper(String),
    #[error("Download helper is not configured")]
    HelperNotConfigured,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The current network link, as reported by the device hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkType {
    Wifi,
    Cellular,
    #[default]
    Unknown,
}

/// One file in a download batch.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Expected lowercase hex SHA-256 of the completed file, when known.
    pub checksum: Option<String>,
    /// Expected size in bytes; 0 when unknown.
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Whether downloading over a cellular link is allowed. When false and
    /// the link is cellular, the batch stays queued instead of failing.
    pub allow_gsm: bool,
    pub link: LinkType,
    /// Overall step timeout; zero disables.
    pub timeout: Duration,
    pub max_threads: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            allow_gsm: true,
            link: LinkType::Unknown,
            timeout: Duration::ZERO,
            max_threads: 4,
        }
    }
}

impl BatchOptions {
    /// Whether policy requires the batch to remain queued rather than start.
    pub fn gated(&self) -> bool {
        !self.allow_gsm && self.link == LinkType::Cellular
    }
}

/// How a batch ended, for the non-error outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Completed,
    /// Paused (or queued by GSM gating) with partial files retained.
    Paused,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Progress {
    pub received: u64,
    pub total: u64,
    pub eta_seconds: f64,
}

impl Progress {
    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            0
        } else {
            (self.received * 100 / self.total) as i32
        }
    }
}

/// An in-flight download batch. Handles are shared between the engine
/// thread (which waits on completion) and the service thread (which relays
/// pause/resume/cancel requests), hence the `&self` receivers.
pub trait DownloadHandle: Send + Sync {
    /// Stop downloading but retain partial files for a later resume.
    fn pause(&self);

    /// Continue a paused (or GSM-gated) batch.
    fn resume(&self);

    /// Stop downloading and discard partial files.
    fn cancel(&self);

    fn progress(&self) -> Progress;

    /// Block until the batch completes, pauses, or fails. Any per-file
    /// verification failure cancels the whole batch and is returned here
    /// with the failing file.
    fn wait(&self) -> Result<BatchStatus>;
}

/// A batch download backend. Both backends share these semantics: every
/// file is written to a temporary name and moved into place only after its
/// checksum matches, and cancellation is observed promptly.
pub trait Downloader: Send {
    fn enqueue(
        &self,
        requests: Vec<DownloadRequest>,
        options: &BatchOptions,
    ) -> Result<Arc<dyn DownloadHandle>>;
}

/// Validate a batch before any byte is downloaded: duplicate destinations
/// are allowed only when url and checksum are identical, in which case the
/// duplicates are collapsed into one entry. Order is otherwise preserved.
pub fn validate_batch(requests: Vec<DownloadRequest>) -> Result<Vec<DownloadRequest>> {
    let mut seen: BTreeMap<PathBuf, (String, Option<String>)> = BTreeMap::new();
    let mut result = vec![];

    for request in requests {
        if let Some((url, checksum)) = seen.get(&request.dest) {
            if *url == request.url && *checksum == request.checksum {
                continue;
            }

            return Err(Error::DuplicateDestination(request.dest));
        }

        seen.insert(
            request.dest.clone(),
            (request.url.clone(), request.checksum.clone()),
        );
        result.push(request);
    }

    Ok(result)
}

/// Environment variable overriding the configured downloader backend.
pub const BACKEND_ENV: &str = "SYSIMAGE_DOWNLOADER";

/// Select the download backend from config and environment.
pub fn select_backend(config: &Config) -> Box<dyn Downloader> {
    let kind = match env::var(BACKEND_ENV).ok().as_deref() {
        Some("internal") => DownloaderKind::Internal,
        Some("helper") => DownloaderKind::Helper,
        Some(other) => {
            warn!("Unknown {BACKEND_ENV} value {other:?}, using configured backend");
            config.system.downloader
        }
        None => config.system.downloader,
    };

    match kind {
        DownloaderKind::Internal => Box::new(http::HttpDownloader::new(config.system.timeout)),
        DownloaderKind::Helper => match &config.system.downloader_helper {
            Some(command) => Box::new(helper::HelperDownloader::new(
                command.clone(),
                config.system.timeout,
            )),
            None => {
                warn!("Helper downloader selected but not configured, using internal");
                Box::new(http::HttpDownloader::new(config.system.timeout))
            }
        },
    }
}

/// Download a single small file (metadata, keyrings) to `dest`, atomically.
/// A 404 is reported as [`Error::NotFound`] so callers can probe for
/// optional files.
pub fn fetch(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    let timeout = if timeout.is_zero() {
        Duration::from_secs(120)
    } else {
        timeout
    };

    let response = attohttpc::get(url)
        .connect_timeout(timeout.min(Duration::from_secs(30)))
        .read_timeout(timeout)
        .send()
        .map_err(|e| Error::Http {
            url: url.to_owned(),
            source: e,
        })?;

    if response.status() == attohttpc::StatusCode::NOT_FOUND {
        return Err(Error::NotFound(url.to_owned()));
    }

    let response = response.error_for_status().map_err(|e| Error::Http {
        url: url.to_owned(),
        source: e,
    })?;

    let data = response.bytes().map_err(|e| Error::Http {
        url: url.to_owned(),
        source: e,
    })?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    util::atomic_write(dest, &data)?;

    Ok(())
}
