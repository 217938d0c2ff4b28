// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    index::{Image, ImageKind},
    keyring,
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Staged file is missing: {0:?}")]
    MissingFile(PathBuf),
    #[error("Staged file has no sibling signature: {0:?}")]
    MissingSignature(PathBuf),
    #[error("File has no base name: {0:?}")]
    BadPath(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The recovery command file, consumed by the boot-time recovery
/// environment.
pub const COMMAND_FILE: &str = "update_command";

/// Revision of the command file format understood by the recovery
/// environment.
const FORMAT_VERSION: u32 = 3;

/// Log files that survive the cache partition wipe.
pub const PRESERVED_FILES: &[&str] = &["log", "last_log"];

/// Flag file placed in the data partition by a production reset.
pub const PRODUCTION_RESET_FLAG: &str = ".production_reset";

/// Delete stale contents of the cache partition, preserving the recovery
/// log files.
pub fn wipe_cache(cache: &Path) -> Result<()> {
    for entry in fs::read_dir(cache)? {
        let entry = entry?;
        let name = entry.file_name();

        if PRESERVED_FILES.iter().any(|p| name == *p) {
            continue;
        }

        let path = entry.path();
        debug!("Wiping stale cache entry: {path:?}");

        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Stage a verified download for the recovery environment: wipe the cache
/// partition, install the keyrings and payload files, and atomically write
/// the recovery command file.
pub fn stage(
    config: &Config,
    winner: &[Image],
    download_dir: &Path,
    blacklist: Option<&Path>,
) -> Result<()> {
    let cache = &config.updater.cache_partition;
    let data = &config.updater.data_partition;

    fs::create_dir_all(cache)?;
    fs::create_dir_all(data)?;

    wipe_cache(cache)?;

    // The recovery environment already has the archive master; every other
    // keyring is staged next to the payload.
    let mut keyrings = vec![
        config.gpg.image_master.clone(),
        config.gpg.image_signing.clone(),
    ];
    if config.gpg.device_signing.exists() {
        keyrings.push(config.gpg.device_signing.clone());
    }

    let mut command = String::new();
    writeln!(command, "format_version {FORMAT_VERSION}").unwrap();

    for path in &keyrings {
        let name = copy_with_signature(path, cache)?;
        writeln!(command, "load_keyring {name} {name}.asc").unwrap();
    }

    // The blacklist is consulted from the data partition, not the cache.
    if let Some(blacklist) = blacklist {
        copy_with_signature(blacklist, data)?;
    }

    // Payload files, in winning-path order.
    let mut updates = vec![];
    for (image_number, image) in winner.iter().enumerate() {
        for record in &image.files {
            let file = base_name(&record.path)?;
            let signature = base_name(&record.signature)?;

            let src = download_dir.join(&file);
            let sig_src = download_dir.join(&signature);
            if !src.exists() {
                return Err(Error::MissingFile(src));
            }
            if !sig_src.exists() {
                return Err(Error::MissingSignature(src));
            }

            fs::copy(&src, cache.join(&file))?;
            fs::copy(&sig_src, cache.join(&signature))?;

            updates.push(((image_number, record.order), file, signature));
        }
    }
    updates.sort();

    // A full image requires reformatting the system partition first.
    if winner.iter().any(|i| i.kind == ImageKind::Full) {
        writeln!(command, "format system").unwrap();
    }

    writeln!(command, "mount system").unwrap();
    for (_, file, signature) in &updates {
        writeln!(command, "update {file} {signature}").unwrap();
    }
    writeln!(command, "unmount system").unwrap();

    util::atomic_write(&cache.join(COMMAND_FILE), command.as_bytes())?;

    info!("Staged {} update files in {cache:?}", updates.len());

    Ok(())
}

/// Write the command file for a factory or production reset. A production
/// reset additionally arranges for a factory wipe and leaves a flag file in
/// the data partition.
pub fn stage_reset(config: &Config, production: bool) -> Result<()> {
    let cache = &config.updater.cache_partition;
    fs::create_dir_all(cache)?;

    let mut command = String::new();
    writeln!(command, "format data").unwrap();
    if production {
        writeln!(command, "enable factory_wipe").unwrap();
    }

    util::atomic_write(&cache.join(COMMAND_FILE), command.as_bytes())?;

    if production {
        let data = &config.updater.data_partition;
        fs::create_dir_all(data)?;
        fs::write(data.join(PRODUCTION_RESET_FLAG), b"")?;
    }

    Ok(())
}

/// Copy a file and its sibling `.asc` into `dest_dir`, returning the file's
/// base name. A missing signature is a fatal staging error.
fn copy_with_signature(path: &Path, dest_dir: &Path) -> Result<String> {
    let asc = keyring::asc_path(path);

    if !path.exists() {
        return Err(Error::MissingFile(path.to_owned()));
    }
    if !asc.exists() {
        return Err(Error::MissingSignature(path.to_owned()));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::BadPath(path.display().to_string()))?
        .to_owned();

    fs::copy(path, dest_dir.join(&name))?;
    fs::copy(&asc, dest_dir.join(format!("{name}.asc")))?;

    Ok(name)
}

fn base_name(server_path: &str) -> Result<String> {
    Path::new(server_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_owned())
        .ok_or_else(|| Error::BadPath(server_path.to_owned()))
}
