// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Write `data` to `dest` atomically. The data is written to a temporary file
/// in the same directory, synced, and then renamed over the destination.
pub fn atomic_write(dest: &Path, data: &[u8]) -> io::Result<()> {
    let dir = parent_path(dest);
    let mut temp = NamedTempFile::new_in(dir)?;

    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|e| e.error)?;

    Ok(())
}

/// Like [`std::fs::remove_file`], but don't complain if the file doesn't
/// exist.
pub fn safe_remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Compute the SHA-256 digest of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Get the non-empty parent of a path. If the path has no parent in the
/// string, then `.` is returned. This does not perform any filesystem
/// operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn safe_remove_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        safe_remove(&dir.path().join("missing")).unwrap();
    }
}
