// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, io, path::Path};

use sha2::{Digest, Sha256};

/// Well-known machine id locations, in priority order. First existing path
/// wins.
pub const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Read this device's unique machine id.
pub fn machine_id() -> io::Result<String> {
    machine_id_from(MACHINE_ID_FILES.iter().map(Path::new))
}

pub fn machine_id_from<'a>(paths: impl IntoIterator<Item = &'a Path>) -> io::Result<String> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(data) => return Ok(data.trim().to_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no machine id file found",
    ))
}

/// The device's phase percentage for a given channel and target build:
/// a stable hash of `machine_id ‖ channel ‖ target_build` in 0..=100.
/// Deterministic for a given input triple, so repeated checks land on the
/// same side of every image's rollout gate.
pub fn phased_percentage(machine_id: &str, channel: &str, target_build: u64) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(channel.as_bytes());
    hasher.update(target_build.to_string().as_bytes());

    let digest = hasher.finalize();
    let head = u64::from_be_bytes(digest[..8].try_into().unwrap());

    (head % 101) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = phased_percentage("cafef00d", "stable", 1234);
        let b = phased_percentage("cafef00d", "stable", 1234);

        assert_eq!(a, b);
        assert!(a <= 100);
    }

    #[test]
    fn varies_with_inputs() {
        let base = phased_percentage("cafef00d", "stable", 1234);
        let others = [
            phased_percentage("deadbeef", "stable", 1234),
            phased_percentage("cafef00d", "daily", 1234),
            phased_percentage("cafef00d", "stable", 1235),
        ];

        // A stable hash can collide, but not on every input at once.
        assert!(others.iter().any(|o| *o != base));
    }

    #[test]
    fn machine_id_first_existing_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&second, "second-id\n").unwrap();

        let id = machine_id_from([first.as_path(), second.as_path()]).unwrap();
        assert_eq!(id, "second-id");

        fs::write(&first, "first-id\n").unwrap();
        let id = machine_id_from([first.as_path(), second.as_path()]).unwrap();
        assert_eq!(id, "first-id");
    }
}
