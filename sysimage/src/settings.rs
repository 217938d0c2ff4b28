// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Settings database error")]
    Sqlite(#[from] rusqlite::Error),
}

type Result<T> = std::result::Result<T, Error>;

const SCHEMA_VERSION: &str = "1";

pub const KEY_MIN_BATTERY: &str = "min_battery";
pub const KEY_AUTO_DOWNLOAD: &str = "auto_download";
pub const KEY_FAILURES_BEFORE_WARNING: &str = "failures_before_warning";

/// Reserved internal key recording when the last successful check completed.
pub const KEY_LAST_CHECK_DATE: &str = "__last_check_date__";

/// The result of a write. Only writes that change the stored value warrant
/// a `SettingChanged` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    Changed,
    Unchanged,
    /// The value was invalid for a predefined key and was not stored.
    Ignored,
}

/// A small persistent key/value store for runtime-modifiable preferences.
pub struct Settings {
    conn: Connection,
}

impl Settings {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT)",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO settings VALUES ('__version__', ?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(Self { conn })
    }

    /// The default value for a key when nothing is stored.
    pub fn default_for(key: &str) -> &'static str {
        match key {
            // Wifi-only automatic downloads.
            KEY_AUTO_DOWNLOAD => "1",
            _ => "",
        }
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(stored.unwrap_or_else(|| Self::default_for(key).to_owned()))
    }

    /// Store a value. Predefined keys have their values validated; invalid
    /// values are ignored, not stored. Keys beginning with `_` are
    /// user-reserved and pass through untouched.
    pub fn set(&mut self, key: &str, value: &str) -> Result<SetOutcome> {
        if !key.starts_with('_') && !validate(key, value) {
            debug!("Ignoring invalid value for {key}: {value:?}");
            return Ok(SetOutcome::Ignored);
        }

        let old = self.get(key)?;

        self.conn.execute(
            "INSERT INTO settings VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;

        if old == value {
            Ok(SetOutcome::Unchanged)
        } else {
            Ok(SetOutcome::Changed)
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;

        Ok(())
    }

    /// All stored key/value pairs, minus internal bookkeeping rows.
    pub fn all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;

        Ok(rows
            .into_iter()
            .filter(|(k, _)| !k.starts_with("__"))
            .collect())
    }
}

fn validate(key: &str, value: &str) -> bool {
    match key {
        KEY_MIN_BATTERY => matches!(value.parse::<i64>(), Ok(0..=100)),
        KEY_AUTO_DOWNLOAD => matches!(value, "0" | "1" | "2"),
        KEY_FAILURES_BEFORE_WARNING => value.parse::<i64>().is_ok(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::open(&dir.path().join("settings.db")).unwrap();
        (dir, settings)
    }

    #[test]
    fn round_trip_and_defaults() {
        let (_dir, mut settings) = open_temp();

        assert_eq!(settings.get("auto_download").unwrap(), "1");
        assert_eq!(settings.get("min_battery").unwrap(), "");

        assert_eq!(settings.set("min_battery", "25").unwrap(), SetOutcome::Changed);
        assert_eq!(settings.get("min_battery").unwrap(), "25");
        assert_eq!(
            settings.set("min_battery", "25").unwrap(),
            SetOutcome::Unchanged,
        );

        settings.delete("min_battery").unwrap();
        assert_eq!(settings.get("min_battery").unwrap(), "");
    }

    #[test]
    fn invalid_values_ignored() {
        let (_dir, mut settings) = open_temp();

        assert_eq!(
            settings.set("min_battery", "101").unwrap(),
            SetOutcome::Ignored,
        );
        assert_eq!(
            settings.set("min_battery", "banana").unwrap(),
            SetOutcome::Ignored,
        );
        assert_eq!(settings.set("auto_download", "3").unwrap(), SetOutcome::Ignored);
        assert_eq!(settings.get("min_battery").unwrap(), "");
    }

    #[test]
    fn underscore_keys_pass_through() {
        let (_dir, mut settings) = open_temp();

        assert_eq!(
            settings.set("_client_theme", "dark").unwrap(),
            SetOutcome::Changed,
        );
        assert_eq!(settings.get("_client_theme").unwrap(), "dark");
    }

    #[test]
    fn show_hides_internal_rows() {
        let (_dir, mut settings) = open_temp();

        settings.set("auto_download", "2").unwrap();
        settings.set(KEY_LAST_CHECK_DATE, "2024-02-01 12:00:00").unwrap();

        let all = settings.all().unwrap();

        assert_eq!(all, [("auto_download".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");

        {
            let mut settings = Settings::open(&path).unwrap();
            settings.set("auto_download", "0").unwrap();
        }

        let settings = Settings::open(&path).unwrap();
        assert_eq!(settings.get("auto_download").unwrap(), "0");
    }
}
