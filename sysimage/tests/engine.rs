// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end engine runs against a signed server tree: check, download,
//! verify, stage, apply.

mod support;

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rsa::{
    pkcs8::{EncodePublicKey, LineEnding},
    RsaPrivateKey,
};
use sha2::{Digest, Sha256};
use sysimage::{
    config::Config,
    crypto,
    download::{self, LinkType},
    hooks,
    keyring::{write_archive, Manifest},
    service::{Event, Service},
    state::{DownloadOutcome, Overrides, StateMachine, UpdateState},
};

use support::Server;

/// Far enough out that the image-signing keyring never expires mid-test.
const EXPIRY_2100: i64 = 4102444800;

struct Fixture {
    root: tempfile::TempDir,
    server: Server,
    signing_key: RsaPrivateKey,
}

fn generate_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
}

fn public_pem(key: &RsaPrivateKey) -> String {
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

fn sign_file(path: &Path, key: &RsaPrivateKey) {
    let data = fs::read(path).unwrap();
    let signature = crypto::sign_detached(&data, key).unwrap();

    let mut asc = path.as_os_str().to_owned();
    asc.push(".asc");
    fs::write(PathBuf::from(asc), signature).unwrap();
}

fn write_keyring(path: &Path, kind: &str, expiry: Option<i64>, key: &RsaPrivateKey) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    write_archive(
        path,
        &Manifest {
            kind: kind.to_owned(),
            expiry,
            model: None,
        },
        &public_pem(key),
    )
    .unwrap();
}

impl Fixture {
    /// Build a served tree with a full trust chain and the given channels
    /// and index documents, plus a matching local configuration.
    fn new(channels_json: &str, index_rel_path: &str, index_json: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let served = root.path().join("served");
        fs::create_dir_all(served.join("gpg")).unwrap();

        let archive_key = generate_key();
        let master_key = generate_key();
        let signing_key = generate_key();

        // Pre-installed trust root.
        write_keyring(
            &root.path().join("etc/archive-master.tar.gz"),
            "archive-master",
            None,
            &archive_key,
        );

        // Server-side keyrings, each signed by its parent.
        let master = served.join("gpg/image-master.tar.gz");
        write_keyring(&master, "image-master", None, &master_key);
        sign_file(&master, &archive_key);

        let signing = served.join("gpg/image-signing.tar.gz");
        write_keyring(&signing, "image-signing", Some(EXPIRY_2100), &signing_key);
        sign_file(&signing, &master_key);

        // Metadata, signed by the image-signing key.
        let channels = served.join("channels.json");
        fs::write(&channels, channels_json).unwrap();
        sign_file(&channels, &signing_key);

        let index = served.join(index_rel_path.trim_start_matches('/'));
        fs::create_dir_all(index.parent().unwrap()).unwrap();
        fs::write(&index, index_json).unwrap();
        sign_file(&index, &signing_key);

        let server = Server::start(served, None);

        for dir in ["var", "tmp", "cache", "data"] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }

        Self {
            root,
            server,
            signing_key,
        }
    }

    /// Publish a payload file in the pool, signed and checksummed, and
    /// return its index file entry.
    fn add_payload(&self, name: &str, data: &[u8]) -> String {
        let pool = self.root.path().join("served/pool");
        fs::create_dir_all(&pool).unwrap();

        let path = pool.join(name);
        fs::write(&path, data).unwrap();
        sign_file(&path, &self.signing_key);

        format!(
            r#"{{
                "path": "/pool/{name}",
                "signature": "/pool/{name}.asc",
                "checksum": "{checksum}",
                "size": {size},
                "order": 0
            }}"#,
            checksum = hex::encode(Sha256::digest(data)),
            size = data.len(),
        )
    }

    fn config(&self, channel: &str, build: u64) -> Arc<Config> {
        self.config_with_target(channel, build, None)
    }

    fn config_with_target(
        &self,
        channel: &str,
        build: u64,
        channel_target: Option<&str>,
    ) -> Arc<Config> {
        let root = self.root.path();
        let config_dir = root.join("etc/config.d");
        fs::create_dir_all(&config_dir).unwrap();

        let target_line = match channel_target {
            Some(target) => format!("channel_target: {target}\n"),
            None => String::new(),
        };

        fs::write(
            config_dir.join("00_default.ini"),
            format!(
                "\
[service]
base: 127.0.0.1
http_port: {port}
https_port: disabled
channel: {channel}
device: frieza
build_number: {build}
{target_line}

[system]
tempdir: {root}/tmp
timeout: 30s
settings_db: {root}/var/settings.db

[gpg]
archive_master: {root}/etc/archive-master.tar.gz
image_master: {root}/var/image-master.tar.gz
image_signing: {root}/var/image-signing.tar.gz
device_signing: {root}/var/device-signing.tar.gz

[updater]
cache_partition: {root}/cache
data_partition: {root}/data

[hooks]
device: none
scorer: weighted
apply: noop

[dbus]
lifetime: 0
",
                port = self.server.port,
                root = root.display(),
            ),
        )
        .unwrap();

        Arc::new(Config::from_dir(&config_dir).unwrap())
    }

    fn machine(&self, config: &Arc<Config>) -> StateMachine {
        let hooks = hooks::resolve(&config.hooks).unwrap();
        let downloader = download::select_backend(config);

        StateMachine::new(
            config.clone(),
            hooks,
            downloader,
            Overrides {
                percentage: Some(0),
                ..Default::default()
            },
        )
    }
}

const CHANNELS: &str = r#"{
    "stable": {
        "devices": {
            "frieza": { "index": "/stable/frieza/index.json" }
        }
    }
}"#;

fn index_with(files: &str) -> String {
    format!(
        r#"{{
            "global": {{ "generated_at": "Mon Apr 29 18:45:27 UTC 2013" }},
            "images": [
                {{
                    "type": "full",
                    "version": 200,
                    "description": "Full build 200",
                    "files": [{files}]
                }}
            ]
        }}"#,
    )
}

fn cache_entries(cache: &Path) -> BTreeSet<String> {
    fs::read_dir(cache)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn full_upgrade_cycle() {
    let data: Vec<u8> = (0..100_000).map(|i| (i % 239) as u8).collect();

    let fixture = Fixture::new(CHANNELS, "/stable/frieza/index.json", "{}");
    let entry = fixture.add_payload("full-200.tar.gz", &data);

    // The index references the payload, so it has to be written after the
    // pool file exists.
    let index = fixture.root.path().join("served/stable/frieza/index.json");
    fs::write(&index, index_with(&entry)).unwrap();
    sign_file(&index, &fixture.signing_key);

    let config = fixture.config("stable", 100);
    let mut machine = fixture.machine(&config);

    let result = machine.check().unwrap();

    assert!(result.available);
    assert_eq!(result.target_version, 200);
    assert_eq!(result.size, data.len() as u64);
    assert_eq!(result.versions, [200]);
    assert_eq!(machine.state(), UpdateState::ReadyToDownload);

    // Idempotence: a second check without an intervening state change
    // yields an identical result.
    assert_eq!(machine.check().unwrap(), result);

    // Download and verify.
    let handle = machine.start_download(LinkType::Unknown, false).unwrap();
    let status = handle.wait();
    let outcome = machine.finish_download(status).unwrap();

    assert!(matches!(outcome, DownloadOutcome::Downloaded));
    assert_eq!(machine.state(), UpdateState::Downloaded);

    // Stage and apply. Stale cache contents must be wiped, except the
    // recovery log files.
    let cache = &config.updater.cache_partition;
    fs::write(cache.join("log"), b"log").unwrap();
    fs::write(cache.join("last_log"), b"old log").unwrap();
    fs::write(cache.join("stale-leftover.tar.gz"), b"junk").unwrap();

    let rebooting = machine.apply().unwrap();

    assert!(!rebooting);
    assert_eq!(machine.state(), UpdateState::Applied);

    let expected: BTreeSet<String> = [
        "log",
        "last_log",
        "image-master.tar.gz",
        "image-master.tar.gz.asc",
        "image-signing.tar.gz",
        "image-signing.tar.gz.asc",
        "full-200.tar.gz",
        "full-200.tar.gz.asc",
        "update_command",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    assert_eq!(cache_entries(cache), expected);

    // The staged payload is bit-identical to what the server published.
    assert_eq!(fs::read(cache.join("full-200.tar.gz")).unwrap(), data);

    let command = fs::read_to_string(cache.join("update_command")).unwrap();
    assert_eq!(
        command,
        "\
format_version 3
load_keyring image-master.tar.gz image-master.tar.gz.asc
load_keyring image-signing.tar.gz image-signing.tar.gz.asc
format system
mount system
update full-200.tar.gz full-200.tar.gz.asc
unmount system
",
    );
}

#[test]
fn up_to_date_index_reports_no_update() {
    let index = r#"{
        "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
        "images": [
            { "type": "full", "version": 90, "files": [] },
            { "type": "delta", "version": 100, "base": 90, "files": [] }
        ]
    }"#;

    let fixture = Fixture::new(CHANNELS, "/stable/frieza/index.json", index);
    let config = fixture.config("stable", 100);
    let mut machine = fixture.machine(&config);

    let result = machine.check().unwrap();

    assert!(!result.available);
    assert_eq!(result.error_reason, "");
    assert_eq!(machine.state(), UpdateState::NoUpdate);
}

const ALIAS_CHANNELS: &str = r#"{
    "daily": {
        "alias": "rolling",
        "devices": {
            "frieza": { "index": "/daily/frieza/index.json" }
        }
    }
}"#;

#[test]
fn alias_retarget_squashes_build_and_records_target() {
    let data: Vec<u8> = (0..50_000).map(|i| (i % 233) as u8).collect();

    let fixture = Fixture::new(ALIAS_CHANNELS, "/daily/frieza/index.json", "{}");
    let entry = fixture.add_payload("full-50.tar.gz", &data);

    // The only image is older than the installed build. It is reachable
    // only because the recorded target differs from the alias target, which
    // squashes the build to 0 for candidate calculation.
    let index = fixture.root.path().join("served/daily/frieza/index.json");
    fs::write(
        &index,
        format!(
            r#"{{
                "global": {{ "generated_at": "Mon Apr 29 18:45:27 UTC 2013" }},
                "images": [
                    {{
                        "type": "full",
                        "version": 50,
                        "description": "Rolling 50",
                        "files": [{entry}]
                    }}
                ]
            }}"#,
        ),
    )
    .unwrap();
    sign_file(&index, &fixture.signing_key);

    let config = fixture.config_with_target("daily", 100, Some("oldstyle"));
    let mut machine = fixture.machine(&config);

    let result = machine.check().unwrap();

    assert!(result.available);
    assert_eq!(result.target_version, 50);
    assert_eq!(
        result.channel_switch,
        Some(("oldstyle".to_owned(), "rolling".to_owned())),
    );

    let handle = machine.start_download(LinkType::Unknown, false).unwrap();
    let status = handle.wait();
    machine.finish_download(status).unwrap();
    machine.apply().unwrap();

    // Applying the upgrade records the resolved target next to the other
    // config files...
    let config_dir = fixture.root.path().join("etc/config.d");
    let reloaded = Config::from_dir(&config_dir).unwrap();
    assert_eq!(reloaded.service.channel_target.as_deref(), Some("rolling"));

    // ...so the next run compares against the real build number again.
    let mut machine = fixture.machine(&Arc::new(reloaded));
    let result = machine.check().unwrap();

    assert!(!result.available);
    assert!(result.channel_switch.is_none());
    assert_eq!(machine.state(), UpdateState::NoUpdate);
}

#[test]
fn alias_without_recorded_target_uses_real_build_number() {
    // Same server layout, but nothing recorded: the device has simply been
    // following the alias, so the old image must not be reachable.
    let index = r#"{
        "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
        "images": [
            { "type": "full", "version": 50, "description": "Rolling 50", "files": [] }
        ]
    }"#;

    let fixture = Fixture::new(ALIAS_CHANNELS, "/daily/frieza/index.json", index);
    let config = fixture.config("daily", 100);
    let mut machine = fixture.machine(&config);

    let result = machine.check().unwrap();

    assert!(!result.available);
    assert!(result.channel_switch.is_none());
    assert_eq!(machine.state(), UpdateState::NoUpdate);
}

#[test]
fn tampered_index_fails_with_signature_reason() {
    let index = r#"{
        "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
        "images": []
    }"#;

    let fixture = Fixture::new(CHANNELS, "/stable/frieza/index.json", index);

    // Corrupt the index after it was signed.
    let served_index = fixture.root.path().join("served/stable/frieza/index.json");
    fs::write(
        &served_index,
        r#"{
            "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
            "images": [ { "type": "full", "version": 999, "files": [] } ]
        }"#,
    )
    .unwrap();

    let config = fixture.config("stable", 100);
    let mut machine = fixture.machine(&config);

    let error = machine.check().unwrap_err();

    assert_eq!(error.reason(), "signature");
    assert_eq!(machine.state(), UpdateState::Failed);
}

#[test]
fn unknown_channel_is_no_update() {
    let fixture = Fixture::new(
        CHANNELS,
        "/stable/frieza/index.json",
        r#"{
            "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
            "images": []
        }"#,
    );

    let config = fixture.config("nightly", 100);
    let mut machine = fixture.machine(&config);

    let result = machine.check().unwrap();

    assert!(!result.available);
    assert!(result.error_reason.contains("nightly"));
    assert_eq!(machine.state(), UpdateState::NoUpdate);
}

#[test]
fn service_emits_status_and_downloads() {
    let data: Vec<u8> = (0..50_000).map(|i| (i % 241) as u8).collect();

    let fixture = Fixture::new(CHANNELS, "/stable/frieza/index.json", "{}");
    let entry = fixture.add_payload("full-200.tar.gz", &data);

    let index = fixture.root.path().join("served/stable/frieza/index.json");
    fs::write(&index, index_with(&entry)).unwrap();
    sign_file(&index, &fixture.signing_key);

    let config = fixture.config("stable", 100);
    let (service, events) = Service::new(
        config.clone(),
        Overrides {
            percentage: Some(0),
            ..Default::default()
        },
    )
    .unwrap();

    service.check();

    let mut saw_status = false;
    let mut saw_downloaded = false;

    // auto_download defaults to 1, so a successful check flows straight
    // into the download.
    for _ in 0..600 {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::UpdateAvailableStatus {
                is_available,
                downloading,
                available_version,
                error_reason,
                ..
            }) => {
                assert!(is_available);
                assert!(downloading);
                assert_eq!(available_version, "200");
                assert_eq!(error_reason, "");
                saw_status = true;
            }
            Ok(Event::UpdateDownloaded) => {
                saw_downloaded = true;
                break;
            }
            Ok(Event::UpdateFailed { last_reason, .. }) => {
                panic!("download failed: {last_reason}");
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }

    assert!(saw_status);
    assert!(saw_downloaded);

    // Apply through the façade.
    service.apply();

    let mut saw_applied = false;
    for _ in 0..100 {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            if let Event::Applied { success } = event {
                assert!(success);
                saw_applied = true;
                break;
            }
        }
    }
    assert!(saw_applied);

    assert!(config.updater.cache_partition.join("update_command").exists());
}
