// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! The service façade: request-serialized check/download/apply operations
//! over the state machine, with typed events delivered on a channel.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use fs4::FileExt;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    config::Config,
    download::{self, DownloadHandle},
    hooks,
    settings::{self, SetOutcome, Settings},
    staging,
    state::{CheckResult, DownloadOutcome, FailureKind, Overrides, StateError, StateMachine},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Settings error")]
    Settings(#[from] settings::Error),
    #[error("Hook error")]
    Hooks(#[from] hooks::Error),
    #[error("Staging error")]
    Staging(#[from] staging::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Marker file whose mtime records the last applied update.
const LAST_UPDATE_FILE: &str = ".last_update";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How often download progress is sampled while a batch is in flight.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Events emitted by the service. Delivery order follows operation
/// completion order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    UpdateAvailableStatus {
        is_available: bool,
        downloading: bool,
        available_version: String,
        update_size: u64,
        last_update_date: String,
        error_reason: String,
    },
    UpdateProgress {
        percentage: i32,
        eta: f64,
    },
    UpdateDownloaded,
    UpdateFailed {
        consecutive_failures: u32,
        last_reason: String,
    },
    UpdatePaused {
        percentage: i32,
    },
    SettingChanged {
        key: String,
        value: String,
    },
    Applied {
        success: bool,
    },
    Rebooting {
        status: bool,
    },
}

#[derive(Clone, Debug)]
pub struct Info {
    pub current_build: u64,
    pub target_build: Option<u64>,
    pub device: String,
    pub channel: String,
    pub channel_target: Option<String>,
    pub last_update_date: String,
    pub last_check_date: String,
    pub version_detail: BTreeMap<String, String>,
    pub target_version_detail: String,
}

/// Holds the exclusive single-instance lock for the service's lifetime.
pub struct InstanceLock {
    _file: File,
}

/// Try to acquire the system-wide single-instance lock. Returns `None` when
/// another instance already holds it.
pub fn acquire_instance_lock(config: &Config) -> io::Result<Option<InstanceLock>> {
    let dir = config
        .system
        .settings_db
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| config.system.tempdir.clone());
    fs::create_dir_all(&dir)?;

    let file = File::create(dir.join("sysimage.lock"))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(InstanceLock { _file: file })),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Idle lifetime timer. Reset on every service call and emitted event; the
/// service loop exits cleanly once it expires. A zero lifetime disables it.
struct Keepalive {
    lifetime: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Keepalive {
    fn new(lifetime: Duration) -> Self {
        let keepalive = Self {
            lifetime,
            deadline: Mutex::new(None),
        };
        keepalive.touch();
        keepalive
    }

    fn touch(&self) {
        if !self.lifetime.is_zero() {
            *self.deadline.lock().unwrap() = Some(Instant::now() + self.lifetime);
        }
    }

    fn expired(&self) -> bool {
        self.deadline
            .lock()
            .unwrap()
            .is_some_and(|d| Instant::now() > d)
    }
}

struct Inner {
    config: Arc<Config>,
    overrides: Overrides,
    events: Mutex<Sender<Event>>,
    settings: Mutex<Settings>,
    machine: Mutex<StateMachine>,
    active: Mutex<Option<Arc<dyn DownloadHandle>>>,
    last_check: Mutex<Option<CheckResult>>,
    checking: AtomicBool,
    downloading: AtomicBool,
    paused: AtomicBool,
    failures: AtomicU32,
    last_error: Mutex<String>,
    keepalive: Keepalive,
}

impl Inner {
    fn emit(&self, event: Event) {
        self.keepalive.touch();
        // The receiver living shorter than the service is fine; events are
        // then simply dropped.
        let _ = self.events.lock().unwrap().send(event);
    }

    fn build_machine(config: &Arc<Config>, overrides: &Overrides) -> Result<StateMachine> {
        let hooks = hooks::resolve(&config.hooks)?;
        let downloader = download::select_backend(config);

        Ok(StateMachine::new(
            config.clone(),
            hooks,
            downloader,
            overrides.clone(),
        ))
    }

    fn record_failure(&self, reason: &str) -> u32 {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock().unwrap() = reason.to_owned();
        count
    }
}

/// The long-lived service value. All operations are request-serialized:
/// check, download, and apply contend on the state machine lock, and a
/// second concurrent check simply waits for the in-progress one's event.
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(config: Arc<Config>, overrides: Overrides) -> Result<(Self, Receiver<Event>)> {
        let settings = Settings::open(&config.system.settings_db)?;
        let machine = Inner::build_machine(&config, &overrides)?;
        let (tx, rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            keepalive: Keepalive::new(config.dbus.lifetime),
            config,
            overrides,
            events: Mutex::new(tx),
            settings: Mutex::new(settings),
            machine: Mutex::new(machine),
            active: Mutex::new(None),
            last_check: Mutex::new(None),
            checking: AtomicBool::new(false),
            downloading: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            last_error: Mutex::new(String::new()),
        });

        Ok((Self { inner }, rx))
    }

    /// Whether the idle lifetime has elapsed.
    pub fn idle_expired(&self) -> bool {
        self.inner.keepalive.expired()
    }

    /// Start (or join) a check. Asynchronous; completion is signalled by an
    /// `UpdateAvailableStatus` event. A check already in progress is joined
    /// rather than restarted, so both callers see the same result.
    pub fn check(&self) {
        self.inner.keepalive.touch();

        if self.inner.checking.swap(true, Ordering::SeqCst) {
            return;
        }

        // A fresh check resets failure and progress state.
        self.inner.failures.store(0, Ordering::SeqCst);
        self.inner.last_error.lock().unwrap().clear();

        let inner = self.inner.clone();
        thread::spawn(move || {
            check_worker(&inner);
        });
    }

    /// Begin or resume the download. Asynchronous; progress arrives as
    /// `UpdateProgress` events and completion as `UpdateDownloaded` or
    /// `UpdateFailed`. A batch already in flight is joined rather than
    /// restarted.
    pub fn download(&self) {
        self.inner.keepalive.touch();

        let inner = self.inner.clone();
        thread::spawn(move || {
            download_worker(&inner);
        });
    }

    /// Pause the in-flight download. Synchronous; emits `UpdatePaused`.
    /// Returns an error message when no download is active.
    pub fn pause(&self) -> std::result::Result<(), &'static str> {
        self.inner.keepalive.touch();

        if !self.inner.downloading.load(Ordering::SeqCst) {
            return Err("not downloading");
        }

        let active = self.inner.active.lock().unwrap();
        let Some(handle) = active.as_ref() else {
            return Err("not downloading");
        };

        handle.pause();
        self.inner.paused.store(true, Ordering::SeqCst);

        let percentage = handle.progress().percent();
        self.inner.emit(Event::UpdatePaused { percentage });

        Ok(())
    }

    /// Cancel the in-flight download. Synchronous; emits `UpdateFailed`
    /// only when a download was actually active.
    pub fn cancel(&self) {
        self.inner.keepalive.touch();

        if let Some(handle) = self.inner.active.lock().unwrap().as_ref() {
            handle.cancel();
        }

        let downloading = self.inner.downloading.load(Ordering::SeqCst);
        if downloading {
            let count = self.inner.record_failure("cancelled");
            self.inner.emit(Event::UpdateFailed {
                consecutive_failures: count,
                last_reason: "cancelled".to_owned(),
            });
        }
    }

    /// Stage the downloaded files and invoke the apply hook. Asynchronous;
    /// emits `Applied` and, when the hook reboots, `Rebooting`.
    pub fn apply(&self) {
        self.inner.keepalive.touch();

        let inner = self.inner.clone();
        thread::spawn(move || {
            let result = inner.machine.lock().unwrap().apply();

            match result {
                Ok(rebooting) => {
                    touch_last_update(&inner.config);
                    inner.emit(Event::Applied { success: true });
                    if rebooting {
                        inner.emit(Event::Rebooting { status: true });
                    }
                }
                Err(e) => {
                    error!("Apply failed: {e}");
                    inner.emit(Event::Applied { success: false });
                }
            }
        });
    }

    /// Wipe the data partition via the recovery environment. A production
    /// reset additionally arranges a factory wipe and leaves the flag file.
    pub fn reset(&self, production: bool) -> Result<()> {
        self.inner.keepalive.touch();

        staging::stage_reset(&self.inner.config, production)?;

        let hooks = hooks::resolve(&self.inner.config.hooks)?;
        match hooks.apply.apply() {
            Ok(rebooting) => self.inner.emit(Event::Rebooting { status: rebooting }),
            Err(e) => {
                error!("Reset apply failed: {e}");
                self.inner.emit(Event::Rebooting { status: false });
            }
        }

        Ok(())
    }

    pub fn info(&self) -> Result<Info> {
        self.inner.keepalive.touch();

        let config = &self.inner.config;
        let last_check = self.inner.last_check.lock().unwrap();
        let last_check_date = self
            .inner
            .settings
            .lock()
            .unwrap()
            .get(settings::KEY_LAST_CHECK_DATE)?;

        let device = config
            .service
            .device
            .clone()
            .or_else(|| {
                hooks::resolve(&config.hooks)
                    .ok()
                    .and_then(|h| h.device.device_name())
            })
            .unwrap_or_default();

        Ok(Info {
            current_build: config.build_number(),
            target_build: last_check
                .as_ref()
                .filter(|r| r.available)
                .map(|r| r.target_version),
            device,
            channel: config.service.channel.clone(),
            channel_target: config.service.channel_target.clone(),
            last_update_date: last_update_date(config),
            last_check_date,
            version_detail: parse_version_detail(config.service.version_detail.as_deref()),
            target_version_detail: last_check
                .as_ref()
                .and_then(|r| r.target_version_detail.clone())
                .unwrap_or_default(),
        })
    }

    pub fn get_setting(&self, key: &str) -> Result<String> {
        self.inner.keepalive.touch();

        Ok(self.inner.settings.lock().unwrap().get(key)?)
    }

    /// Set a key/value setting. Writes that change the stored value emit a
    /// `SettingChanged` event; invalid values for predefined keys are
    /// ignored.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner.keepalive.touch();

        let outcome = self.inner.settings.lock().unwrap().set(key, value)?;
        if outcome == SetOutcome::Changed {
            self.inner.emit(Event::SettingChanged {
                key: key.to_owned(),
                value: value.to_owned(),
            });
        }

        Ok(())
    }

    pub fn del_setting(&self, key: &str) -> Result<()> {
        self.inner.keepalive.touch();

        Ok(self.inner.settings.lock().unwrap().delete(key)?)
    }

    pub fn show_settings(&self) -> Result<Vec<(String, String)>> {
        self.inner.keepalive.touch();

        Ok(self.inner.settings.lock().unwrap().all()?)
    }

    /// Quit immediately. An external supervisor may restart the service
    /// through activation.
    pub fn exit(&self) -> ! {
        std::process::exit(0);
    }
}

fn check_worker(inner: &Arc<Inner>) {
    // Each explicit check starts from a clean engine so every fetch is
    // re-done; only a check joined while in progress reuses state.
    match Inner::build_machine(&inner.config, &inner.overrides) {
        Ok(machine) => *inner.machine.lock().unwrap() = machine,
        Err(e) => {
            error!("Failed to rebuild engine: {e}");
            inner.checking.store(false, Ordering::SeqCst);
            return;
        }
    }

    let result = inner.machine.lock().unwrap().check();

    let event = match &result {
        Ok(check) => {
            *inner.last_check.lock().unwrap() = Some(check.clone());

            if let Ok(mut settings) = inner.settings.lock() {
                let now = Local::now().format(DATE_FORMAT).to_string();
                let _ = settings.set(settings::KEY_LAST_CHECK_DATE, &now);
            }

            let auto = inner
                .settings
                .lock()
                .unwrap()
                .get(settings::KEY_AUTO_DOWNLOAD)
                .unwrap_or_default();
            let downloading = check.available && matches!(auto.as_str(), "1" | "2");

            Event::UpdateAvailableStatus {
                is_available: check.available,
                downloading,
                available_version: if check.available {
                    check.target_version.to_string()
                } else {
                    String::new()
                },
                update_size: check.size,
                last_update_date: last_update_date(&inner.config),
                error_reason: check.error_reason.clone(),
            }
        }
        Err(e) => {
            warn!("Check failed: {e}");
            Event::UpdateAvailableStatus {
                is_available: false,
                downloading: false,
                available_version: String::new(),
                update_size: 0,
                last_update_date: last_update_date(&inner.config),
                error_reason: e.to_string(),
            }
        }
    };

    let auto_download = matches!(
        &event,
        Event::UpdateAvailableStatus { downloading: true, .. },
    );

    inner.emit(event);
    inner.checking.store(false, Ordering::SeqCst);

    if auto_download {
        download_worker(inner);
    }
}

fn download_worker(inner: &Arc<Inner>) {
    // At most one download cycle at a time, mirroring check()'s entry
    // guard. Losing the swap means a batch is already in flight (or
    // paused): resume the pause, otherwise join the current batch by
    // leaving it alone.
    if inner.downloading.swap(true, Ordering::SeqCst) {
        if inner.paused.swap(false, Ordering::SeqCst) {
            let handle = inner.active.lock().unwrap().clone();
            if let Some(handle) = handle {
                handle.resume();
                let mut machine = inner.machine.lock().unwrap();
                drive_download(inner, &mut machine, handle);
            }
        }

        return;
    }

    // From here on this thread owns the download slot; every early return
    // must give it back.
    let available = inner
        .last_check
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|r| r.available);
    if !available {
        inner.downloading.store(false, Ordering::SeqCst);
        return;
    }

    // A prior failure leaves the service in a failed state until the next
    // check resets it.
    if inner.failures.load(Ordering::SeqCst) > 0 {
        inner.downloading.store(false, Ordering::SeqCst);
        let count = inner.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let last_reason = inner.last_error.lock().unwrap().clone();
        inner.emit(Event::UpdateFailed {
            consecutive_failures: count,
            last_reason,
        });
        return;
    }

    let hooks = hooks::resolve(&inner.config.hooks).ok();
    let link = hooks
        .as_ref()
        .map(|h| h.device.link_type())
        .unwrap_or_default();

    // The min_battery setting blocks the download outright when the charge
    // is known to be below it.
    let min_battery: Option<u8> = inner
        .settings
        .lock()
        .unwrap()
        .get(settings::KEY_MIN_BATTERY)
        .ok()
        .and_then(|v| v.parse().ok());
    if let (Some(minimum), Some(level)) =
        (min_battery, hooks.as_ref().and_then(|h| h.device.battery_level()))
    {
        if level < minimum {
            warn!("Battery at {level}%, below the {minimum}% minimum");
            inner.downloading.store(false, Ordering::SeqCst);
            let count = inner.record_failure("battery");
            inner.emit(Event::UpdateFailed {
                consecutive_failures: count,
                last_reason: "battery".to_owned(),
            });
            return;
        }
    }

    inner.emit(Event::UpdateProgress {
        percentage: 0,
        eta: 0.0,
    });

    let mut machine = inner.machine.lock().unwrap();

    // auto_download=2 means "always", which lifts the cellular gate.
    let allow_gsm = inner
        .settings
        .lock()
        .unwrap()
        .get(settings::KEY_AUTO_DOWNLOAD)
        .map(|v| v == "2")
        .unwrap_or(false);

    let handle = match machine.start_download(link, allow_gsm) {
        Ok(handle) => handle,
        Err(e) => {
            drop(machine);
            fail_download(inner, &e);
            return;
        }
    };

    *inner.active.lock().unwrap() = Some(handle.clone());

    drive_download(inner, &mut machine, handle);
}

/// Wait for the in-flight batch while relaying progress, then settle the
/// machine state and emit the terminal event.
fn drive_download(inner: &Arc<Inner>, machine: &mut StateMachine, handle: Arc<dyn DownloadHandle>) {
    let status = thread::scope(|scope| {
        let waiter = scope.spawn(|| handle.wait());

        let mut last_percent = 0;
        while !waiter.is_finished() {
            thread::sleep(PROGRESS_INTERVAL);

            let progress = handle.progress();
            // Progress within a download cycle never goes backwards.
            if progress.percent() > last_percent {
                last_percent = progress.percent();
                inner.emit(Event::UpdateProgress {
                    percentage: last_percent,
                    eta: progress.eta_seconds,
                });
            }
        }

        waiter.join().unwrap()
    });

    match machine.finish_download(status) {
        Ok(DownloadOutcome::Downloaded) => {
            *inner.active.lock().unwrap() = None;
            inner.downloading.store(false, Ordering::SeqCst);
            inner.failures.store(0, Ordering::SeqCst);
            inner.emit(Event::UpdateProgress {
                percentage: 100,
                eta: 0.0,
            });
            inner.emit(Event::UpdateDownloaded);
        }
        Ok(DownloadOutcome::Paused) => {
            // Keep the handle for the resume; partial files are retained.
            inner.paused.store(true, Ordering::SeqCst);
        }
        Err(e) if e.kind == FailureKind::Cancelled => {
            // The synchronous cancel() already emitted UpdateFailed.
            *inner.active.lock().unwrap() = None;
            inner.downloading.store(false, Ordering::SeqCst);
            inner.paused.store(false, Ordering::SeqCst);
        }
        Err(e) => {
            *inner.active.lock().unwrap() = None;
            fail_download(inner, &e);
        }
    }
}

fn fail_download(inner: &Arc<Inner>, error: &StateError) {
    warn!("Download failed: {error}");
    inner.downloading.store(false, Ordering::SeqCst);
    inner.paused.store(false, Ordering::SeqCst);

    let count = inner.record_failure(error.reason());
    inner.emit(Event::UpdateFailed {
        consecutive_failures: count,
        last_reason: error.reason().to_owned(),
    });
}

/// The last update date: the mtime of the data partition's `.last_update`
/// marker, falling back to the build file. First existing path wins.
pub fn last_update_date(config: &Config) -> String {
    let mut paths = vec![config.updater.data_partition.join(LAST_UPDATE_FILE)];
    if let Some(build_file) = &config.system.build_file {
        paths.push(build_file.clone());
    }

    for path in paths {
        if let Ok(metadata) = fs::metadata(&path) {
            if let Ok(mtime) = metadata.modified() {
                return DateTime::<Local>::from(mtime).format(DATE_FORMAT).to_string();
            }
        }
    }

    "Unknown".to_owned()
}

fn touch_last_update(config: &Config) {
    let path = config.updater.data_partition.join(LAST_UPDATE_FILE);
    if let Err(e) = fs::write(&path, b"") {
        warn!("Could not touch {path:?}: {e}");
    }
}

fn parse_version_detail(detail: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    if let Some(detail) = detail {
        for item in detail.split(',') {
            if let Some((name, version)) = item.trim().split_once('=') {
                map.insert(name.to_owned(), version.to_owned());
            }
        }
    }

    map
}

/// Helper for synchronous front-ends: wait for the next event, bailing out
/// after `timeout`.
pub fn wait_for_event(rx: &Receiver<Event>, timeout: Duration) -> Option<Event> {
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use crate::config::{
        DbusConfig, DownloaderKind, GpgConfig, HooksConfig, Port, ServiceConfig, SystemConfig,
        UpdaterConfig,
    };

    use super::*;

    fn test_config(dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            dir: dir.to_owned(),
            service: ServiceConfig {
                base: "localhost".to_owned(),
                http_port: Port::Number(80),
                https_port: Port::Number(443),
                channel: "stable".to_owned(),
                channel_target: None,
                device: Some("frieza".to_owned()),
                build_number: Some(100),
                version_detail: Some("ubuntu=100,device=7".to_owned()),
            },
            system: SystemConfig {
                tempdir: dir.join("tmp"),
                logfile: None,
                loglevel: "error".to_owned(),
                timeout: Duration::from_secs(60),
                build_file: None,
                settings_db: dir.join("settings.db"),
                downloader: DownloaderKind::Internal,
                downloader_helper: None,
            },
            gpg: GpgConfig {
                archive_master: dir.join("archive-master.tar.gz"),
                image_master: dir.join("image-master.tar.gz"),
                image_signing: dir.join("image-signing.tar.gz"),
                device_signing: dir.join("device-signing.tar.gz"),
            },
            updater: UpdaterConfig {
                cache_partition: dir.join("cache"),
                data_partition: dir.join("data"),
            },
            hooks: HooksConfig {
                device: "none".to_owned(),
                scorer: "weighted".to_owned(),
                apply: "noop".to_owned(),
            },
            dbus: DbusConfig {
                lifetime: Duration::ZERO,
            },
        })
    }

    #[test]
    fn settings_round_trip_and_change_event() {
        let dir = tempfile::tempdir().unwrap();
        let (service, events) =
            Service::new(test_config(dir.path()), Overrides::default()).unwrap();

        service.set_setting("auto_download", "2").unwrap();
        assert_eq!(service.get_setting("auto_download").unwrap(), "2");

        assert_eq!(
            events.try_recv().unwrap(),
            Event::SettingChanged {
                key: "auto_download".to_owned(),
                value: "2".to_owned(),
            },
        );

        // Unchanged write: no event.
        service.set_setting("auto_download", "2").unwrap();
        assert!(events.try_recv().is_err());

        // Invalid write: ignored, no event.
        service.set_setting("auto_download", "9").unwrap();
        assert!(events.try_recv().is_err());
        assert_eq!(service.get_setting("auto_download").unwrap(), "2");

        service.del_setting("auto_download").unwrap();
        assert_eq!(service.get_setting("auto_download").unwrap(), "1");
    }

    #[test]
    fn pause_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _events) =
            Service::new(test_config(dir.path()), Overrides::default()).unwrap();

        assert_eq!(service.pause(), Err("not downloading"));
    }

    #[test]
    fn cancel_without_download_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (service, events) =
            Service::new(test_config(dir.path()), Overrides::default()).unwrap();

        service.cancel();

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn info_reports_config() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _events) =
            Service::new(test_config(dir.path()), Overrides::default()).unwrap();

        let info = service.info().unwrap();

        assert_eq!(info.current_build, 100);
        assert_eq!(info.device, "frieza");
        assert_eq!(info.channel, "stable");
        assert_eq!(info.target_build, None);
        assert_eq!(info.last_update_date, "Unknown");
        assert_eq!(info.version_detail["ubuntu"], "100");
        assert_eq!(info.version_detail["device"], "7");
    }

    #[test]
    fn instance_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let first = acquire_instance_lock(&config).unwrap();
        assert!(first.is_some());

        let second = acquire_instance_lock(&config).unwrap();
        assert!(second.is_none());

        drop(first);
        assert!(acquire_instance_lock(&config).unwrap().is_some());
    }

    #[test]
    fn version_detail_parsing() {
        let detail = parse_version_detail(Some("ubuntu=100,device=7,custom=3"));
        assert_eq!(detail.len(), 3);
        assert_eq!(detail["custom"], "3");

        assert!(parse_version_detail(None).is_empty());
        assert!(parse_version_detail(Some("garbage")).is_empty());
    }
}
