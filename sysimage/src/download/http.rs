// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    download::{
        BatchOptions, BatchStatus, DownloadHandle, DownloadRequest, Downloader, Error, Progress,
        Result, validate_batch,
    },
    util,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// The in-process HTTP backend. Files are fetched on a small pool of worker
/// threads, written to `.partial` temporaries, checksummed, and renamed into
/// place. Interrupted downloads resume from the partial file via HTTP range
/// requests.
pub struct HttpDownloader {
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Downloader for HttpDownloader {
    fn enqueue(
        &self,
        requests: Vec<DownloadRequest>,
        options: &BatchOptions,
    ) -> Result<Arc<dyn DownloadHandle>> {
        let requests = validate_batch(requests)?;
        let total = requests.iter().map(|r| r.size).sum();

        let shared = Arc::new(Shared {
            pause: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            received: AtomicU64::new(0),
            total,
            started: Mutex::new(Instant::now()),
        });

        let handle = HttpHandle {
            shared,
            requests,
            options: options.clone(),
            timeout: self.timeout,
            worker: Mutex::new(None),
        };

        // A gated batch stays queued; resume() starts it once policy allows.
        if !options.gated() {
            handle.spawn();
        }

        Ok(Arc::new(handle))
    }
}

struct Shared {
    pause: AtomicBool,
    cancel: AtomicBool,
    received: AtomicU64,
    total: u64,
    started: Mutex<Instant>,
}

struct HttpHandle {
    shared: Arc<Shared>,
    requests: Vec<DownloadRequest>,
    options: BatchOptions,
    timeout: Duration,
    worker: Mutex<Option<JoinHandle<Result<BatchStatus>>>>,
}

impl HttpHandle {
    fn spawn(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let requests = self.requests.clone();
        let options = self.options.clone();
        let timeout = self.timeout;

        *self.shared.started.lock().unwrap() = Instant::now();
        self.shared.received.store(0, Ordering::SeqCst);

        *worker = Some(thread::spawn(move || {
            run_batch(&requests, &options, timeout, &shared)
        }));
    }
}

impl DownloadHandle for HttpHandle {
    fn pause(&self) {
        self.shared.pause.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.shared.pause.store(false, Ordering::SeqCst);
        self.spawn();
    }

    fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    fn progress(&self) -> Progress {
        let received = self.shared.received.load(Ordering::SeqCst);
        let total = self.shared.total;
        let elapsed = self.shared.started.lock().unwrap().elapsed().as_secs_f64();

        let eta_seconds = if received == 0 || elapsed <= 0.0 || total <= received {
            0.0
        } else {
            let rate = received as f64 / elapsed;
            (total - received) as f64 / rate
        };

        Progress {
            received,
            total,
            eta_seconds,
        }
    }

    fn wait(&self) -> Result<BatchStatus> {
        let worker = self.worker.lock().unwrap().take();

        match worker {
            // Never started: the batch is gated/queued.
            None => Ok(BatchStatus::Paused),
            Some(handle) => handle.join().unwrap(),
        }
    }
}

/// Sidecar recording which source a partial file belongs to. A partial is
/// only resumed when the url and checksum still match; otherwise it is
/// discarded and the download restarts.
#[derive(Deserialize, Serialize)]
struct PartialState {
    url: String,
    checksum: Option<String>,
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(".partial");
    PathBuf::from(s)
}

fn state_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_owned();
    s.push(".state");
    PathBuf::from(s)
}

fn read_state(path: &Path) -> Option<PartialState> {
    let data = fs::read_to_string(path).ok()?;

    toml_edit::de::from_str(&data).ok()
}

fn write_state(path: &Path, state: &PartialState) -> Result<()> {
    let data = toml_edit::ser::to_string(state).unwrap();
    fs::write(path, data)?;

    Ok(())
}

enum FileOutcome {
    Done,
    Paused,
}

fn run_batch(
    requests: &[DownloadRequest],
    options: &BatchOptions,
    timeout: Duration,
    shared: &Arc<Shared>,
) -> Result<BatchStatus> {
    // Files that already made it through checksum verification and rename
    // are never downloaded again.
    let mut pending = VecDeque::new();
    for request in requests {
        if request.dest.exists() {
            shared.received.fetch_add(request.size, Ordering::SeqCst);
        } else {
            pending.push_back(request.clone());
        }
    }

    let deadline = if options.timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + options.timeout)
    };

    let queue = Mutex::new(pending);
    let error: Mutex<Option<Error>> = Mutex::new(None);
    let paused = AtomicBool::new(false);

    let threads = options.max_threads.max(1);

    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| loop {
                let request = {
                    let mut queue = queue.lock().unwrap();
                    match queue.pop_front() {
                        Some(r) => r,
                        None => break,
                    }
                };

                match download_one(&request, timeout, deadline, shared) {
                    Ok(FileOutcome::Done) => {}
                    Ok(FileOutcome::Paused) => {
                        paused.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        // Any per-file failure cancels the whole batch.
                        shared.cancel.store(true, Ordering::SeqCst);

                        let mut error = error.lock().unwrap();
                        if error.is_none() {
                            *error = Some(e);
                        }

                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = error.lock().unwrap().take() {
        discard_partials(requests);
        return Err(e);
    }

    if shared.cancel.load(Ordering::SeqCst) {
        discard_partials(requests);
        return Err(Error::Cancelled);
    }

    if paused.load(Ordering::SeqCst) || shared.pause.load(Ordering::SeqCst) {
        return Ok(BatchStatus::Paused);
    }

    Ok(BatchStatus::Completed)
}

fn discard_partials(requests: &[DownloadRequest]) {
    for request in requests {
        let _ = util::safe_remove(&partial_path(&request.dest));
        let _ = util::safe_remove(&state_path(&request.dest));
    }
}

fn download_one(
    request: &DownloadRequest,
    timeout: Duration,
    deadline: Option<Instant>,
    shared: &Arc<Shared>,
) -> Result<FileOutcome> {
    let partial = partial_path(&request.dest);
    let state = state_path(&request.dest);

    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)?;
    }

    // Resume only partials that belong to the same source.
    let resumable = read_state(&state).is_some_and(|s| {
        s.url == request.url && s.checksum == request.checksum
    });
    if !resumable {
        util::safe_remove(&partial)?;
    }

    let mut offset = match fs::metadata(&partial) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    write_state(
        &state,
        &PartialState {
            url: request.url.clone(),
            checksum: request.checksum.clone(),
        },
    )?;

    // The running digest must cover the bytes already on disk.
    let mut hasher = Sha256::new();
    if offset > 0 {
        let mut existing = File::open(&partial)?;
        let mut buf = [0u8; 65536];
        loop {
            let n = existing.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        shared.received.fetch_add(offset, Ordering::SeqCst);
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&partial)?;
    let mut attempt = 0u32;

    loop {
        match stream_body(request, &mut file, &mut hasher, &mut offset, timeout, deadline, shared)
        {
            Ok(StreamEnd::Complete) => break,
            Ok(StreamEnd::Paused) => return Ok(FileOutcome::Paused),
            Ok(StreamEnd::Restarted) => {
                // The server ignored our range request, so start over.
                file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&partial)?;
                hasher = Sha256::new();
                continue;
            }
            Err(e) if attempt + 1 < MAX_ATTEMPTS && is_transient(&e) => {
                attempt += 1;
                warn!("Retrying {} (attempt {attempt}): {e}", request.url);

                let backoff = Duration::from_secs(1 << attempt);
                let slept = Instant::now();
                while slept.elapsed() < backoff {
                    if shared.cancel.load(Ordering::SeqCst) {
                        return Err(Error::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
            Err(e) => return Err(e),
        }
    }

    file.sync_all()?;
    drop(file);

    if let Some(expected) = &request.checksum {
        let got = hex::encode(hasher.finalize());
        if got != *expected {
            util::safe_remove(&partial)?;
            util::safe_remove(&state)?;
            return Err(Error::ChecksumMismatch {
                path: request.dest.clone(),
                expected: expected.clone(),
                got,
            });
        }
    }

    fs::rename(&partial, &request.dest)?;
    util::safe_remove(&state)?;

    debug!("Downloaded {} -> {:?}", request.url, request.dest);

    Ok(FileOutcome::Done)
}

enum StreamEnd {
    Complete,
    Paused,
    /// The server answered a ranged request with a full body.
    Restarted,
}

#[allow(clippy::too_many_arguments)]
fn stream_body(
    request: &DownloadRequest,
    file: &mut File,
    hasher: &mut Sha256,
    offset: &mut u64,
    timeout: Duration,
    deadline: Option<Instant>,
    shared: &Arc<Shared>,
) -> Result<StreamEnd> {
    let read_timeout = if timeout.is_zero() {
        Duration::from_secs(120)
    } else {
        timeout
    };

    let http_error = |e| Error::Http {
        url: request.url.clone(),
        source: e,
    };

    let mut builder = attohttpc::get(&request.url)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout);

    if *offset > 0 {
        builder = builder.header("Range", format!("bytes={}-", *offset));
    }

    let mut response = builder
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(http_error)?;

    if *offset > 0 && response.status() == attohttpc::StatusCode::OK {
        shared
            .received
            .fetch_sub(*offset, Ordering::SeqCst);
        *offset = 0;
        return Ok(StreamEnd::Restarted);
    }

    let mut buf = [0u8; 65536];

    loop {
        if shared.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if shared.pause.load(Ordering::SeqCst) {
            file.sync_all()?;
            return Ok(StreamEnd::Paused);
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "step timeout exceeded",
            )));
        }

        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }

        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        *offset += n as u64;
        shared.received.fetch_add(n as u64, Ordering::SeqCst);
    }

    // Premature EOF is an error so the attempt can be retried with a range
    // request picking up from the current offset.
    if request.size > 0 && *offset < request.size {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("got {} of {} bytes", *offset, request.size),
        )));
    }

    Ok(StreamEnd::Complete)
}

fn is_transient(error: &Error) -> bool {
    match error {
        Error::Io(e) => !matches!(e.kind(), io::ErrorKind::TimedOut),
        Error::Http { .. } => true,
        _ => false,
    }
}
