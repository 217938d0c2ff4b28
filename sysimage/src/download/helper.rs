// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! Out-of-process download backend. The helper is handed the whole batch up
//! front and reports events back as it goes, so the engine stays responsive
//! without owning any transfer state. The wire format is newline-delimited
//! JSON on the helper's stdin/stdout.

use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::download::{
    BatchOptions, BatchStatus, DownloadHandle, DownloadRequest, Downloader, Error, Progress,
    Result, validate_batch,
};

/// A batch submission, sent as the first line on the helper's stdin.
#[derive(Serialize)]
struct BatchMessage<'a> {
    batch: Vec<FileMessage<'a>>,
    allow_gsm: bool,
}

#[derive(Serialize)]
struct FileMessage<'a> {
    url: &'a str,
    dest: &'a PathBuf,
    checksum: Option<&'a str>,
    size: u64,
}

/// A control verb, sent as its own line on the helper's stdin.
#[derive(Serialize)]
struct ControlMessage {
    control: &'static str,
}

/// One event line on the helper's stdout.
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventMessage {
    Progress { received: u64, total: u64 },
    Finished,
    Paused,
    Canceled,
    Error { file: Option<String>, message: String },
}

pub struct HelperDownloader {
    command: PathBuf,
    timeout: Duration,
}

impl HelperDownloader {
    pub fn new(command: PathBuf, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Downloader for HelperDownloader {
    fn enqueue(
        &self,
        requests: Vec<DownloadRequest>,
        options: &BatchOptions,
    ) -> Result<Arc<dyn DownloadHandle>> {
        let requests = validate_batch(requests)?;

        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Helper(format!("failed to spawn {:?}: {e}", self.command)))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let message = BatchMessage {
            batch: requests
                .iter()
                .map(|r| FileMessage {
                    url: &r.url,
                    dest: &r.dest,
                    checksum: r.checksum.as_deref(),
                    size: r.size,
                })
                .collect(),
            allow_gsm: options.allow_gsm,
        };

        let mut line = serde_json::to_string(&message).expect("message always serializes");
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .map_err(|e| Error::Helper(format!("failed to submit batch: {e}")))?;

        let total = requests.iter().map(|r| r.size).sum();
        let shared = Arc::new(Shared {
            received: AtomicU64::new(0),
            total,
            started: Instant::now(),
        });

        let reader_shared = shared.clone();
        let timeout = self.timeout;
        let reader = thread::spawn(move || read_events(stdout, timeout, &reader_shared));

        Ok(Arc::new(HelperHandle {
            shared,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

struct Shared {
    received: AtomicU64,
    total: u64,
    started: Instant,
}

struct HelperHandle {
    shared: Arc<Shared>,
    child: Mutex<Child>,
    stdin: Mutex<std::process::ChildStdin>,
    reader: Mutex<Option<JoinHandle<Result<BatchStatus>>>>,
}

impl HelperHandle {
    fn send_control(&self, control: &'static str) {
        let mut line = serde_json::to_string(&ControlMessage { control })
            .expect("message always serializes");
        line.push('\n');

        // The helper may already have exited; that's not our problem here.
        let _ = self.stdin.lock().unwrap().write_all(line.as_bytes());
    }
}

impl DownloadHandle for HelperHandle {
    fn pause(&self) {
        self.send_control("pause");
    }

    fn resume(&self) {
        self.send_control("resume");
    }

    fn cancel(&self) {
        self.send_control("cancel");
    }

    fn progress(&self) -> Progress {
        let received = self.shared.received.load(Ordering::SeqCst);
        let total = self.shared.total;
        let elapsed = self.shared.started.elapsed().as_secs_f64();

        let eta_seconds = if received == 0 || elapsed <= 0.0 || total <= received {
            0.0
        } else {
            (total - received) as f64 / (received as f64 / elapsed)
        };

        Progress {
            received,
            total,
            eta_seconds,
        }
    }

    fn wait(&self) -> Result<BatchStatus> {
        let result = match self.reader.lock().unwrap().take() {
            Some(handle) => handle.join().unwrap(),
            None => Ok(BatchStatus::Completed),
        };

        let mut child = self.child.lock().unwrap();
        match result {
            // Paused batches keep the helper alive for the later resume.
            Ok(BatchStatus::Paused) => {}
            _ => {
                let _ = child.wait();
            }
        }

        result
    }
}

fn read_events(
    stdout: std::process::ChildStdout,
    timeout: Duration,
    shared: &Shared,
) -> Result<BatchStatus> {
    let deadline = if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    };

    for line in BufReader::new(stdout).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            return Err(Error::Helper("helper timed out".to_owned()));
        }

        let event: EventMessage = serde_json::from_str(&line)
            .map_err(|e| Error::Helper(format!("bad event line {line:?}: {e}")))?;

        match event {
            EventMessage::Progress { received, .. } => {
                shared.received.store(received, Ordering::SeqCst);
            }
            EventMessage::Finished => {
                debug!("Helper finished batch");
                return Ok(BatchStatus::Completed);
            }
            EventMessage::Paused => return Ok(BatchStatus::Paused),
            EventMessage::Canceled => return Err(Error::Cancelled),
            EventMessage::Error { file, message } => {
                let file = file.unwrap_or_default();
                return Err(Error::Helper(format!("{file}: {message}")));
            }
        }
    }

    Err(Error::Helper("helper exited without a final event".to_owned()))
}
