// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! A minimal loopback HTTP server for exercising the download pipeline.
//! Serves files from a directory, supports HEAD and `Range: bytes=N-`
//! requests, and can throttle responses so tests can pause mid-transfer.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

pub struct Server {
    pub port: u16,
    pub requests: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Serve `root` on an ephemeral localhost port. When `throttle` is set,
    /// response bodies are written in small chunks with a delay, so a
    /// transfer stays in flight long enough to be paused.
    pub fn start(root: PathBuf, throttle: Option<Duration>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let requests = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_requests = requests.clone();
        let thread_shutdown = shutdown.clone();

        thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        thread_requests.fetch_add(1, Ordering::SeqCst);

                        let root = root.clone();
                        thread::spawn(move || {
                            let _ = handle_connection(stream, &root, throttle);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            port,
            requests,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.port, path.trim_start_matches('/'))
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn handle_connection(
    stream: TcpStream,
    root: &PathBuf,
    throttle: Option<Duration>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();

    let mut range_start: Option<u64> = None;

    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }

        if let Some(value) = line.to_ascii_lowercase().strip_prefix("range:") {
            let value = value.trim();
            if let Some(spec) = value.strip_prefix("bytes=") {
                if let Some(start) = spec.strip_suffix('-') {
                    range_start = start.parse().ok();
                }
            }
        }
    }

    let mut stream = stream;
    let local = root.join(path.trim_start_matches('/'));

    let Ok(data) = std::fs::read(&local) else {
        stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
        return Ok(());
    };

    let total = data.len() as u64;
    let (status, body) = match range_start {
        Some(start) if start < total => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{}/{total}\r\n",
                total - 1,
            ),
            &data[start as usize..],
        ),
        _ => ("HTTP/1.1 200 OK\r\n".to_owned(), &data[..]),
    };

    write!(
        stream,
        "{status}Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len(),
    )?;

    if method == "HEAD" {
        return Ok(());
    }

    match throttle {
        None => stream.write_all(body)?,
        Some(delay) => {
            for chunk in body.chunks(16 * 1024) {
                stream.write_all(chunk)?;
                stream.flush()?;
                thread::sleep(delay);
            }
        }
    }

    Ok(())
}
