// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

//! Download pipeline behavior against a local HTTP server.

mod support;

use std::{fs, thread, time::Duration};

use sha2::{Digest, Sha256};
use sysimage::download::{
    self, BatchOptions, BatchStatus, DownloadRequest, Downloader, LinkType,
    http::HttpDownloader,
};

use support::Server;

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn batch_downloads_and_verifies() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let a = patterned(100_000);
    let b = patterned(50_000);
    fs::write(served.path().join("a.bin"), &a).unwrap();
    fs::write(served.path().join("b.bin"), &b).unwrap();

    let server = Server::start(served.path().to_owned(), None);
    let downloader = HttpDownloader::new(Duration::from_secs(30));

    let requests = vec![
        DownloadRequest {
            url: server.url("a.bin"),
            dest: dest.path().join("a.bin"),
            checksum: Some(checksum(&a)),
            size: a.len() as u64,
        },
        DownloadRequest {
            url: server.url("b.bin"),
            dest: dest.path().join("b.bin"),
            checksum: Some(checksum(&b)),
            size: b.len() as u64,
        },
    ];

    let handle = downloader
        .enqueue(requests, &BatchOptions::default())
        .unwrap();

    assert_eq!(handle.wait().unwrap(), BatchStatus::Completed);
    assert_eq!(fs::read(dest.path().join("a.bin")).unwrap(), a);
    assert_eq!(fs::read(dest.path().join("b.bin")).unwrap(), b);

    let progress = handle.progress();
    assert_eq!(progress.received, (a.len() + b.len()) as u64);
    assert_eq!(progress.percent(), 100);
}

#[test]
fn duplicate_destination_rejected_before_any_download() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let server = Server::start(served.path().to_owned(), None);
    let downloader = HttpDownloader::new(Duration::from_secs(30));

    let requests = vec![
        DownloadRequest {
            url: server.url("one.bin"),
            dest: dest.path().join("image.bin"),
            checksum: Some("aa".repeat(32)),
            size: 10,
        },
        DownloadRequest {
            url: server.url("two.bin"),
            dest: dest.path().join("image.bin"),
            checksum: Some("bb".repeat(32)),
            size: 10,
        },
    ];

    let result = downloader.enqueue(requests, &BatchOptions::default());

    assert!(matches!(
        result.err(),
        Some(download::Error::DuplicateDestination(_)),
    ));
    // Nothing may have been fetched.
    assert_eq!(server.request_count(), 0);
}

#[test]
fn checksum_mismatch_cancels_batch() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let data = patterned(10_000);
    fs::write(served.path().join("bad.bin"), &data).unwrap();

    let server = Server::start(served.path().to_owned(), None);
    let downloader = HttpDownloader::new(Duration::from_secs(30));

    let requests = vec![DownloadRequest {
        url: server.url("bad.bin"),
        dest: dest.path().join("bad.bin"),
        checksum: Some("00".repeat(32)),
        size: data.len() as u64,
    }];

    let handle = downloader
        .enqueue(requests, &BatchOptions::default())
        .unwrap();

    assert!(matches!(
        handle.wait(),
        Err(download::Error::ChecksumMismatch { .. }),
    ));
    assert!(!dest.path().join("bad.bin").exists());
    assert!(!dest.path().join("bad.bin.partial").exists());
}

#[test]
fn pause_and_resume_preserve_content() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    // Big enough, and served slowly enough, that the pause lands while the
    // transfer is still in flight.
    let data = patterned(4 * 1024 * 1024);
    fs::write(served.path().join("image.bin"), &data).unwrap();

    let server = Server::start(served.path().to_owned(), Some(Duration::from_millis(10)));
    let downloader = HttpDownloader::new(Duration::from_secs(120));

    let requests = vec![DownloadRequest {
        url: server.url("image.bin"),
        dest: dest.path().join("image.bin"),
        checksum: Some(checksum(&data)),
        size: data.len() as u64,
    }];

    let handle = downloader
        .enqueue(requests, &BatchOptions::default())
        .unwrap();

    // Wait for roughly half the file before pausing.
    loop {
        let progress = handle.progress();
        if progress.percent() >= 40 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    handle.pause();

    assert_eq!(handle.wait().unwrap(), BatchStatus::Paused);

    // The partial file survives the pause.
    let partial = dest.path().join("image.bin.partial");
    assert!(partial.exists());
    let partial_len = fs::metadata(&partial).unwrap().len();
    assert!(partial_len > 0);
    assert!((partial_len as usize) < data.len());

    handle.resume();
    assert_eq!(handle.wait().unwrap(), BatchStatus::Completed);

    // The reassembled file is bit-identical to the source.
    assert_eq!(fs::read(dest.path().join("image.bin")).unwrap(), data);
    assert!(!partial.exists());
}

#[test]
fn gsm_gated_batch_stays_queued_until_resumed() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let data = patterned(10_000);
    fs::write(served.path().join("image.bin"), &data).unwrap();

    let server = Server::start(served.path().to_owned(), None);
    let downloader = HttpDownloader::new(Duration::from_secs(30));

    let requests = vec![DownloadRequest {
        url: server.url("image.bin"),
        dest: dest.path().join("image.bin"),
        checksum: Some(checksum(&data)),
        size: data.len() as u64,
    }];

    let options = BatchOptions {
        allow_gsm: false,
        link: LinkType::Cellular,
        ..Default::default()
    };

    let handle = downloader.enqueue(requests, &options).unwrap();

    // Queued, not failed: nothing was fetched.
    assert_eq!(handle.wait().unwrap(), BatchStatus::Paused);
    assert_eq!(server.request_count(), 0);

    // The one-shot override resumes the batch.
    handle.resume();
    assert_eq!(handle.wait().unwrap(), BatchStatus::Completed);
    assert_eq!(fs::read(dest.path().join("image.bin")).unwrap(), data);
}

#[test]
fn cancel_discards_partial_files() {
    let served = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let data = patterned(4 * 1024 * 1024);
    fs::write(served.path().join("image.bin"), &data).unwrap();

    let server = Server::start(served.path().to_owned(), Some(Duration::from_millis(10)));
    let downloader = HttpDownloader::new(Duration::from_secs(120));

    let requests = vec![DownloadRequest {
        url: server.url("image.bin"),
        dest: dest.path().join("image.bin"),
        checksum: Some(checksum(&data)),
        size: data.len() as u64,
    }];

    let handle = downloader
        .enqueue(requests, &BatchOptions::default())
        .unwrap();

    loop {
        if handle.progress().received > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    handle.cancel();

    assert!(matches!(handle.wait(), Err(download::Error::Cancelled)));
    assert!(!dest.path().join("image.bin").exists());
    assert!(!dest.path().join("image.bin.partial").exists());
}
