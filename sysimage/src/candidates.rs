// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::VecDeque;

use crate::index::{Image, ImageKind, Index};

/// Restrict candidate paths to full-only or delta-only upgrades.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    Full,
    Delta,
}

/// Calculate all candidate upgrade paths from the current build to every
/// maximal version reachable in the index.
///
/// Images are eligible only if they are newer than the current build, their
/// `minversion` (if any) does not exceed the current build, and their phased
/// percentage admits this device. Each eligible full newer than the current
/// build roots a path, as does each eligible delta based directly on the
/// current build. Paths are then extended with deltas chained on the
/// previous step's version until no further step exists; a fork (two deltas
/// sharing a base) splits the path.
///
/// The returned paths are not sorted or prioritized in any way. The list is
/// empty if the device is already at the latest build or too old to update.
pub fn get_candidates(index: &Index, build: u64, device_percentage: u8) -> Vec<Vec<&Image>> {
    let mut fulls = vec![];
    let mut deltas = vec![];

    for image in &index.images {
        if image.version <= build {
            continue;
        }
        if image.minversion.is_some_and(|m| build < m) {
            continue;
        }
        if image.phased_percentage() < device_percentage {
            continue;
        }

        match image.kind {
            ImageKind::Full => fulls.push(image),
            ImageKind::Delta => deltas.push(image),
        }
    }

    let mut queue: VecDeque<Vec<&Image>> = VecDeque::new();

    for image in &fulls {
        queue.push_back(vec![image]);
    }
    for image in &deltas {
        if image.base == Some(build) {
            queue.push_back(vec![image]);
        }
    }

    let mut paths = vec![];

    while let Some(mut path) = queue.pop_front() {
        loop {
            let current = *path.last().unwrap();

            // Chase deltas whose base is the current step. The version guard
            // keeps a malformed index from producing an endless chain.
            let mut next: Vec<&Image> = deltas
                .iter()
                .copied()
                .filter(|d| d.base == Some(current.version) && d.version > current.version)
                .collect();

            if next.is_empty() {
                paths.push(path);
                break;
            }

            let step = next.remove(0);
            for fork in next {
                let mut forked = path.clone();
                forked.push(fork);
                queue.push_back(forked);
            }

            path.push(step);
        }
    }

    paths
}

/// Apply a full-only or delta-only restriction to candidate paths.
pub fn apply_filter<'a>(paths: Vec<Vec<&'a Image>>, filter: Filter) -> Vec<Vec<&'a Image>> {
    match filter {
        Filter::Full => full_filter(paths),
        Filter::Delta => delta_filter(paths),
    }
}

/// Reduce each path to the last full image at its start, dropping paths
/// that do not begin with a full.
fn full_filter<'a>(paths: Vec<Vec<&'a Image>>) -> Vec<Vec<&'a Image>> {
    let mut filtered = vec![];

    for path in paths {
        let full = path
            .iter()
            .take_while(|i| i.kind == ImageKind::Full)
            .last()
            .copied();

        if let Some(full) = full {
            filtered.push(vec![full]);
        }
    }

    filtered
}

/// Reduce each path to the deltas at its start, dropping paths that do not
/// begin with a delta.
fn delta_filter<'a>(paths: Vec<Vec<&'a Image>>) -> Vec<Vec<&'a Image>> {
    let mut filtered = vec![];

    for path in paths {
        let prefix: Vec<&Image> = path
            .iter()
            .take_while(|i| i.kind == ImageKind::Delta)
            .copied()
            .collect();

        if !prefix.is_empty() {
            filtered.push(prefix);
        }
    }

    filtered
}

/// Truncate the trailing steps of a winning path whose version exceeds the
/// cap. Returns `None` when nothing is left.
pub fn version_filter<'a>(winner: &[&'a Image], maximum: u64) -> Option<Vec<&'a Image>> {
    let capped: Vec<&Image> = winner
        .iter()
        .copied()
        .take_while(|i| i.version <= maximum)
        .collect();

    if capped.is_empty() {
        None
    } else {
        Some(capped)
    }
}
