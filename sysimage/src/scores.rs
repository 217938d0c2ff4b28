// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use tracing::debug;

use crate::index::{Image, ImageKind};

const MIB: u64 = 1024 * 1024;

/// Penalty added to every path that does not reach the highest candidate
/// version. Large enough that such a path can never win against one that
/// does.
const NOT_MAX_PENALTY: i64 = 9000;

/// Weight added per full image in a path.
const FULL_WEIGHT: i64 = 100;

/// A candidate selection policy. Lowest score wins.
pub trait Scorer: Send {
    fn name(&self) -> &'static str;

    /// Return one score per candidate path. The returned list must be the
    /// same length as `candidates`.
    fn score(&self, candidates: &[Vec<&Image>]) -> Vec<i64>;
}

/// The default policy:
///
/// - every full image in a path adds 100;
/// - every step adds its download size rounded to the nearest MiB;
/// - a path whose target version is not the highest among the candidates
///   adds 9000.
pub struct WeightedScorer;

impl Scorer for WeightedScorer {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn score(&self, candidates: &[Vec<&Image>]) -> Vec<i64> {
        let max_target = candidates
            .iter()
            .filter_map(|path| path.last().map(|i| i.version))
            .max()
            .unwrap_or(0);

        candidates
            .iter()
            .map(|path| {
                let fulls = path.iter().filter(|i| i.kind == ImageKind::Full).count();
                let size_mib: i64 = path
                    .iter()
                    .map(|i| ((i.size() + MIB / 2) / MIB) as i64)
                    .sum();

                let mut score = FULL_WEIGHT * fulls as i64 + size_mib;
                if path.last().map(|i| i.version) != Some(max_target) {
                    score += NOT_MAX_PENALTY;
                }

                score
            })
            .collect()
    }
}

/// Look up a scorer by its configured policy name.
pub fn by_name(name: &str) -> Option<Box<dyn Scorer>> {
    match name {
        "weighted" => Some(Box::new(WeightedScorer)),
        _ => None,
    }
}

/// Choose the winning path: lowest score, ties broken by smaller total byte
/// size, then by shorter path. Returns `None` when there are no candidates.
pub fn choose<'a>(scorer: &dyn Scorer, candidates: Vec<Vec<&'a Image>>) -> Option<Vec<&'a Image>> {
    if candidates.is_empty() {
        return None;
    }

    let scores = scorer.score(&candidates);
    debug_assert_eq!(scores.len(), candidates.len());

    for (score, path) in scores.iter().zip(&candidates) {
        let versions: Vec<String> = path.iter().map(|i| i.version.to_string()).collect();
        debug!("{} path [{score:5}] -> {}", scorer.name(), versions.join(":"));
    }

    candidates
        .into_iter()
        .zip(scores)
        .min_by_key(|(path, score)| {
            let total_bytes: u64 = path.iter().map(|i| i.size()).sum();
            (*score, total_bytes, path.len())
        })
        .map(|(path, _)| path)
}
