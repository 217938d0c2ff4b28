// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse index file")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid generated_at timestamp: {0:?}")]
    Timestamp(String),
    #[error("Unknown image type: {0:?}")]
    UnknownType(String),
    #[error("Delta image {0} has no base version")]
    DeltaWithoutBase(u64),
    #[error("Image {version} file {path:?} has an invalid checksum: {checksum:?}")]
    BadChecksum {
        version: u64,
        path: String,
        checksum: String,
    },
    #[error("Image {0} has an out-of-range phased percentage: {1}")]
    BadPhasedPercentage(u64, u64),
}

type Result<T> = std::result::Result<T, Error>;

/// Timestamps in the index are always UTC in this fixed format.
const GENERATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S UTC %Y";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Full,
    Delta,
}

/// One downloadable file of an image. The list order within an image is
/// significant and is preserved end to end.
#[derive(Clone, Debug, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub signature: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
    pub size: u64,
    pub order: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub kind: ImageKind,
    pub version: u64,
    /// Only present for deltas.
    pub base: Option<u64>,
    pub descriptions: BTreeMap<String, String>,
    phased_percentage: Option<u8>,
    pub minversion: Option<u64>,
    /// Component version breakdown (`name=version,...`) of the build.
    pub version_detail: Option<String>,
    pub files: Vec<FileRecord>,
}

impl Image {
    /// Total download size of the image in bytes.
    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Rollout gate. Defaults to 100 (everyone).
    pub fn phased_percentage(&self) -> u8 {
        self.phased_percentage.unwrap_or(100)
    }

    pub fn description(&self, locale: Option<&str>) -> Option<&str> {
        if let Some(locale) = locale {
            if let Some(d) = self.descriptions.get(&format!("description_{locale}")) {
                return Some(d);
            }
        }

        self.descriptions.get("description").map(|d| d.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct Index {
    pub generated_at: DateTime<Utc>,
    pub images: Vec<Image>,
}

#[derive(Deserialize)]
struct RawGlobal {
    generated_at: String,
}

#[derive(Deserialize)]
struct RawFile {
    path: String,
    signature: String,
    checksum: String,
    size: u64,
    #[serde(default)]
    order: u32,
}

#[derive(Deserialize)]
struct RawImage {
    #[serde(rename = "type")]
    kind: String,
    version: u64,
    base: Option<u64>,
    #[serde(rename = "phased-percentage")]
    phased_percentage: Option<u64>,
    minversion: Option<u64>,
    version_detail: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawIndex {
    global: RawGlobal,
    images: Vec<RawImage>,
}

impl Index {
    pub fn parse(data: &str) -> Result<Self> {
        let raw: RawIndex = serde_json::from_str(data).map_err(Error::Parse)?;

        let generated_at = NaiveDateTime::parse_from_str(&raw.global.generated_at, GENERATED_AT_FORMAT)
            .map_err(|_| Error::Timestamp(raw.global.generated_at.clone()))?
            .and_utc();

        let images = raw
            .images
            .into_iter()
            .map(convert_image)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            generated_at,
            images,
        })
    }

    /// The highest image version in the index, or 0 when empty.
    pub fn max_version(&self) -> u64 {
        self.images.iter().map(|i| i.version).max().unwrap_or(0)
    }
}

fn convert_image(raw: RawImage) -> Result<Image> {
    let kind = match raw.kind.as_str() {
        "full" => ImageKind::Full,
        "delta" => ImageKind::Delta,
        other => return Err(Error::UnknownType(other.to_owned())),
    };

    if kind == ImageKind::Delta && raw.base.is_none() {
        return Err(Error::DeltaWithoutBase(raw.version));
    }

    let phased_percentage = match raw.phased_percentage {
        Some(p) if p > 100 => return Err(Error::BadPhasedPercentage(raw.version, p)),
        Some(p) => Some(p as u8),
        None => None,
    };

    let files = raw
        .files
        .into_iter()
        .map(|f| {
            let valid = f.checksum.len() == 64
                && f.checksum.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
            if !valid {
                return Err(Error::BadChecksum {
                    version: raw.version,
                    path: f.path,
                    checksum: f.checksum,
                });
            }

            Ok(FileRecord {
                path: f.path,
                signature: f.signature,
                checksum: f.checksum,
                size: f.size,
                order: f.order,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Descriptions can be "description" or "description_<locale>". The keys
    // are preserved exactly as given.
    let descriptions = raw
        .extra
        .into_iter()
        .filter(|(k, _)| k.starts_with("description"))
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_owned())))
        .collect();

    Ok(Image {
        kind,
        version: raw.version,
        base: if kind == ImageKind::Delta { raw.base } else { None },
        descriptions,
        phased_percentage,
        minversion: raw.minversion,
        version_detail: raw.version_detail,
        files,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_JSON: &str = r#"{
        "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
        "images": [
            {
                "type": "full",
                "version": 200,
                "description": "Full build",
                "description_fr": "Version complète",
                "phased-percentage": 50,
                "files": [
                    {
                        "path": "/pool/full-200.tar.gz",
                        "signature": "/pool/full-200.tar.gz.asc",
                        "checksum": "62f0ea2ab9a3bf965a1009e6e3e3eb69ebf2a94d9d1249bf61b6a2f3a8a9e7a1",
                        "size": 104857600,
                        "order": 0
                    }
                ]
            },
            {
                "type": "delta",
                "version": 201,
                "base": 200,
                "description": "Delta build",
                "files": []
            }
        ]
    }"#;

    #[test]
    fn parse_index() {
        let index = Index::parse(INDEX_JSON).unwrap();

        assert_eq!(index.images.len(), 2);
        assert_eq!(index.max_version(), 201);

        let full = &index.images[0];
        assert_eq!(full.kind, ImageKind::Full);
        assert_eq!(full.version, 200);
        assert_eq!(full.base, None);
        assert_eq!(full.phased_percentage(), 50);
        assert_eq!(full.size(), 104857600);
        assert_eq!(full.description(None), Some("Full build"));
        assert_eq!(full.description(Some("fr")), Some("Version complète"));
        assert_eq!(full.description(Some("de")), Some("Full build"));

        let delta = &index.images[1];
        assert_eq!(delta.kind, ImageKind::Delta);
        assert_eq!(delta.base, Some(200));
        assert_eq!(delta.phased_percentage(), 100);
    }

    #[test]
    fn delta_without_base_is_structural() {
        let data = r#"{
            "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
            "images": [ { "type": "delta", "version": 201, "files": [] } ]
        }"#;

        assert!(matches!(
            Index::parse(data),
            Err(Error::DeltaWithoutBase(201)),
        ));
    }

    #[test]
    fn bad_checksum_rejected() {
        let data = r#"{
            "global": { "generated_at": "Mon Apr 29 18:45:27 UTC 2013" },
            "images": [
                {
                    "type": "full",
                    "version": 200,
                    "files": [
                        {
                            "path": "/pool/full.tar.gz",
                            "signature": "/pool/full.tar.gz.asc",
                            "checksum": "DEADBEEF",
                            "size": 1,
                            "order": 0
                        }
                    ]
                }
            ]
        }"#;

        assert!(matches!(Index::parse(data), Err(Error::BadChecksum { .. })));
    }

    #[test]
    fn non_utc_timestamp_rejected() {
        let data = r#"{
            "global": { "generated_at": "Mon Apr 29 18:45:27 PDT 2013" },
            "images": []
        }"#;

        assert!(matches!(Index::parse(data), Err(Error::Timestamp(_))));
    }
}
