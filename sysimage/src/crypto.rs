// SPDX-FileCopyrightText: 2024 The sysimage developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashSet, io, path::Path};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey},
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No public keys found in PEM data")]
    NoKeys,
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load public key")]
    LoadKey(#[source] rsa::pkcs8::spki::Error),
    #[error("Failed to encode public key")]
    EncodeKey(#[source] rsa::pkcs8::spki::Error),
    #[error("Signature is not valid base64")]
    SignatureEncoding(#[source] base64::DecodeError),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_END: &str = "-----END PUBLIC KEY-----";

/// Read all PEM-encoded SPKI public keys from a string. A keyring may
/// contain more than one key block.
pub fn read_pem_public_keys(data: &str) -> Result<Vec<RsaPublicKey>> {
    let mut keys = vec![];
    let mut rest = data;

    while let Some(start) = rest.find(PEM_BEGIN) {
        let Some(end) = rest[start..].find(PEM_END) else {
            return Err(Error::PemNoEndTag);
        };

        let block = &rest[start..start + end + PEM_END.len()];
        keys.push(RsaPublicKey::from_public_key_pem(block).map_err(Error::LoadKey)?);

        rest = &rest[start + end + PEM_END.len()..];
    }

    if keys.is_empty() {
        return Err(Error::NoKeys);
    }

    Ok(keys)
}

/// The fingerprint of a public key: the lowercase hex SHA-256 digest of its
/// SPKI DER encoding. Blacklists match on fingerprints.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String> {
    let der = key.to_public_key_der().map_err(Error::EncodeKey)?;

    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}

/// Produce a detached signature over `data`: the base64 encoding of the
/// RSA PKCS#1 v1.5 signature of the SHA-256 digest. This is what `.asc`
/// files contain. Signing happens on the server side; the client uses this
/// only for generating test fixtures and local keyring tooling.
pub fn sign_detached(data: &[u8], key: &RsaPrivateKey) -> Result<String> {
    let digest = Sha256::digest(data);
    let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;

    Ok(BASE64_STANDARD.encode(signature))
}

/// A signature verification context over a fixed set of trusted keys. The
/// verifier never consults ambient trust; only the keys passed in (minus
/// any blacklisted fingerprints) can validate a signature.
pub struct Verifier {
    keys: Vec<(String, RsaPublicKey)>,
    blacklist: HashSet<String>,
}

impl Verifier {
    pub fn new(keys: Vec<RsaPublicKey>, blacklist: HashSet<String>) -> Result<Self> {
        let keys = keys
            .into_iter()
            .map(|k| Ok((fingerprint(&k)?, k)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { keys, blacklist })
    }

    /// Verify a detached signature over raw data.
    pub fn verify_data(&self, data: &[u8], signature: &str) -> Result<bool> {
        let digest = Sha256::digest(data);

        self.verify_digest(&digest, signature)
    }

    /// Verify the detached signature file `signature` against the data file
    /// `data`.
    pub fn verify(&self, data: &Path, signature: &Path) -> Result<bool> {
        let digest = util::sha256_file(data)?;
        let encoded = std::fs::read_to_string(signature)?;

        self.verify_digest(&digest, &encoded)
    }

    fn verify_digest(&self, digest: &[u8], signature: &str) -> Result<bool> {
        let filtered: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let raw = BASE64_STANDARD
            .decode(filtered)
            .map_err(Error::SignatureEncoding)?;

        let good = self
            .keys
            .iter()
            .filter(|(fp, _)| !self.blacklist.contains(fp))
            .any(|(_, key)| {
                key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, &raw)
                    .is_ok()
            });

        Ok(good)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rsa::pkcs8::LineEnding;

    use super::*;

    pub fn generate_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
    }

    pub fn public_pem(key: &RsaPrivateKey) -> String {
        key.to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
    }
}
