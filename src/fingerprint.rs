//! Content fingerprints for normalized specs
//!
//! A fingerprint is the SHA-256 of the normalized spec plus everything else
//! that changes the built image: resolver version, builder version and
//! target platform. It is both the cache key and the image tag.

use crate::spec::{NormalizedSpec, Platform};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of the short form used in logs and build directory names
const SHORT_LEN: usize = 12;

/// Hex-encoded SHA-256 fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a 64 character lower-case hex digest
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        let valid = hex.len() == 64 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        valid.then_some(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value.clone()).ok_or_else(|| format!("invalid fingerprint '{}'", value))
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Feed one tagged, length-prefixed field into the hasher.
///
/// The tag and explicit length keep adjacent fields from running into each
/// other: `("ab", "c")` and `("a", "bc")` hash differently.
fn update_field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update((tag.len() as u64).to_be_bytes());
    hasher.update(tag);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

/// Compute the fingerprint of a normalized spec in a resolver/builder/platform context
pub fn fingerprint(
    spec: &NormalizedSpec,
    resolver_version: &str,
    builder_version: &str,
    platform: &Platform,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, b"uvimage-fingerprint", b"1");
    update_field(&mut hasher, b"spec", &spec.canonical_bytes());
    update_field(&mut hasher, b"resolver", resolver_version.as_bytes());
    update_field(&mut hasher, b"builder", builder_version.as_bytes());
    update_field(&mut hasher, b"platform", platform.to_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}
