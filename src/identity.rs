//! Site identities
//!
//! A [`SiteIdentity`] names the site a bundle belongs to. It selects the key
//! ring in the key store and is bound into every sealed record, so a bundle
//! for one site can never be accepted under another site's name.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Longest identity accepted, in UTF-8 bytes
pub const MAX_IDENTITY_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Site identity must not be empty")]
    Empty,
    #[error("Site identity is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("Site identity contains control character {0:?}")]
    ControlCharacter(char),
}

/// Stable identifier for a site (e.g. `news.freedom` or a key fingerprint)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteIdentity(String);

impl SiteIdentity {
    /// Create a validated identity
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong {
                len: name.len(),
                max: MAX_IDENTITY_LEN,
            });
        }
        if let Some(c) = name.chars().find(|c| c.is_control()) {
            return Err(IdentityError::ControlCharacter(c));
        }
        Ok(Self(name))
    }

    /// Derive a content-addressed identity from a publisher's public key bytes
    ///
    /// The result is the lowercase hex SHA-256 of `public_key` with the
    /// `.freedom` suffix, so it is always a valid identity.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(format!("{}.freedom", hex::encode(Sha256::digest(public_key))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Hex SHA-256 of the identity, safe to use as a file name
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for SiteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SiteIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SiteIdentity {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SiteIdentity> for String {
    fn from(value: SiteIdentity) -> Self {
        value.0
    }
}
