//! Unified error type for sealing and opening bundles
//!
//! Internal modules keep their own error enums ([`FormatError`],
//! [`KeyStoreError`], [`ManifestError`], ...). `seal` and `open` collapse
//! them into one [`BundleError`] per call, following a fixed taxonomy.
//! Every variant is terminal: retrying a cryptographic failure cannot change
//! its outcome.
//!
//! # Example
//!
//! ```no_run
//! use sitebundle::{BundleError, MemoryKeyStore, Verifier};
//!
//! # fn fetch_from_another_peer() -> Vec<u8> { Vec::new() }
//! # fn example(bytes: &[u8], keys: &MemoryKeyStore) -> Result<(), BundleError> {
//! match Verifier::new(keys).open(bytes) {
//!     Ok(tree) => println!("{} files", tree.len()),
//!     Err(e) if e.should_refetch() => {
//!         let _retry = fetch_from_another_peer();
//!     }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

use crate::format::FormatError;
use crate::identity::SiteIdentity;
use crate::keystore::{describe_version, KeyStoreError, KeyVersion};
use thiserror::Error;

/// Error returned by every `seal` and `open` operation
#[derive(Debug, Error)]
pub enum BundleError {
    /// Structural decode failure, or an authenticated manifest that
    /// violates the bundle invariants
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    /// Bundle written by a newer format than this crate understands
    #[error("Unsupported bundle format version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// Bundle declares a different site than the caller expected
    #[error("Site identity mismatch: expected '{expected}', bundle declares '{found}'")]
    IdentityMismatch {
        expected: SiteIdentity,
        found: SiteIdentity,
    },

    #[error("No key for site '{identity}' ({})", describe_version(.version))]
    KeyNotFound {
        identity: SiteIdentity,
        version: Option<KeyVersion>,
    },

    #[error("Key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    /// Authentication or content-hash failure anywhere in the bundle
    #[error("Tamper detected: {0}")]
    TamperDetected(String),

    /// Authoring-side I/O or key failure
    #[error("Packaging failed: {0}")]
    PackagingFailed(String),
}

impl BundleError {
    /// Always false: no bundle error is resolved by retrying locally
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// True when the bundle copy itself is bad and another peer may hold a
    /// good one
    pub fn should_refetch(&self) -> bool {
        matches!(self, Self::TamperDetected(_))
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::TamperDetected(_) | Self::MalformedBundle(_) => {
                Some("Discard this copy and fetch the bundle from a different peer")
            }
            Self::UnsupportedVersion { .. } => {
                Some("Upgrade the client to read this bundle format")
            }
            Self::IdentityMismatch { .. } => {
                Some("The peer served a bundle for a different site; do not render it")
            }
            Self::KeyNotFound { .. } => {
                Some("Import the site's key (or the retired version it was sealed with)")
            }
            Self::KeyStoreUnavailable(_) => Some("Check that the key directory is readable"),
            Self::PackagingFailed(_) => None,
        }
    }

    /// Returns true for authentication and hash failures
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::TamperDetected(_))
    }

    /// Returns true for key resolution failures
    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::KeyStoreUnavailable(_))
    }

    /// Returns true for structural problems with the bundle bytes
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedBundle(_) | Self::UnsupportedVersion { .. }
        )
    }
}

impl From<FormatError> for BundleError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::UnsupportedVersion { found, supported } => {
                BundleError::UnsupportedVersion { found, supported }
            }
            other => BundleError::MalformedBundle(other.to_string()),
        }
    }
}

/// Key errors on the consuming side. The packager maps them to
/// `PackagingFailed` instead.
impl From<KeyStoreError> for BundleError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::NotFound { identity, version } => {
                BundleError::KeyNotFound { identity, version }
            }
            KeyStoreError::Unavailable(reason) => BundleError::KeyStoreUnavailable(reason),
            other @ KeyStoreError::VersionExists { .. } => {
                BundleError::KeyStoreUnavailable(other.to_string())
            }
        }
    }
}
