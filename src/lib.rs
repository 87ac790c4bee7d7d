//! Sealed, self-authenticating site bundles
//!
//! A bundle packs a static site (a tree of files) into one opaque byte
//! string. Every file and the manifest indexing them are encrypted with
//! AES-256-GCM under the site's key, and each record's associated data
//! binds it to the site identity, key version, record count and its own
//! position. Peers can relay bundles without being trusted: opening either
//! yields the exact tree that was sealed or fails without exposing content.
//!
//! * [`Packager`] seals a [`SiteTree`] into a [`Bundle`]
//! * [`Verifier`] authenticates and decrypts bundle bytes into a [`FileTree`]
//! * [`KeyStore`] resolves a site's key by identity and version
//!   ([`MemoryKeyStore`], [`FileKeyStore`])

pub mod binary;
pub mod crypto;
pub mod error;
pub mod format;
pub mod identity;
pub mod keystore;
pub mod manifest;
pub mod packager;
mod parallel;
pub mod prelude;
pub mod site;
pub mod verifier;

pub use binary::{BinaryRead, BinaryWrite};
pub use crypto::{AesKey, CryptoError, NonceSequence};
pub use error::BundleError;
pub use format::{Bundle, BundleHeader, BundleInfo, FormatError, SealedRecord, FORMAT_VERSION};
pub use identity::{IdentityError, SiteIdentity};
pub use keystore::{
    FileKeyStore, KeyMaterial, KeyStore, KeyStoreError, KeyVersion, MemoryKeyStore, SiteKeyRing,
};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
pub use packager::Packager;
pub use site::{FileEntry, FileTree, SiteError, SiteTree};
pub use verifier::Verifier;
