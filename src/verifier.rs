//! Consuming side: authenticate, decrypt and reconstruct a site
//!
//! Opening is atomic. The envelope is decoded and validated first, then the
//! manifest record is authenticated, and only then are entry records
//! touched. Any authentication or hash failure aborts the whole open with
//! [`BundleError::TamperDetected`]; a partially decrypted tree is never
//! returned.

use crate::crypto;
use crate::error::BundleError;
use crate::format::{Bundle, BundleHeader, BundleInfo, SealedRecord};
use crate::identity::SiteIdentity;
use crate::keystore::{KeyMaterial, KeyStore};
use crate::manifest::{Manifest, ManifestEntry, MANIFEST_INDEX};
use crate::parallel;
use crate::site::{FileEntry, FileTree};
use tracing::{debug, info, warn};

/// Opens bundles using keys from a [`KeyStore`]
pub struct Verifier<'a> {
    keys: &'a dyn KeyStore,
    expected: Option<SiteIdentity>,
    parallelism: usize,
}

impl<'a> Verifier<'a> {
    pub fn new(keys: &'a dyn KeyStore) -> Self {
        Self {
            keys,
            expected: None,
            parallelism: 1,
        }
    }

    /// Reject bundles that declare any other site
    #[must_use]
    pub fn expect_identity(mut self, identity: SiteIdentity) -> Self {
        self.expected = Some(identity);
        self
    }

    /// Number of worker threads used to open entries
    #[must_use]
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }

    /// Structural summary of a bundle; no key needed and nothing decrypted
    pub fn inspect(bytes: &[u8]) -> Result<BundleInfo, BundleError> {
        Ok(Bundle::from_bytes(bytes)?.describe(bytes))
    }

    /// Verify and decrypt `bytes` into a file tree
    pub fn open(&self, bytes: &[u8]) -> Result<FileTree, BundleError> {
        let result = self.open_inner(bytes);
        if let Err(e) = &result {
            warn!(error = %e, "Rejected site bundle");
        }
        result
    }

    fn open_inner(&self, bytes: &[u8]) -> Result<FileTree, BundleError> {
        let bundle = Bundle::from_bytes(bytes)?;
        let header = &bundle.header;

        if let Some(expected) = &self.expected {
            if expected != &header.site_identity {
                return Err(BundleError::IdentityMismatch {
                    expected: expected.clone(),
                    found: header.site_identity.clone(),
                });
            }
        }

        let material = self
            .keys
            .resolve(&header.site_identity, Some(header.key_version))?;
        let entry_count = bundle.entry_count();

        let manifest = open_manifest(&material, &bundle)?;
        manifest
            .validate(entry_count)
            .map_err(|e| BundleError::MalformedBundle(format!("manifest: {}", e)))?;

        // Structural decode guarantees each index in 1..=entry_count has
        // exactly one record, so the lookup below cannot miss
        let mut records: Vec<Option<&SealedRecord>> = vec![None; entry_count as usize];
        for record in &bundle.entries {
            records[record.entry_index as usize - 1] = Some(record);
        }
        let pairs = manifest
            .entries
            .iter()
            .zip(records)
            .map(|(entry, record)| {
                record.map(|record| (entry, record)).ok_or_else(|| {
                    BundleError::MalformedBundle(format!(
                        "no record for entry {}",
                        entry.entry_index
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let files = parallel::try_map(&pairs, self.parallelism, |(entry, record)| {
            open_entry(&material, header, entry_count, entry, record)
        })?;

        info!(
            site = %header.site_identity,
            key_version = %header.key_version,
            entries = files.len(),
            "Opened site bundle"
        );
        Ok(FileTree::new(manifest.index, files))
    }
}

fn open_manifest(material: &KeyMaterial, bundle: &Bundle) -> Result<Manifest, BundleError> {
    let header = &bundle.header;
    let plaintext = open_record(material, header, bundle.entry_count(), &bundle.manifest)
        .map_err(|_| BundleError::TamperDetected("manifest failed authentication".to_string()))?;

    let manifest = Manifest::from_bytes(&plaintext)
        .map_err(|e| BundleError::MalformedBundle(format!("manifest is not valid JSON: {}", e)))?;
    if manifest.site_identity != header.site_identity.as_str() {
        return Err(BundleError::TamperDetected(format!(
            "manifest names site '{}' but envelope names '{}'",
            manifest.site_identity, header.site_identity
        )));
    }
    debug!(entries = manifest.entries.len(), "Authenticated manifest");
    Ok(manifest)
}

fn open_entry(
    material: &KeyMaterial,
    header: &BundleHeader,
    entry_count: u32,
    entry: &ManifestEntry,
    record: &SealedRecord,
) -> Result<FileEntry, BundleError> {
    let contents = open_record(material, header, entry_count, record).map_err(|_| {
        BundleError::TamperDetected(format!(
            "entry {} ({}) failed authentication",
            entry.entry_index, entry.path
        ))
    })?;

    let intact = entry
        .matches(&contents)
        .map_err(|e| BundleError::MalformedBundle(e.to_string()))?;
    if !intact {
        return Err(BundleError::TamperDetected(format!(
            "entry {} ({}) does not match its manifest hash",
            entry.entry_index, entry.path
        )));
    }

    debug!(entry_index = entry.entry_index, path = %entry.path, "Verified entry");
    Ok(FileEntry {
        path: entry.path.clone(),
        contents,
        mime_type: entry.mime_type.clone(),
        hash: entry.hash.clone(),
    })
}

fn open_record(
    material: &KeyMaterial,
    header: &BundleHeader,
    entry_count: u32,
    record: &SealedRecord,
) -> Result<Vec<u8>, crypto::CryptoError> {
    debug_assert!(record.entry_index <= entry_count || record.entry_index == MANIFEST_INDEX);
    let aad = header.associated_data(entry_count, record.entry_index);
    crypto::open(
        &material.key,
        &record.nonce,
        &aad,
        &record.ciphertext,
        &record.tag,
    )
}
