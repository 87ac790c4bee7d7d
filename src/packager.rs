//! Authoring side: seal a site tree into a bundle
//!
//! Sealing is all-or-nothing. Every failure is reported as
//! [`BundleError::PackagingFailed`] and no bytes are produced; `seal_dir`
//! writes through a temporary file that is only renamed into place once the
//! whole bundle is encoded.

use crate::crypto::{self, NonceSequence, NONCE_PREFIX_SIZE};
use crate::error::BundleError;
use crate::format::{Bundle, BundleHeader, BundleInfo, SealedRecord, MAX_RECORD_LEN};
use crate::identity::SiteIdentity;
use crate::keystore::{describe_version, KeyMaterial, KeyStore, KeyStoreError};
use crate::manifest::{Manifest, DEFAULT_INDEX, MANIFEST_INDEX};
use crate::parallel;
use crate::site::SiteTree;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

const PREFIX_DOMAIN: &[u8] = b"sitebundle/nonce-prefix/v1";

fn failed(reason: impl std::fmt::Display) -> BundleError {
    BundleError::PackagingFailed(reason.to_string())
}

/// Where a packager takes its nonces from
enum NonceSource {
    /// One random-prefix sequence shared by every seal of this packager
    Sequence(NonceSequence),
    /// A fresh sequence per seal, prefixed by a hash of what is sealed
    ContentDerived,
}

/// Seals site trees under the active key of their site
///
/// # Example
///
/// ```
/// use sitebundle::{MemoryKeyStore, Packager, SiteIdentity, SiteTree, Verifier};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let site = SiteIdentity::new("news.freedom")?;
/// let keys = MemoryKeyStore::new();
/// keys.generate(&site)?;
///
/// let mut tree = SiteTree::new();
/// tree.insert("index.html", "<html>Hello</html>")?;
///
/// let bytes = Packager::new(&keys).seal_to_bytes(&tree, &site)?;
/// let opened = Verifier::new(&keys).expect_identity(site).open(&bytes)?;
/// assert_eq!(opened.into_site_tree(), tree);
/// # Ok(())
/// # }
/// ```
pub struct Packager<'a> {
    keys: &'a dyn KeyStore,
    nonces: NonceSource,
    index: Option<String>,
    parallelism: usize,
}

impl<'a> Packager<'a> {
    /// Packager with a random nonce prefix and a single worker
    pub fn new(keys: &'a dyn KeyStore) -> Self {
        Self {
            keys,
            nonces: NonceSource::Sequence(NonceSequence::random()),
            index: None,
            parallelism: 1,
        }
    }

    /// Derive nonces from the sealed content (reproducible builds)
    ///
    /// The nonce prefix of each bundle is a hash of its envelope fields and
    /// manifest, and the manifest carries every path and content hash.
    /// Sealing the same tree under the same key version gives byte-identical
    /// output; any change to the site gives a different prefix.
    #[must_use]
    pub fn reproducible(mut self) -> Self {
        self.nonces = NonceSource::ContentDerived;
        self
    }

    /// Entry point recorded in the manifest (default: `index.html` if present)
    #[must_use]
    pub fn index(mut self, path: impl Into<String>) -> Self {
        self.index = Some(path.into());
        self
    }

    /// Number of worker threads used to seal entries
    #[must_use]
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }

    /// Seal `tree` for `identity`
    pub fn seal(&self, tree: &SiteTree, identity: &SiteIdentity) -> Result<Bundle, BundleError> {
        let manifest = self.build_manifest(tree, identity)?;
        let entry_count = u32::try_from(manifest.entries.len())
            .map_err(|_| failed("site has more files than a bundle can index"))?;
        let manifest_bytes = manifest.to_bytes().map_err(failed)?;

        let material = self.keys.resolve(identity, None).map_err(|e| match e {
            KeyStoreError::NotFound { identity, version } => failed(format!(
                "no key for site '{}' ({})",
                identity,
                describe_version(&version)
            )),
            KeyStoreError::Unavailable(reason) => failed(format!("key store unavailable: {}", reason)),
            other @ KeyStoreError::VersionExists { .. } => failed(other),
        })?;
        let header = BundleHeader::new(identity.clone(), material.version);

        // Nonce 0 of the range seals the manifest, nonce i seals entry i
        let record_count = entry_count
            .checked_add(1)
            .ok_or_else(|| failed("site has more files than a bundle can index"))?;
        let nonces = match &self.nonces {
            NonceSource::Sequence(sequence) => sequence.reserve(record_count),
            NonceSource::ContentDerived => {
                let prefix = derived_prefix(&header, entry_count, &manifest_bytes);
                NonceSequence::with_prefix(prefix).reserve(record_count)
            }
        }
        .map_err(failed)?;

        let files: Vec<(u32, &[u8])> = tree
            .iter()
            .zip(1u32..)
            .map(|((_, data), index)| (index, data))
            .collect();

        let entries = parallel::try_map(&files, self.parallelism, |(index, data)| {
            let nonce = nonces
                .nonce(*index)
                .ok_or_else(|| failed("nonce range too small"))?;
            seal_record(&material, &header, entry_count, *index, nonce, data)
        })?;

        let manifest_nonce = nonces
            .nonce(MANIFEST_INDEX)
            .ok_or_else(|| failed("nonce range too small"))?;
        let manifest_record = seal_record(
            &material,
            &header,
            entry_count,
            MANIFEST_INDEX,
            manifest_nonce,
            &manifest_bytes,
        )?;

        info!(
            site = %identity,
            key_version = %material.version,
            entries = entry_count,
            "Sealed site bundle"
        );

        Ok(Bundle {
            header,
            manifest: manifest_record,
            entries,
        })
    }

    /// Seal and encode in one step
    pub fn seal_to_bytes(
        &self,
        tree: &SiteTree,
        identity: &SiteIdentity,
    ) -> Result<Vec<u8>, BundleError> {
        encode(&self.seal(tree, identity)?)
    }

    /// Seal the directory `src` and write the bundle to `output`
    ///
    /// The bundle is written to a temporary file next to `output` and
    /// renamed over it only after everything succeeded.
    pub fn seal_dir(
        &self,
        src: impl AsRef<Path>,
        identity: &SiteIdentity,
        output: impl AsRef<Path>,
    ) -> Result<BundleInfo, BundleError> {
        let tree = SiteTree::from_dir(src).map_err(failed)?;
        let bundle = self.seal(&tree, identity)?;
        let bytes = encode(&bundle)?;
        write_bundle(&bytes, output.as_ref())?;
        Ok(bundle.describe(&bytes))
    }

    fn build_manifest(
        &self,
        tree: &SiteTree,
        identity: &SiteIdentity,
    ) -> Result<Manifest, BundleError> {
        let mut manifest = Manifest::new(identity.as_str());
        for (path, data) in tree.iter() {
            manifest.push_file(path, data);
        }

        manifest.index = match &self.index {
            Some(index) if tree.contains(index) => Some(index.clone()),
            Some(index) => {
                return Err(failed(format!(
                    "index file '{}' is not part of the site",
                    index
                )))
            }
            None => tree.contains(DEFAULT_INDEX).then(|| DEFAULT_INDEX.to_string()),
        };
        Ok(manifest)
    }
}

/// Encode a sealed bundle; encoding failures are packaging failures
pub fn encode(bundle: &Bundle) -> Result<Vec<u8>, BundleError> {
    bundle.to_bytes().map_err(failed)
}

/// Write encoded bundle bytes to `output` atomically
///
/// The bytes go to a temporary file next to `output` that is renamed over
/// it only once fully written and synced.
pub fn write_bundle(bytes: &[u8], output: &Path) -> Result<(), BundleError> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(failed)?;
    tmp.write_all(bytes).map_err(failed)?;
    tmp.as_file().sync_all().map_err(failed)?;
    tmp.persist(output).map_err(|e| failed(e.error))?;

    info!(output = %output.display(), bytes = bytes.len(), "Wrote site bundle");
    Ok(())
}

/// Nonce prefix bound to the envelope fields and the serialized manifest
fn derived_prefix(
    header: &BundleHeader,
    entry_count: u32,
    manifest: &[u8],
) -> [u8; NONCE_PREFIX_SIZE] {
    let digest = Sha256::new()
        .chain_update(PREFIX_DOMAIN)
        .chain_update(header.associated_data(entry_count, MANIFEST_INDEX))
        .chain_update(manifest)
        .finalize();
    let mut prefix = [0u8; NONCE_PREFIX_SIZE];
    prefix.copy_from_slice(&digest[..NONCE_PREFIX_SIZE]);
    prefix
}

fn check_record_len(entry_index: u32, len: usize) -> Result<(), BundleError> {
    if len > MAX_RECORD_LEN {
        return Err(failed(format!(
            "record {} is {} bytes, a record holds at most {}",
            entry_index, len, MAX_RECORD_LEN
        )));
    }
    Ok(())
}

fn seal_record(
    material: &KeyMaterial,
    header: &BundleHeader,
    entry_count: u32,
    entry_index: u32,
    nonce: [u8; crypto::NONCE_SIZE],
    plaintext: &[u8],
) -> Result<SealedRecord, BundleError> {
    // GCM ciphertext is as long as the plaintext
    check_record_len(entry_index, plaintext.len())?;
    let aad = header.associated_data(entry_count, entry_index);
    let (ciphertext, tag) = crypto::seal(&material.key, &nonce, &aad, plaintext).map_err(failed)?;
    debug!(entry_index, bytes = plaintext.len(), "Sealed record");
    Ok(SealedRecord {
        entry_index,
        nonce,
        tag,
        ciphertext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use std::collections::HashSet;

    fn setup() -> (MemoryKeyStore, SiteIdentity, SiteTree) {
        let keys = MemoryKeyStore::new();
        let site = SiteIdentity::new("site-a").unwrap();
        keys.generate(&site).unwrap();

        let mut tree = SiteTree::new();
        tree.insert("index.html", "<html>Hello Freedom</html>").unwrap();
        tree.insert("css/site.css", "body { color: green }").unwrap();
        tree.insert("img/logo.png", vec![0x89, b'P', b'N', b'G']).unwrap();
        (keys, site, tree)
    }

    #[test]
    fn test_seal_structure() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let bundle = Packager::new(&keys).seal(&tree, &site)?;

        assert_eq!(bundle.header.site_identity, site);
        assert_eq!(bundle.header.key_version.get(), 1);
        assert_eq!(bundle.manifest.entry_index, 0);
        let indices: Vec<u32> = bundle.entries.iter().map(|r| r.entry_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_nonces_unique_within_and_across_bundles() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let packager = Packager::new(&keys);
        let a = packager.seal(&tree, &site)?;
        let b = packager.seal(&tree, &site)?;

        let mut seen = HashSet::new();
        for bundle in [&a, &b] {
            assert!(seen.insert(bundle.manifest.nonce));
            for record in &bundle.entries {
                assert!(seen.insert(record.nonce));
            }
        }
        assert_eq!(seen.len(), 8);
        Ok(())
    }

    #[test]
    fn test_reproducible_is_deterministic() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let a = Packager::new(&keys).reproducible().seal_to_bytes(&tree, &site)?;
        let b = Packager::new(&keys).reproducible().seal_to_bytes(&tree, &site)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_reproducible_nonces_follow_content() -> Result<(), BundleError> {
        let (keys, site, _) = setup();
        let mut one = SiteTree::new();
        one.insert("index.html", "<p>secret one</p>").unwrap();
        let mut two = SiteTree::new();
        two.insert("index.html", "<p>SECRET TWO</p>").unwrap();

        let packager = Packager::new(&keys).reproducible();
        let a = packager.seal(&one, &site)?;
        let b = packager.seal(&two, &site)?;

        let nonces = |bundle: &Bundle| -> HashSet<[u8; crypto::NONCE_SIZE]> {
            std::iter::once(&bundle.manifest)
                .chain(&bundle.entries)
                .map(|record| record.nonce)
                .collect()
        };
        assert!(nonces(&a).is_disjoint(&nonces(&b)));
        Ok(())
    }

    #[test]
    fn test_reproducible_prefix_depends_on_key_version() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let before = Packager::new(&keys).reproducible().seal(&tree, &site)?;
        keys.rotate(&site).unwrap();
        let after = Packager::new(&keys).reproducible().seal(&tree, &site)?;
        assert_ne!(before.manifest.nonce, after.manifest.nonce);
        Ok(())
    }

    #[test]
    fn test_parallel_matches_sequential() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let sequential = Packager::new(&keys).reproducible().seal(&tree, &site)?;
        let parallel = Packager::new(&keys)
            .reproducible()
            .parallelism(3)
            .seal(&tree, &site)?;
        assert_eq!(sequential, parallel);
        Ok(())
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_oversized_record_fails_packaging() {
        assert!(check_record_len(1, MAX_RECORD_LEN).is_ok());
        assert!(matches!(
            check_record_len(4, MAX_RECORD_LEN + 1),
            Err(BundleError::PackagingFailed(ref m)) if m.contains("record 4")
        ));
    }

    #[test]
    fn test_missing_key_fails_packaging() {
        let (keys, _, tree) = setup();
        let other = SiteIdentity::new("unknown").unwrap();
        let err = Packager::new(&keys).seal(&tree, &other).unwrap_err();
        assert!(matches!(err, BundleError::PackagingFailed(_)));
    }

    #[test]
    fn test_index_selection() -> Result<(), BundleError> {
        let (keys, site, tree) = setup();
        let packager = Packager::new(&keys);
        assert_eq!(
            packager.build_manifest(&tree, &site)?.index.as_deref(),
            Some("index.html")
        );

        let custom = Packager::new(&keys).index("css/site.css");
        assert_eq!(
            custom.build_manifest(&tree, &site)?.index.as_deref(),
            Some("css/site.css")
        );

        let missing = Packager::new(&keys).index("home.html");
        assert!(matches!(
            missing.seal(&tree, &site),
            Err(BundleError::PackagingFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_seal_dir_missing_source_writes_nothing() {
        let (keys, site, _) = setup();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("site.bundle");
        let result = Packager::new(&keys).seal_dir(out.path().join("missing"), &site, &target);
        assert!(matches!(result, Err(BundleError::PackagingFailed(_))));
        assert!(!target.exists());
    }
}
