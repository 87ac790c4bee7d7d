//! Key resolution for sealing and opening bundles
//!
//! A [`KeyStore`] maps a site identity to a ring of versioned AES-256 keys.
//! Exactly one version per site is active for sealing; every version still
//! in the ring stays valid for opening, which is what makes rotation safe
//! for bundles already in circulation.
//!
//! Rings are immutable once built and shared behind an [`Arc`]. Rotation
//! builds a new ring and swaps the pointer, so a resolve that is already in
//! flight keeps the ring it started with and other sites are never blocked.

use crate::crypto::{AesKey, CryptoError};
use crate::identity::SiteIdentity;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Key version (epoch). Version 0 is never issued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeyVersion(u32);

impl KeyVersion {
    pub const FIRST: KeyVersion = KeyVersion(1);

    /// Returns `None` for the invalid version 0
    pub fn new(version: u32) -> Option<Self> {
        (version != 0).then_some(Self(version))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("No key for site '{identity}' ({})", describe_version(.version))]
    NotFound {
        identity: SiteIdentity,
        version: Option<KeyVersion>,
    },

    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    #[error("Site '{identity}' already holds key version {version}")]
    VersionExists {
        identity: SiteIdentity,
        version: KeyVersion,
    },
}

pub(crate) fn describe_version(version: &Option<KeyVersion>) -> String {
    match version {
        Some(v) => format!("version {}", v),
        None => "active version".to_string(),
    }
}

/// Resolved key for one site and version. Never embedded in a bundle.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub version: KeyVersion,
    pub key: AesKey,
}

/// Source of key material
///
/// Implementations must allow concurrent `resolve` calls.
pub trait KeyStore: Send + Sync {
    /// Resolve the key for `identity`.
    ///
    /// With `version == None` the active sealing key is returned; otherwise
    /// exactly the requested version.
    fn resolve(
        &self,
        identity: &SiteIdentity,
        version: Option<KeyVersion>,
    ) -> Result<KeyMaterial, KeyStoreError>;
}

/// Immutable set of key versions for one site
#[derive(Clone, Debug)]
pub struct SiteKeyRing {
    active: KeyVersion,
    keys: BTreeMap<KeyVersion, AesKey>,
}

impl SiteKeyRing {
    /// Ring holding a single active key
    pub fn new(version: KeyVersion, key: AesKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            active: version,
            keys,
        }
    }

    pub fn active(&self) -> KeyVersion {
        self.active
    }

    pub fn versions(&self) -> Vec<KeyVersion> {
        self.keys.keys().copied().collect()
    }

    pub fn resolve(
        &self,
        identity: &SiteIdentity,
        version: Option<KeyVersion>,
    ) -> Result<KeyMaterial, KeyStoreError> {
        let version = version.unwrap_or(self.active);
        self.keys
            .get(&version)
            .map(|key| KeyMaterial {
                version,
                key: key.clone(),
            })
            .ok_or_else(|| KeyStoreError::NotFound {
                identity: identity.clone(),
                version: Some(version),
            })
    }

    /// Copy of this ring with `key` added under `version`, made active
    /// when `activate` is set
    fn with_key(&self, version: KeyVersion, key: AesKey, activate: bool) -> Self {
        let mut ring = self.clone();
        ring.keys.insert(version, key);
        if activate {
            ring.active = version;
        }
        ring
    }

    /// Copy of this ring with a fresh random key one version past the newest
    fn rotated(&self) -> Result<Self, KeyStoreError> {
        let newest = self.keys.keys().next_back().copied().unwrap_or(self.active);
        let version = newest
            .next()
            .ok_or_else(|| KeyStoreError::Unavailable("key version space exhausted".into()))?;
        Ok(self.with_key(version, AesKey::generate(), true))
    }

    fn without(&self, version: KeyVersion) -> Option<Self> {
        if version == self.active || !self.keys.contains_key(&version) {
            return None;
        }
        let mut ring = self.clone();
        ring.keys.remove(&version);
        Some(ring)
    }
}

type RingMap = HashMap<SiteIdentity, Arc<SiteKeyRing>>;

fn lock_error<T>(_: T) -> KeyStoreError {
    KeyStoreError::Unavailable("key store lock poisoned".to_string())
}

/// In-process key store
#[derive(Default)]
pub struct MemoryKeyStore {
    rings: RwLock<RingMap>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key version. The first key for a site becomes active; later
    /// inserts become active only if newer than the current active one.
    ///
    /// A version already held is never overwritten, since bundles sealed
    /// under it would stop opening.
    pub fn insert(
        &self,
        identity: &SiteIdentity,
        version: KeyVersion,
        key: AesKey,
    ) -> Result<(), KeyStoreError> {
        let mut rings = self.rings.write().map_err(lock_error)?;
        let ring = match rings.get(identity) {
            Some(ring) if ring.keys.contains_key(&version) => {
                return Err(KeyStoreError::VersionExists {
                    identity: identity.clone(),
                    version,
                })
            }
            Some(ring) => ring.with_key(version, key, version > ring.active()),
            None => SiteKeyRing::new(version, key),
        };
        rings.insert(identity.clone(), Arc::new(ring));
        Ok(())
    }

    /// Generate a new random key and make it active. Returns its version.
    pub fn generate(&self, identity: &SiteIdentity) -> Result<KeyVersion, KeyStoreError> {
        let mut rings = self.rings.write().map_err(lock_error)?;
        let ring = match rings.get(identity) {
            Some(ring) => ring.rotated()?,
            None => SiteKeyRing::new(KeyVersion::FIRST, AesKey::generate()),
        };
        let version = ring.active();
        rings.insert(identity.clone(), Arc::new(ring));
        info!(site = %identity, %version, "Generated site key");
        Ok(version)
    }

    /// Advance the active version of an existing site
    pub fn rotate(&self, identity: &SiteIdentity) -> Result<KeyVersion, KeyStoreError> {
        if !self.rings.read().map_err(lock_error)?.contains_key(identity) {
            return Err(KeyStoreError::NotFound {
                identity: identity.clone(),
                version: None,
            });
        }
        self.generate(identity)
    }

    /// Drop a retired version. The active version cannot be retired.
    pub fn retire(
        &self,
        identity: &SiteIdentity,
        version: KeyVersion,
    ) -> Result<bool, KeyStoreError> {
        let mut rings = self.rings.write().map_err(lock_error)?;
        let Some(ring) = rings.get(identity) else {
            return Ok(false);
        };
        match ring.without(version) {
            Some(ring) => {
                rings.insert(identity.clone(), Arc::new(ring));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Active version and every version held for `identity`, oldest first
    pub fn versions(
        &self,
        identity: &SiteIdentity,
    ) -> Result<(KeyVersion, Vec<KeyVersion>), KeyStoreError> {
        let ring = self.ring(identity)?;
        Ok((ring.active(), ring.versions()))
    }

    pub fn ring(&self, identity: &SiteIdentity) -> Result<Arc<SiteKeyRing>, KeyStoreError> {
        self.rings
            .read()
            .map_err(lock_error)?
            .get(identity)
            .cloned()
            .ok_or_else(|| KeyStoreError::NotFound {
                identity: identity.clone(),
                version: None,
            })
    }
}

impl KeyStore for MemoryKeyStore {
    fn resolve(
        &self,
        identity: &SiteIdentity,
        version: Option<KeyVersion>,
    ) -> Result<KeyMaterial, KeyStoreError> {
        // The read lock is released before the ring is consulted
        let ring = self.ring(identity)?;
        ring.resolve(identity, version)
    }
}

/// On-disk layout of one site's key ring
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    site_identity: SiteIdentity,
    active: KeyVersion,
    keys: Vec<KeyFileEntry>,
}

#[derive(Serialize, Deserialize)]
struct KeyFileEntry {
    version: KeyVersion,
    key: String,
}

/// Directory-backed keychain
///
/// Each site's ring lives in `<dir>/<sha256(identity)>.json`. Files are
/// replaced atomically, and resolved rings are cached. Requests for the
/// active version always re-read the file so a rotation done by another
/// process is picked up before the next seal.
pub struct FileKeyStore {
    dir: PathBuf,
    cache: RwLock<RingMap>,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, identity: &SiteIdentity) -> PathBuf {
        self.dir.join(format!("{}.json", identity.fingerprint()))
    }

    /// Read a ring from disk, bypassing the cache
    pub fn load(&self, identity: &SiteIdentity) -> Result<Arc<SiteKeyRing>, KeyStoreError> {
        if !self.dir.is_dir() {
            return Err(KeyStoreError::Unavailable(format!(
                "key directory {} does not exist",
                self.dir.display()
            )));
        }

        let path = self.path_for(identity);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound {
                    identity: identity.clone(),
                    version: None,
                })
            }
            Err(e) => {
                return Err(KeyStoreError::Unavailable(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let ring = Arc::new(parse_key_file(identity, &contents, &path)?);
        self.cache
            .write()
            .map_err(lock_error)?
            .insert(identity.clone(), ring.clone());
        debug!(site = %identity, active = %ring.active(), "Loaded key ring");
        Ok(ring)
    }

    /// Generate a key and make it active, creating the ring if needed
    pub fn generate(&self, identity: &SiteIdentity) -> Result<KeyVersion, KeyStoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            KeyStoreError::Unavailable(format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        let ring = match self.load(identity) {
            Ok(ring) => ring.rotated()?,
            Err(KeyStoreError::NotFound { .. }) => {
                SiteKeyRing::new(KeyVersion::FIRST, AesKey::generate())
            }
            Err(e) => return Err(e),
        };

        self.store(identity, &ring)?;
        let version = ring.active();
        self.cache
            .write()
            .map_err(lock_error)?
            .insert(identity.clone(), Arc::new(ring));
        info!(site = %identity, %version, "Generated site key");
        Ok(version)
    }

    /// Advance the active version of an existing site
    pub fn rotate(&self, identity: &SiteIdentity) -> Result<KeyVersion, KeyStoreError> {
        self.load(identity)?;
        self.generate(identity)
    }

    pub fn versions(
        &self,
        identity: &SiteIdentity,
    ) -> Result<(KeyVersion, Vec<KeyVersion>), KeyStoreError> {
        let ring = self.load(identity)?;
        Ok((ring.active(), ring.versions()))
    }

    fn store(&self, identity: &SiteIdentity, ring: &SiteKeyRing) -> Result<(), KeyStoreError> {
        let file = KeyFile {
            site_identity: identity.clone(),
            active: ring.active,
            keys: ring
                .keys
                .iter()
                .map(|(version, key)| KeyFileEntry {
                    version: *version,
                    key: BASE64.encode(key.as_slice()),
                })
                .collect(),
        };
        let json = Zeroizing::new(
            serde_json::to_vec_pretty(&file)
                .map_err(|e| KeyStoreError::Unavailable(format!("cannot encode key file: {}", e)))?,
        );

        let path = self.path_for(identity);
        let unavailable =
            |e: io::Error| KeyStoreError::Unavailable(format!("cannot write {}: {}", path.display(), e));

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(unavailable)?;
        tmp.write_all(&json).map_err(unavailable)?;
        tmp.as_file().sync_all().map_err(unavailable)?;
        tmp.persist(&path).map_err(|e| unavailable(e.error))?;
        Ok(())
    }
}

fn parse_key_file(
    identity: &SiteIdentity,
    contents: &str,
    path: &Path,
) -> Result<SiteKeyRing, KeyStoreError> {
    let corrupt = |reason: String| {
        KeyStoreError::Unavailable(format!("corrupt key file {}: {}", path.display(), reason))
    };

    let file: KeyFile = serde_json::from_str(contents).map_err(|e| corrupt(e.to_string()))?;
    if &file.site_identity != identity {
        return Err(corrupt(format!(
            "file belongs to '{}'",
            file.site_identity
        )));
    }

    let mut keys = BTreeMap::new();
    for entry in &file.keys {
        let bytes = Zeroizing::new(
            BASE64
                .decode(&entry.key)
                .map_err(|e| corrupt(e.to_string()))?,
        );
        let key = AesKey::from_slice(&bytes).map_err(|e: CryptoError| corrupt(e.to_string()))?;
        keys.insert(entry.version, key);
    }
    if !keys.contains_key(&file.active) {
        return Err(corrupt(format!("active version {} has no key", file.active)));
    }

    Ok(SiteKeyRing {
        active: file.active,
        keys,
    })
}

impl KeyStore for FileKeyStore {
    fn resolve(
        &self,
        identity: &SiteIdentity,
        version: Option<KeyVersion>,
    ) -> Result<KeyMaterial, KeyStoreError> {
        if let Some(requested) = version {
            let cached = self.cache.read().map_err(lock_error)?.get(identity).cloned();
            if let Some(ring) = cached {
                if let Ok(material) = ring.resolve(identity, Some(requested)) {
                    return Ok(material);
                }
            }
        }
        self.load(identity)?.resolve(identity, version)
    }
}
