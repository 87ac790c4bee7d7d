//! Bundle manifest
//!
//! The manifest is the authenticated index of a bundle: one entry per file
//! with its normalized path, size, SHA-256 and the index of the sealed
//! record holding its contents. It is serialized as JSON and sealed as
//! record 0 of the bundle.

use crate::crypto::content_hash;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Record index reserved for the manifest; file entries start at 1
pub const MANIFEST_INDEX: u32 = 0;

/// Entry point used when the site contains it and none is configured
pub const DEFAULT_INDEX: &str = "index.html";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("Duplicate path '{0}'")]
    DuplicatePath(String),
    #[error("Entry '{path}' has index {index}, expected {expected}")]
    IndexMismatch {
        path: String,
        index: u32,
        expected: u32,
    },
    #[error("Manifest lists {listed} entries but the bundle carries {records} records")]
    CountMismatch { listed: usize, records: u32 },
    #[error("Index file '{0}' is not part of the site")]
    MissingIndex(String),
    #[error("Entry '{0}' has an undecodable content hash")]
    BadHash(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    /// Base64 SHA-256 of the plaintext
    pub hash: String,
    pub entry_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ManifestEntry {
    /// Describe `data` stored at `path` in record `entry_index`
    pub fn describe(path: &str, data: &[u8], entry_index: u32) -> Self {
        Self {
            path: path.to_string(),
            size: data.len() as u64,
            hash: BASE64.encode(content_hash(data)),
            entry_index,
            mime_type: mime_guess::from_path(path)
                .first()
                .map(|mime| mime.essence_str().to_string()),
        }
    }

    /// Check `data` against the declared size and hash
    pub fn matches(&self, data: &[u8]) -> Result<bool, ManifestError> {
        let expected = BASE64
            .decode(&self.hash)
            .map_err(|_| ManifestError::BadHash(self.path.clone()))?;
        Ok(self.size == data.len() as u64 && expected.as_slice() == content_hash(data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub site_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(site_identity: impl Into<String>) -> Self {
        Self {
            site_identity: site_identity.into(),
            index: None,
            entries: Vec::new(),
        }
    }

    /// Append a file as the next entry. Callers add files in path order.
    pub fn push_file(&mut self, path: &str, data: &[u8]) -> u32 {
        let entry_index = self.entries.len() as u32 + 1;
        self.entries
            .push(ManifestEntry::describe(path, data, entry_index));
        entry_index
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Check the structural invariants against a bundle carrying
    /// `record_count` file records: normalized unique paths, entry indices
    /// `1..=record_count` in order, and an index file that exists.
    pub fn validate(&self, record_count: u32) -> Result<(), ManifestError> {
        if self.entries.len() != record_count as usize {
            return Err(ManifestError::CountMismatch {
                listed: self.entries.len(),
                records: record_count,
            });
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for (position, entry) in self.entries.iter().enumerate() {
            let normalized = normalize_path(&entry.path)?;
            if normalized != entry.path {
                return Err(ManifestError::InvalidPath {
                    path: entry.path.clone(),
                    reason: "not in normalized form",
                });
            }
            if !seen.insert(entry.path.as_str()) {
                return Err(ManifestError::DuplicatePath(entry.path.clone()));
            }
            let expected = position as u32 + 1;
            if entry.entry_index != expected {
                return Err(ManifestError::IndexMismatch {
                    path: entry.path.clone(),
                    index: entry.entry_index,
                    expected,
                });
            }
        }

        if let Some(index) = &self.index {
            if !seen.contains(index.as_str()) {
                return Err(ManifestError::MissingIndex(index.clone()));
            }
        }
        Ok(())
    }
}

/// Normalize a site-relative path
///
/// Accepts `/`-separated relative paths. A single leading `./` is dropped.
/// Absolute paths, drive prefixes, backslashes, NUL, empty segments and
/// `.`/`..` segments are rejected.
pub fn normalize_path(raw: &str) -> Result<String, ManifestError> {
    let invalid = |reason| ManifestError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    let path = raw.strip_prefix("./").unwrap_or(raw);
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if path.contains('\\') {
        return Err(invalid("backslash separator"));
    }
    if path.contains('\0') {
        return Err(invalid("NUL byte"));
    }
    if path.as_bytes().get(1) == Some(&b':') {
        return Err(invalid("drive prefix"));
    }

    for segment in path.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    Ok(path.to_string())
}
