//! In-memory site file trees
//!
//! [`SiteTree`] is what the packager seals; [`FileTree`] is what the
//! verifier hands back, carrying the manifest metadata the front-end needs
//! to serve each file.

use crate::manifest::{normalize_path, ManifestError};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error(transparent)]
    Path(#[from] ManifestError),
    #[error("Refusing to write {0} outside the target directory")]
    Escape(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SiteError + '_ {
    move |source| SiteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Files of a site keyed by normalized path, in lexicographic order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl SiteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. The path is normalized; duplicates are rejected.
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), SiteError> {
        let path = normalize_path(path)?;
        if self.files.contains_key(&path) {
            return Err(ManifestError::DuplicatePath(path).into());
        }
        self.files.insert(path, contents.into());
        Ok(())
    }

    /// Walk `root` recursively. Symlinks and special files are skipped.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self, SiteError> {
        let root = root.as_ref();
        let mut tree = Self::new();
        tree.collect(root, root)?;
        debug!(root = %root.display(), files = tree.len(), "Collected site tree");
        Ok(tree)
    }

    fn collect(&mut self, root: &Path, dir: &Path) -> Result<(), SiteError> {
        let mut children = fs::read_dir(dir)
            .map_err(io_error(dir))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error(dir))?;
        children.sort_by_key(|entry| entry.file_name());

        for entry in children {
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_error(&path))?;
            if file_type.is_dir() {
                self.collect(root, &path)?;
            } else if file_type.is_file() {
                let relative = relative_path(root, &path)?;
                let contents = fs::read(&path).map_err(io_error(&path))?;
                self.insert(&relative, contents)?;
            } else {
                debug!(path = %path.display(), "Skipping non-regular file");
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in lexicographic path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(path, data)| (path.as_str(), data.as_slice()))
    }
}

fn relative_path(root: &Path, path: &Path) -> Result<String, SiteError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| SiteError::Escape(path.to_path_buf()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| SiteError::NonUtf8Path(path.to_path_buf()))?,
            ),
            _ => return Err(SiteError::Escape(path.to_path_buf())),
        }
    }
    Ok(parts.join("/"))
}

/// One verified file of an opened bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub contents: Vec<u8>,
    pub mime_type: Option<String>,
    /// Base64 SHA-256, as declared in the manifest and verified on open
    pub hash: String,
}

/// Verified contents of an opened bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    index: Option<String>,
    files: BTreeMap<String, FileEntry>,
}

impl FileTree {
    pub(crate) fn new(index: Option<String>, entries: Vec<FileEntry>) -> Self {
        Self {
            index,
            files: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Entry point declared by the manifest
    pub fn index(&self) -> Option<&FileEntry> {
        self.index.as_deref().and_then(|path| self.files.get(path))
    }

    pub fn index_path(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    /// Drop metadata, keeping path and contents
    pub fn into_site_tree(self) -> SiteTree {
        SiteTree {
            files: self
                .files
                .into_iter()
                .map(|(path, entry)| (path, entry.contents))
                .collect(),
        }
    }

    /// Extract every file under `dir`
    ///
    /// Directories are created one component at a time and no component,
    /// nor the file itself, may be a symlink. Every target is checked
    /// before the first write, so a symlink planted under `dir` rejects the
    /// extraction without leaving any file behind.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), SiteError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let base = dir.canonicalize().map_err(io_error(dir))?;

        for entry in self.files.values() {
            resolve_target(&base, &entry.path, false)?;
        }
        for entry in self.files.values() {
            let target = resolve_target(&base, &entry.path, true)?;
            fs::write(&target, &entry.contents).map_err(io_error(&target))?;
        }
        debug!(dir = %base.display(), files = self.files.len(), "Extracted site");
        Ok(())
    }
}

/// Walk `relative` (a normalized `/`-separated path) below `base`,
/// refusing symlinks and, with `create`, making missing directories
fn resolve_target(base: &Path, relative: &str, create: bool) -> Result<PathBuf, SiteError> {
    let mut current = base.to_path_buf();
    let mut parts = relative.split('/').peekable();
    let mut exists = true;

    while let Some(part) = parts.next() {
        current.push(part);
        let is_file = parts.peek().is_none();
        if !exists {
            if create && !is_file {
                fs::create_dir(&current).map_err(io_error(&current))?;
            }
            continue;
        }

        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SiteError::Escape(current));
            }
            Ok(meta) if !is_file && !meta.is_dir() => {
                return Err(SiteError::Io {
                    path: current,
                    source: io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                exists = false;
                if create && !is_file {
                    fs::create_dir(&current).map_err(io_error(&current))?;
                }
            }
            Err(e) => return Err(io_error(&current)(e)),
        }
    }
    Ok(current)
}
