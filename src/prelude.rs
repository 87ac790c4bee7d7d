//! Sitebundle prelude
//!
//! Commonly used types in one import.
//!
//! # Example
//!
//! ```rust
//! use sitebundle::prelude::*;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let site = SiteIdentity::new("blog.freedom")?;
//! let keys = MemoryKeyStore::new();
//! keys.generate(&site)?;
//!
//! let mut tree = SiteTree::new();
//! tree.insert("index.html", "<h1>hi</h1>")?;
//! let bundle = Packager::new(&keys).seal(&tree, &site)?;
//! let opened = Verifier::new(&keys).open(&bundle.to_bytes()?)?;
//! assert_eq!(opened.index_path(), Some("index.html"));
//! # Ok(())
//! # }
//! ```

pub use crate::binary::{BinaryRead, BinaryWrite};
pub use crate::error::BundleError;
pub use crate::format::{Bundle, BundleInfo};
pub use crate::identity::SiteIdentity;
pub use crate::keystore::{FileKeyStore, KeyStore, KeyVersion, MemoryKeyStore};
pub use crate::packager::Packager;
pub use crate::site::{FileEntry, FileTree, SiteTree};
pub use crate::verifier::Verifier;
