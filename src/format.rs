//! Bundle wire format
//!
//! ```text
//! Bundle {
//!   magic            : "SBDL"
//!   format_version   : u16
//!   site_identity    : u16 length + UTF-8
//!   key_version      : u32
//!   manifest_record  : SealedRecord        (entry_index 0)
//!   entry_count      : u32
//!   entries[]        : SealedRecord        (entry_index 1..=entry_count)
//! }
//! SealedRecord {
//!   entry_index : u32
//!   nonce       : 12 bytes
//!   tag         : 16 bytes
//!   ciphertext  : u32 length + bytes
//! }
//! ```
//!
//! The leading `magic` is an addition to the conceptual field list
//! (format_version first); it lets a reader reject arbitrary input before
//! looking at any length field and is bound into every record's associated
//! data along with the other envelope fields.
//!
//! Integers are big-endian. Encoding is a pure function of the in-memory
//! structure and fails only when a record or the record list does not fit
//! its length prefix. Decoding validates the whole envelope (lengths,
//! counts, indices, trailing bytes) before any record is handed to the
//! cipher.

use crate::binary::{
    read_array, read_bytes, read_u16_be, read_u32_be, write_len_prefixed_u16,
    write_len_prefixed_u32, write_u16_be, write_u32_be, BinaryRead, BinaryWrite,
};
use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::identity::{IdentityError, SiteIdentity, MAX_IDENTITY_LEN};
use crate::keystore::KeyVersion;
use crate::manifest::MANIFEST_INDEX;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

/// Magic bytes opening every bundle
pub const MAGIC: [u8; 4] = *b"SBDL";

/// Newest format version this crate reads and the one it writes
pub const FORMAT_VERSION: u16 = 1;

/// Smallest possible encoded record (empty ciphertext)
pub const MIN_RECORD_SIZE: usize = 4 + NONCE_SIZE + TAG_SIZE + 4;

/// Largest ciphertext a record's u32 length prefix can describe
pub const MAX_RECORD_LEN: usize = u32::MAX as usize;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Truncated or unreadable bundle: {0}")]
    Io(#[from] io::Error),
    #[error("Not a site bundle (bad magic)")]
    BadMagic,
    #[error("Unsupported format version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },
    #[error("Invalid format version {0}")]
    InvalidVersion(u16),
    #[error("Invalid site identity: {0}")]
    Identity(String),
    #[error("Invalid key version 0")]
    InvalidKeyVersion,
    #[error("{field} length {len} out of range (limit {limit})")]
    LengthOutOfRange {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("Manifest record carries index {0}, expected 0")]
    ManifestIndex(u32),
    #[error("Entry record {index} outside 1..={count}")]
    IndexOutOfRange { index: u32, count: u32 },
    #[error("Duplicate entry index {0}")]
    DuplicateIndex(u32),
    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),
    #[error("Cannot encode bundle: {0}")]
    Encode(#[source] io::Error),
}

impl From<IdentityError> for FormatError {
    fn from(e: IdentityError) -> Self {
        FormatError::Identity(e.to_string())
    }
}

/// One authenticated-encrypted unit of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    pub entry_index: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

impl BinaryRead for SealedRecord {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let entry_index = read_u32_be(reader)?;
        let nonce = read_array(reader)?;
        let tag = read_array(reader)?;
        let len = read_u32_be(reader)? as usize;
        let ciphertext = read_bytes(reader, len)?;
        Ok(Self {
            entry_index,
            nonce,
            tag,
            ciphertext,
        })
    }
}

impl BinaryWrite for SealedRecord {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_u32_be(writer, self.entry_index)?;
        writer.write_all(&self.nonce)?;
        writer.write_all(&self.tag)?;
        write_len_prefixed_u32(writer, &self.ciphertext)
    }

    fn serialized_size(&self) -> usize {
        MIN_RECORD_SIZE + self.ciphertext.len()
    }
}

/// Unencrypted envelope fields shared by every record's associated data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    pub format_version: u16,
    pub site_identity: SiteIdentity,
    pub key_version: KeyVersion,
}

impl BundleHeader {
    pub fn new(site_identity: SiteIdentity, key_version: KeyVersion) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            site_identity,
            key_version,
        }
    }

    /// Associated data binding a record to this bundle's identity, key
    /// version, record count and its own position
    pub fn associated_data(&self, entry_count: u32, entry_index: u32) -> Vec<u8> {
        let identity = self.site_identity.as_bytes();
        let mut aad = Vec::with_capacity(MAGIC.len() + 2 + 2 + identity.len() + 12);
        aad.extend_from_slice(&MAGIC);
        aad.extend_from_slice(&self.format_version.to_be_bytes());
        aad.extend_from_slice(&(identity.len() as u16).to_be_bytes());
        aad.extend_from_slice(identity);
        aad.extend_from_slice(&self.key_version.get().to_be_bytes());
        aad.extend_from_slice(&entry_count.to_be_bytes());
        aad.extend_from_slice(&entry_index.to_be_bytes());
        aad
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self, FormatError> {
        let magic: [u8; 4] = read_array(reader)?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic);
        }

        let format_version = read_u16_be(reader)?;
        if format_version == 0 {
            return Err(FormatError::InvalidVersion(format_version));
        }
        if format_version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: format_version,
                supported: FORMAT_VERSION,
            });
        }

        let identity_len = read_u16_be(reader)? as usize;
        if identity_len == 0 || identity_len > MAX_IDENTITY_LEN {
            return Err(FormatError::LengthOutOfRange {
                field: "site identity",
                len: identity_len,
                limit: MAX_IDENTITY_LEN,
            });
        }
        let identity_bytes = read_bytes(reader, identity_len)?;
        let identity = String::from_utf8(identity_bytes)
            .map_err(|_| FormatError::Identity("not valid UTF-8".to_string()))?;
        let site_identity = SiteIdentity::new(identity)?;

        let key_version =
            KeyVersion::new(read_u32_be(reader)?).ok_or(FormatError::InvalidKeyVersion)?;

        Ok(Self {
            format_version,
            site_identity,
            key_version,
        })
    }
}

impl BinaryWrite for BundleHeader {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        write_u16_be(writer, self.format_version)?;
        write_len_prefixed_u16(writer, self.site_identity.as_bytes())?;
        write_u32_be(writer, self.key_version.get())
    }

    fn serialized_size(&self) -> usize {
        MAGIC.len() + 2 + 2 + self.site_identity.as_bytes().len() + 4
    }
}

/// A sealed site: envelope, manifest record and one record per file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub header: BundleHeader,
    pub manifest: SealedRecord,
    pub entries: Vec<SealedRecord>,
}

/// Summary of a bundle that needs no key to produce
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleInfo {
    pub format_version: u16,
    pub site_identity: SiteIdentity,
    pub key_version: KeyVersion,
    pub entry_count: u32,
    pub encoded_len: usize,
    pub content_id: String,
}

impl Bundle {
    pub fn entry_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Record holding file entry `index`
    pub fn record(&self, index: u32) -> Option<&SealedRecord> {
        self.entries.iter().find(|r| r.entry_index == index)
    }

    /// Encode to the wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut buf).map_err(FormatError::Encode)?;
        Ok(buf)
    }

    /// Decode and structurally validate a bundle
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = Cursor::new(bytes);
        let header = BundleHeader::decode(&mut reader)?;

        let manifest = SealedRecord::read_from(&mut reader)?;
        if manifest.entry_index != MANIFEST_INDEX {
            return Err(FormatError::ManifestIndex(manifest.entry_index));
        }

        let entry_count = read_u32_be(&mut reader)?;
        let remaining = bytes.len() - reader.position() as usize;
        let limit = remaining / MIN_RECORD_SIZE;
        if entry_count as usize > limit {
            return Err(FormatError::LengthOutOfRange {
                field: "entry count",
                len: entry_count as usize,
                limit,
            });
        }

        let mut seen = HashSet::with_capacity(entry_count as usize);
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let record = SealedRecord::read_from(&mut reader)?;
            if record.entry_index == MANIFEST_INDEX || record.entry_index > entry_count {
                return Err(FormatError::IndexOutOfRange {
                    index: record.entry_index,
                    count: entry_count,
                });
            }
            if !seen.insert(record.entry_index) {
                return Err(FormatError::DuplicateIndex(record.entry_index));
            }
            entries.push(record);
        }

        let trailing = bytes.len() - reader.position() as usize;
        if trailing != 0 {
            return Err(FormatError::TrailingBytes(trailing));
        }

        Ok(Self {
            header,
            manifest,
            entries,
        })
    }

    /// Hex SHA-256 of the encoded bundle, used to content-address it
    pub fn content_id(&self) -> Result<String, FormatError> {
        Ok(content_id(&self.to_bytes()?))
    }

    pub fn info(&self) -> Result<BundleInfo, FormatError> {
        Ok(self.describe(&self.to_bytes()?))
    }

    /// Summary for `encoded`, the bytes this bundle was encoded to or
    /// decoded from
    pub fn describe(&self, encoded: &[u8]) -> BundleInfo {
        BundleInfo {
            format_version: self.header.format_version,
            site_identity: self.header.site_identity.clone(),
            key_version: self.header.key_version,
            entry_count: self.entry_count(),
            encoded_len: encoded.len(),
            content_id: content_id(encoded),
        }
    }
}

impl BinaryWrite for Bundle {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header.write_to(writer)?;
        self.manifest.write_to(writer)?;
        let count = u32::try_from(self.entries.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "too many entry records")
        })?;
        write_u32_be(writer, count)?;
        for record in &self.entries {
            record.write_to(writer)?;
        }
        Ok(())
    }

    fn serialized_size(&self) -> usize {
        self.header.serialized_size()
            + self.manifest.serialized_size()
            + 4
            + self
                .entries
                .iter()
                .map(BinaryWrite::serialized_size)
                .sum::<usize>()
    }
}

/// Hex SHA-256 of encoded bundle bytes
pub fn content_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u32, fill: u8, len: usize) -> SealedRecord {
        SealedRecord {
            entry_index: index,
            nonce: [fill; NONCE_SIZE],
            tag: [fill.wrapping_add(1); TAG_SIZE],
            ciphertext: vec![fill; len],
        }
    }

    fn sample() -> Bundle {
        Bundle {
            header: BundleHeader::new(SiteIdentity::new("site-a").unwrap(), KeyVersion::FIRST),
            manifest: record(0, 0x10, 40),
            entries: vec![record(1, 0x20, 5), record(2, 0x30, 0)],
        }
    }

    #[test]
    fn test_encode_layout() {
        let bundle = sample();
        let bytes = bundle.to_bytes().unwrap();
        assert_eq!(bytes.len(), bundle.serialized_size());
        assert_eq!(&bytes[..4], b"SBDL");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..8], &[0, 6]);
        assert_eq!(&bytes[8..14], b"site-a");
        assert_eq!(&bytes[14..18], &[0, 0, 0, 1]);
        // manifest record index
        assert_eq!(&bytes[18..22], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_matches_encode() {
        let bundle = sample();
        let decoded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(decoded.record(2).unwrap().ciphertext.len(), 0);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(sample().to_bytes().unwrap(), sample().to_bytes().unwrap());
        assert_eq!(sample().content_id().unwrap(), sample().content_id().unwrap());
        assert_eq!(sample().content_id().unwrap().len(), 64);
    }

    #[test]
    fn test_rejects_bad_magic_and_versions() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Bundle::from_bytes(&bytes), Err(FormatError::BadMagic)));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[5] = 2;
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::UnsupportedVersion { found: 2, supported: 1 })
        ));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[5] = 0;
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::InvalidVersion(0))
        ));
    }

    #[test]
    fn test_rejects_truncation_at_every_length() {
        let bytes = sample().to_bytes().unwrap();
        for len in 0..bytes.len() {
            assert!(
                Bundle::from_bytes(&bytes[..len]).is_err(),
                "accepted truncation to {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_indices() {
        let mut bundle = sample();
        bundle.entries[1].entry_index = 1;
        assert!(matches!(
            Bundle::from_bytes(&bundle.to_bytes().unwrap()),
            Err(FormatError::DuplicateIndex(1))
        ));

        let mut bundle = sample();
        bundle.entries[0].entry_index = 0;
        assert!(matches!(
            Bundle::from_bytes(&bundle.to_bytes().unwrap()),
            Err(FormatError::IndexOutOfRange { index: 0, .. })
        ));

        let mut bundle = sample();
        bundle.entries[0].entry_index = 3;
        assert!(matches!(
            Bundle::from_bytes(&bundle.to_bytes().unwrap()),
            Err(FormatError::IndexOutOfRange { index: 3, count: 2 })
        ));

        let mut bundle = sample();
        bundle.manifest.entry_index = 1;
        assert!(matches!(
            Bundle::from_bytes(&bundle.to_bytes().unwrap()),
            Err(FormatError::ManifestIndex(1))
        ));
    }

    #[test]
    fn test_rejects_oversized_counts_and_lengths() {
        // entry_count claims far more records than the input can hold
        let mut bundle = sample();
        bundle.entries.clear();
        let mut bytes = bundle.to_bytes().unwrap();
        let count_at = bytes.len() - 4;
        bytes[count_at..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::LengthOutOfRange { field: "entry count", .. })
        ));

        // manifest ciphertext length beyond the input
        let mut bytes = sample().to_bytes().unwrap();
        let len_at = 18 + 4 + NONCE_SIZE + TAG_SIZE;
        bytes[len_at..len_at + 4].copy_from_slice(&0x7FFF_FFFFu32.to_be_bytes());
        assert!(matches!(Bundle::from_bytes(&bytes), Err(FormatError::Io(_))));
    }

    #[test]
    fn test_rejects_bad_identity() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[8] = 0xFF;
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::Identity(_))
        ));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[6..8].copy_from_slice(&[0, 0]);
        assert!(matches!(
            Bundle::from_bytes(&bytes),
            Err(FormatError::LengthOutOfRange { .. })
        ));
    }

    #[test]
    fn test_associated_data_differs_per_context() {
        let header = sample().header;
        let other = BundleHeader::new(SiteIdentity::new("site-b").unwrap(), KeyVersion::FIRST);
        assert_ne!(header.associated_data(2, 1), header.associated_data(2, 2));
        assert_ne!(header.associated_data(2, 1), header.associated_data(3, 1));
        assert_ne!(header.associated_data(2, 1), other.associated_data(2, 1));
    }

    #[test]
    fn test_info() {
        let bundle = sample();
        let info = bundle.info().unwrap();
        assert_eq!(info.entry_count, 2);
        assert_eq!(info.encoded_len, bundle.to_bytes().unwrap().len());
        assert_eq!(info.content_id, bundle.content_id().unwrap());
    }
}
