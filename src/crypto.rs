//! AEAD primitives for sealed records
//!
//! Records are sealed with AES-256-GCM (256-bit key, 96-bit nonce, 128-bit
//! tag). The tag is kept detached from the ciphertext because the wire
//! format stores it in its own field.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 96-bit GCM nonce
pub const NONCE_SIZE: usize = 12;
/// 128-bit GCM authentication tag
pub const TAG_SIZE: usize = 16;
/// AES-256 key length
pub const KEY_SIZE: usize = 32;

/// Bytes of the per-bundle random nonce prefix; the rest is the counter
pub const NONCE_PREFIX_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD operation failed")]
    Aead,
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("Nonce space exhausted: cannot reserve {requested} nonces")]
    NonceExhausted { requested: u32 },
}

/// AES-256 key (32 bytes) that zeroizes on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct AesKey([u8; KEY_SIZE]);

impl AesKey {
    /// Create a new AES key from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(AesKey(key))
    }

    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        AesKey(key)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(<redacted>)")
    }
}

/// Thread-safe source of unique nonces
///
/// A nonce is `prefix (8 bytes) || counter (4 bytes, big-endian)`. The
/// prefix is random unless set explicitly for reproducible builds; the
/// counter only moves forward, so two reservations from the same sequence
/// never overlap even when made concurrently.
pub struct NonceSequence {
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: AtomicU32,
}

impl NonceSequence {
    /// Sequence with a prefix drawn from the OS RNG
    pub fn random() -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng.fill_bytes(&mut prefix);
        Self::with_prefix(prefix)
    }

    /// Sequence with a fixed prefix, starting at counter 0
    pub fn with_prefix(prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        Self {
            prefix,
            counter: AtomicU32::new(0),
        }
    }

    pub fn prefix(&self) -> [u8; NONCE_PREFIX_SIZE] {
        self.prefix
    }

    /// Next unreserved counter value
    pub fn position(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Atomically reserve `count` consecutive nonces
    ///
    /// Uses compare-and-swap so concurrent callers receive disjoint ranges.
    pub fn reserve(&self, count: u32) -> Result<NonceRange, CryptoError> {
        loop {
            let current = self.counter.load(Ordering::Relaxed);
            let next = current
                .checked_add(count)
                .ok_or(CryptoError::NonceExhausted { requested: count })?;

            match self.counter.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(NonceRange {
                        prefix: self.prefix,
                        start: current,
                        len: count,
                    })
                }
                Err(_) => continue,
            }
        }
    }
}

impl fmt::Debug for NonceSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceSequence")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

/// A block of nonces reserved from a [`NonceSequence`]
#[derive(Debug, Clone, Copy)]
pub struct NonceRange {
    prefix: [u8; NONCE_PREFIX_SIZE],
    start: u32,
    len: u32,
}

impl NonceRange {
    /// Nonce at `offset` within the range, or `None` past its end
    pub fn nonce(&self, offset: u32) -> Option<[u8; NONCE_SIZE]> {
        if offset >= self.len {
            return None;
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&(self.start + offset).to_be_bytes());
        Some(nonce)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Encrypt `plaintext`, returning the ciphertext and the detached tag
pub fn seal(
    key: &AesKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::Aead)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buffer, tag_bytes))
}

/// Authenticate and decrypt; fails without releasing any plaintext
pub fn open(
    key: &AesKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let mut buffer = ciphertext.to_vec();
    let result = key.cipher().decrypt_in_place_detached(
        Nonce::from_slice(nonce),
        aad,
        &mut buffer,
        GenericArray::from_slice(tag),
    );
    match result {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::Aead)
        }
    }
}

/// SHA-256 of file contents, as recorded in the manifest
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
