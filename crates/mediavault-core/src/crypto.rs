//! Cryptographic primitives for `MediaVault`.
//!
//! Provides AES-256-GCM authenticated encryption behind a versioned frame,
//! and a zeroize-on-drop key newtype.
//!
//! # Frame format
//!
//! `version (1 byte) || nonce (12 bytes) || ciphertext || tag (16 bytes)`
//!
//! The version byte selects the cipher used to open the frame, so a blob
//! written today stays readable after a stronger cipher becomes current.
//! Every encryption draws a fresh 96-bit nonce from `OsRng`.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Minimum frame length: version byte + nonce + tag.
const MIN_FRAME_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// Length of an [`EncryptionKey`] in bytes.
pub const KEY_LEN: usize = 32;

/// Cipher used to produce a frame. Stored as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CipherVersion {
    /// AES-256-GCM, random 96-bit nonce.
    Aes256GcmV1,
}

impl CipherVersion {
    /// The version every new frame is written with.
    pub const CURRENT: Self = Self::Aes256GcmV1;

    /// Wire byte for this version.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Aes256GcmV1 => 1,
        }
    }
}

impl From<CipherVersion> for u8 {
    fn from(version: CipherVersion) -> Self {
        version.as_byte()
    }
}

impl TryFrom<u8> for CipherVersion {
    type Error = CryptoError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(Self::Aes256GcmV1),
            version => Err(CryptoError::UnsupportedVersion { version }),
        }
    }
}

impl fmt::Display for CipherVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes256GcmV1 => f.write_str("aes-256-gcm/v1"),
        }
    }
}

/// A 256-bit encryption key that is zeroized on drop.
///
/// The inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care; the caller must not log these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Fill `buf` from the OS CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Encrypt `plaintext` with the current cipher version.
///
/// Returns `version || nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt_with(CipherVersion::CURRENT, key, plaintext)
}

/// Encrypt `plaintext` with an explicit cipher version.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_with(
    version: CipherVersion,
    key: &EncryptionKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match version {
        CipherVersion::Aes256GcmV1 => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext =
                cipher
                    .encrypt(&nonce, plaintext)
                    .map_err(|e| CryptoError::Encryption {
                        reason: e.to_string(),
                    })?;

            let mut frame =
                Vec::with_capacity(1usize.saturating_add(NONCE_LEN).saturating_add(ciphertext.len()));
            frame.push(version.as_byte());
            frame.extend_from_slice(&nonce);
            frame.extend_from_slice(&ciphertext);
            Ok(frame)
        }
    }
}

/// Read the cipher version of a frame without decrypting it.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] for an empty frame and
/// [`CryptoError::UnsupportedVersion`] for an unknown version byte.
pub fn frame_version(frame: &[u8]) -> Result<CipherVersion, CryptoError> {
    let Some(&byte) = frame.first() else {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_FRAME_LEN,
            actual: 0,
        });
    };
    CipherVersion::try_from(byte)
}

/// Decrypt a frame produced by [`encrypt`], dispatching on its version byte.
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if the frame cannot hold a version,
///   nonce, and tag.
/// - [`CryptoError::UnsupportedVersion`] for an unknown version byte.
/// - [`CryptoError::Decryption`] if authentication fails (wrong key,
///   corrupted data, or tampered tag).
pub fn decrypt(key: &EncryptionKey, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_FRAME_LEN,
            actual: frame.len(),
        });
    }

    match frame_version(frame)? {
        CipherVersion::Aes256GcmV1 => {
            let (nonce_bytes, ciphertext) = frame[1..].split_at(NONCE_LEN);
            let nonce = Nonce::from_slice(nonce_bytes);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

            cipher
                .decrypt(nonce, ciphertext)
                .map_err(|e| CryptoError::Decryption {
                    reason: e.to_string(),
                })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"holiday photo bytes";
        let frame = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &frame).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn encrypt_decrypt_empty_plaintext() {
        let key = EncryptionKey::generate();
        let frame = encrypt(&key, b"").unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        let decrypted = decrypt(&key, &frame).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn encrypt_decrypt_large_binary() {
        let key = EncryptionKey::generate();
        let plaintext: Vec<u8> = (0..(2 * 1024 * 1024 + 7)).map(|i| (i % 251) as u8).collect();
        let frame = encrypt(&key, &plaintext).unwrap();
        assert_eq!(decrypt(&key, &frame).unwrap(), plaintext);
    }

    #[test]
    fn frame_starts_with_version_byte() {
        let key = EncryptionKey::generate();
        let frame = encrypt(&key, b"data").unwrap();
        assert_eq!(frame[0], CipherVersion::CURRENT.as_byte());
        assert_eq!(frame_version(&frame).unwrap(), CipherVersion::Aes256GcmV1);
        assert_eq!(frame.len(), MIN_FRAME_LEN + 4);
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let frame = encrypt(&EncryptionKey::generate(), b"secret").unwrap();
        let result = decrypt(&EncryptionKey::generate(), &frame);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, &[1u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 29,
                actual: 10
            })
        ));
    }

    #[test]
    fn decrypt_unknown_version_fails() {
        let key = EncryptionKey::generate();
        let mut frame = encrypt(&key, b"secret").unwrap();
        frame[0] = 0x7F;
        let result = decrypt(&key, &frame);
        assert!(matches!(
            result,
            Err(CryptoError::UnsupportedVersion { version: 0x7F })
        ));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut frame = encrypt(&key, b"secret").unwrap();
        if let Some(byte) = frame.get_mut(1 + NONCE_LEN) {
            *byte ^= 0xFF;
        }
        let result = decrypt(&key, &frame);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn decrypt_truncated_frame_fails() {
        let key = EncryptionKey::generate();
        let frame = encrypt(&key, b"some longer secret payload").unwrap();
        let result = decrypt(&key, &frame[..frame.len() - 3]);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn two_encryptions_produce_different_frames() {
        let key = EncryptionKey::generate();
        let f1 = encrypt(&key, b"same data").unwrap();
        let f2 = encrypt(&key, b"same data").unwrap();
        assert_ne!(f1, f2);
    }

    #[test]
    fn cipher_version_serializes_as_byte() {
        let json = serde_json::to_string(&CipherVersion::Aes256GcmV1).unwrap();
        assert_eq!(json, "1");
        let parsed: CipherVersion = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, CipherVersion::Aes256GcmV1);
        assert!(serde_json::from_str::<CipherVersion>("9").is_err());
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn fill_random_is_not_constant() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }
}
