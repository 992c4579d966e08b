//! Installation key lifecycle.
//!
//! One 256-bit key per installation, generated lazily on first use from the
//! OS CSPRNG and persisted through a [`StorageBackend`] at `sys/blob_key`.
//! Once loaded the key is cached and never changes for the lifetime of the
//! [`KeyStore`]. Losing the persisted key strands every existing blob.
//!
//! # Persisted record
//!
//! `protection (1 byte) || key (32 bytes)`
//!
//! On a backend that reports [`StorageBackend::is_secure`] the key is stored
//! as-is (`protection = 0`). Otherwise it is XORed with an HKDF-SHA256 mask
//! derived from a fixed label (`protection = 1`). The mask only keeps the key
//! out of casual view; anyone with this source can undo it.
//!
//! There is no rotation. The only way to delete the key is
//! [`BlobStore::destroy_vault`](crate::store::BlobStore::destroy_vault),
//! which erases every blob first.

use std::sync::Arc;

use hkdf::Hkdf;
use mediavault_storage::StorageBackend;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::error::KeyStoreError;

/// Storage key for the persisted installation key.
const KEY_PATH: &str = "sys/blob_key";

const OBFUSCATION_SALT: &[u8] = b"mediavault-installation-key";
const OBFUSCATION_INFO: &[u8] = b"mediavault-key-obfuscation-v1";

/// How the key bytes in a persisted record are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    Plain,
    Obfuscated,
}

impl Protection {
    fn as_byte(self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Obfuscated => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Plain),
            1 => Some(Self::Obfuscated),
            _ => None,
        }
    }
}

/// Owns the installation key.
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
    key: RwLock<Option<EncryptionKey>>,
}

impl KeyStore {
    /// Create a key store persisting through `backend`. Nothing is read or
    /// generated until [`get_or_create_key`](Self::get_or_create_key).
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            key: RwLock::new(None),
        }
    }

    /// Return the installation key, loading or generating it on first call.
    ///
    /// # Errors
    ///
    /// - [`KeyStoreError::Storage`] if the backend cannot be read or written.
    /// - [`KeyStoreError::Unavailable`] if the persisted record is malformed.
    pub async fn get_or_create_key(&self) -> Result<EncryptionKey, KeyStoreError> {
        if let Some(key) = self.key.read().await.as_ref() {
            return Ok(key.clone());
        }

        let mut guard = self.key.write().await;
        // Another task may have won the race for the write lock.
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.backend.get(KEY_PATH).await? {
            Some(mut record) => {
                let key = decode_record(&record);
                record.zeroize();
                key?
            }
            None => self.create_key().await?,
        };
        *guard = Some(key.clone());
        Ok(key)
    }

    /// Whether a key has been persisted for this installation.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Storage`] if the backend cannot be read.
    pub async fn has_key(&self) -> Result<bool, KeyStoreError> {
        Ok(self.backend.exists(KEY_PATH).await?)
    }

    /// Delete the persisted key and forget the cached copy.
    ///
    /// Every blob encrypted under this key becomes unrecoverable, so the
    /// blob store only calls this after the vault has been erased.
    pub(crate) async fn destroy_key(&self) -> Result<(), KeyStoreError> {
        let mut guard = self.key.write().await;
        self.backend.delete(KEY_PATH).await?;
        *guard = None;
        warn!("installation key destroyed");
        Ok(())
    }

    async fn create_key(&self) -> Result<EncryptionKey, KeyStoreError> {
        let key = EncryptionKey::generate();
        let protection = if self.backend.is_secure() {
            Protection::Plain
        } else {
            warn!("no secure key facility available, persisting obfuscated key");
            Protection::Obfuscated
        };

        let mut record = encode_record(&key, protection)?;
        let result = self.backend.put(KEY_PATH, &record).await;
        record.zeroize();
        result?;

        info!(obfuscated = protection == Protection::Obfuscated, "installation key created");
        Ok(key)
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("secure_backend", &self.backend.is_secure())
            .finish_non_exhaustive()
    }
}

fn obfuscation_mask() -> Result<[u8; KEY_LEN], KeyStoreError> {
    let hk = Hkdf::<Sha256>::new(None, OBFUSCATION_SALT);
    let mut mask = [0u8; KEY_LEN];
    hk.expand(OBFUSCATION_INFO, &mut mask)
        .map_err(|e| KeyStoreError::Unavailable {
            reason: format!("key obfuscation mask: {e}"),
        })?;
    Ok(mask)
}

/// XOR `bytes` with the obfuscation mask. On error `bytes` is zeroized.
fn apply_mask(bytes: &mut [u8; KEY_LEN]) -> Result<(), KeyStoreError> {
    let mut mask = match obfuscation_mask() {
        Ok(mask) => mask,
        Err(e) => {
            bytes.zeroize();
            return Err(e);
        }
    };
    for (b, m) in bytes.iter_mut().zip(mask.iter()) {
        *b ^= m;
    }
    mask.zeroize();
    Ok(())
}

fn encode_record(key: &EncryptionKey, protection: Protection) -> Result<Vec<u8>, KeyStoreError> {
    let mut bytes = *key.as_bytes();
    if protection == Protection::Obfuscated {
        apply_mask(&mut bytes)?;
    }
    let mut record = Vec::with_capacity(1 + KEY_LEN);
    record.push(protection.as_byte());
    record.extend_from_slice(&bytes);
    bytes.zeroize();
    Ok(record)
}

fn decode_record(record: &[u8]) -> Result<EncryptionKey, KeyStoreError> {
    let malformed = |reason: &str| KeyStoreError::Unavailable {
        reason: format!("persisted key record is malformed: {reason}"),
    };

    let (&tag, body) = record.split_first().ok_or_else(|| malformed("empty record"))?;
    let protection = Protection::from_byte(tag).ok_or_else(|| malformed("unknown protection"))?;
    let mut bytes: [u8; KEY_LEN] = body
        .try_into()
        .map_err(|_| malformed("wrong key length"))?;
    if protection == Protection::Obfuscated {
        apply_mask(&mut bytes)?;
    }
    let key = EncryptionKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}
