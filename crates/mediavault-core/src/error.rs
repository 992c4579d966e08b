//! Error types for `mediavault-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Errors never include key material or plaintext, only paths,
//! sizes, and operation descriptions.

use mediavault_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// The frame is too short to contain a version byte, nonce, and tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The frame was written by a cipher this build does not know.
    #[error("unsupported cipher version {version}")]
    UnsupportedVersion { version: u8 },
}

/// Errors from the key store.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// The key could not be loaded or created.
    #[error("blob key unavailable: {reason}")]
    Unavailable { reason: String },

    /// The key persistence backend failed.
    #[error("key store storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from decoding the on-disk blob layout.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// A segment was not valid base64.
    #[error("segment is not valid base64: {reason}")]
    Encoding { reason: String },

    /// The decrypted metadata record did not parse.
    #[error("metadata record is invalid: {reason}")]
    Metadata { reason: String },
}

/// Errors from the secure eraser.
///
/// A failed overwrite is not an error: the file is still unlinked and the
/// degradation is reported in the [`EraseReport`](crate::eraser::EraseReport).
/// These variants cover the cases where the file could not be removed at all.
#[derive(Debug, thiserror::Error)]
pub enum EraseError {
    /// Could not stat the path.
    #[error("failed to inspect '{path}': {reason}")]
    Metadata { path: String, reason: String },

    /// Could not list a directory being erased.
    #[error("failed to read directory '{path}': {reason}")]
    ReadDir { path: String, reason: String },

    /// Could not unlink a file or remove a directory.
    #[error("failed to remove '{path}': {reason}")]
    Remove { path: String, reason: String },
}

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The source file for `store` could not be read.
    #[error("source '{path}' unavailable: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// The installation key could not be loaded or created.
    #[error("key unavailable: {0}")]
    KeyUnavailable(#[from] KeyStoreError),

    /// Encryption failed and plaintext fallback is disabled.
    #[error("encryption of '{name}' failed: {source}")]
    EncryptionFailure {
        name: String,
        #[source]
        source: CryptoError,
    },

    /// The content segment could not be decrypted and the integrity policy
    /// refuses to return raw bytes.
    #[error("decryption of '{path}' failed: {reason}")]
    DecryptionFailure { path: String, reason: String },

    /// The decrypted content does not match the digest recorded at store time
    /// and the integrity policy refuses to return it.
    #[error("integrity mismatch for '{path}': expected digest {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The configured directories overlap.
    #[error("invalid vault layout: {reason}")]
    Layout { reason: String },

    /// A filesystem operation on the vault or temp area failed.
    #[error("I/O error on '{path}': {reason}")]
    Io { path: String, reason: String },

    /// Metadata could not be serialized.
    #[error("metadata serialization failed: {reason}")]
    Metadata { reason: String },

    /// Erasing a blob, sidecar, or temp file failed.
    #[error("erase failed: {0}")]
    Erase(#[from] EraseError),
}

impl BlobError {
    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}
