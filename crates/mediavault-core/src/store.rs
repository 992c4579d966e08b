//! The blob store façade.
//!
//! A blob moves through `absent -> stored -> (materialized)* -> destroyed`
//! and never comes back from `destroyed`. [`BlobStore`] drives every
//! transition:
//!
//! - [`store`](BlobStore::store) encrypts a source file into
//!   `<vault>/<base>_<digest>.enc` plus a `.verify` sidecar.
//! - [`materialize`](BlobStore::materialize) decrypts a blob into a fresh
//!   `temp_*` file and checks its content digest.
//! - [`destroy`](BlobStore::destroy) securely erases a blob, its sidecar, and
//!   every plaintext copy made from it.
//!
//! Operations on the same blob path are serialized through [`PathLocks`].
//! Nothing here is transactional: a crash between writing a blob and its
//! sidecar leaves a sidecar-less blob, which [`verify`](BlobStore::verify)
//! still accepts through a structural check.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{IntegrityPolicy, VaultConfig};
use crate::crypto::{self, EncryptionKey};
use crate::eraser::{self, EraseReport};
use crate::error::{BlobError, CryptoError};
use crate::format::{self, BLOB_EXTENSION, BlobMetadata, DELIMITER, Layout};
use crate::hasher::{self, NAME_DIGEST_LEN, SAMPLE_LEN};
use crate::keystore::KeyStore;
use crate::locks::PathLocks;
use crate::manifest::{self, TEMP_PREFIX, TempManifest};

/// Temp plaintext files and partial writes get a single zero pass.
const TEMP_ERASE_PASSES: u32 = 1;

/// Largest metadata segment read by `get_info` before giving up.
const MAX_METADATA_SEGMENT: usize = 64 * 1024;

/// Longest logical-name extension carried over to a temp file name.
const MAX_TEMP_EXT_LEN: usize = 16;

/// Turns a key, metadata JSON and content into blob file bytes.
type Sealer = fn(&EncryptionKey, &[u8], &[u8]) -> Result<Vec<u8>, CryptoError>;

/// Result of [`BlobStore::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The blob was written encrypted.
    StoredEncrypted { path: PathBuf },
    /// Encryption failed and the source was copied unencrypted instead.
    StoredPlain { path: PathBuf, reason: String },
}

impl StoreOutcome {
    /// Where the blob was written.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::StoredEncrypted { path } | Self::StoredPlain { path, .. } => path,
        }
    }

    /// Whether the blob on disk is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::StoredEncrypted { .. })
    }

    /// Consume the outcome, returning the blob path.
    #[must_use]
    pub fn into_path(self) -> PathBuf {
        match self {
            Self::StoredEncrypted { path } | Self::StoredPlain { path, .. } => path,
        }
    }
}

/// How far the plaintext returned by [`BlobStore::materialize`] can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// Content digest matches the one recorded at store time.
    Verified,
    /// Content decrypted but its digest differs from the recorded one.
    Mismatch { expected: String, actual: String },
    /// Content decrypted but the metadata segment did not, so nothing could
    /// be checked.
    MetadataUnreadable { reason: String },
    /// Content did not decrypt; the returned file holds the raw blob bytes.
    DecryptionFailed { reason: String },
    /// Legacy single-segment blob with no digest to check against.
    Unchecked,
    /// The path was not a vault blob and was returned unchanged.
    Passthrough,
}

impl Integrity {
    /// Whether the content was checked and matched.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::Mismatch { .. } => f.write_str("digest mismatch"),
            Self::MetadataUnreadable { .. } => f.write_str("metadata unreadable"),
            Self::DecryptionFailed { .. } => f.write_str("decryption failed"),
            Self::Unchecked => f.write_str("unchecked (legacy)"),
            Self::Passthrough => f.write_str("passthrough"),
        }
    }
}

/// A plaintext file produced by [`BlobStore::materialize`].
///
/// The caller owns `path` and should hand it back to
/// [`BlobStore::release`] when done. For [`Integrity::Passthrough`] the path
/// is the caller's own input and `release` leaves it alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub path: PathBuf,
    pub integrity: Integrity,
    pub metadata: Option<BlobMetadata>,
}

/// What [`BlobStore::get_info`] knows about a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub metadata: Option<BlobMetadata>,
}

impl BlobInfo {
    fn missing(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            exists: false,
            size: 0,
            modified_at: None,
            metadata: None,
        }
    }
}

/// Decrypted blob contents before they hit the temp directory.
struct Opened {
    plaintext: Zeroizing<Vec<u8>>,
    metadata: Option<BlobMetadata>,
    integrity: Integrity,
}

/// Encrypted blob storage over a vault directory and a temp directory.
pub struct BlobStore {
    config: VaultConfig,
    keys: Arc<KeyStore>,
    manifest: TempManifest,
    locks: PathLocks,
    sealer: Sealer,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("vault_dir", &self.config.vault_dir)
            .field("temp_dir", &self.config.temp_dir)
            .field("integrity_policy", &self.config.integrity_policy)
            .finish_non_exhaustive()
    }
}

impl BlobStore {
    /// Open a blob store, creating the vault and temp directories.
    ///
    /// Both directories are canonicalized so blob paths can be recognized
    /// however the caller spells them. The vault, temp and key directories
    /// must not contain one another, since wiping the vault erases its whole
    /// directory.
    ///
    /// # Errors
    ///
    /// - [`BlobError::Io`] if a directory cannot be created.
    /// - [`BlobError::Layout`] if two of the directories overlap.
    pub async fn open(mut config: VaultConfig, keys: Arc<KeyStore>) -> Result<Self, BlobError> {
        config.vault_dir = prepare_dir(&config.vault_dir).await?;
        config.temp_dir = prepare_dir(&config.temp_dir).await?;
        let key_dir = resolve(&config.key_dir)
            .await
            .unwrap_or_else(|| config.key_dir.clone());
        check_disjoint(&[
            ("vault", &config.vault_dir),
            ("temp", &config.temp_dir),
            ("key", &key_dir),
        ])?;
        debug!(
            vault = %config.vault_dir.display(),
            temp = %config.temp_dir.display(),
            policy = %config.integrity_policy,
            "blob store opened"
        );
        Ok(Self {
            config,
            keys,
            manifest: TempManifest::new(),
            locks: PathLocks::new(),
            sealer: seal,
        })
    }

    #[cfg(test)]
    fn with_sealer(mut self, sealer: Sealer) -> Self {
        self.sealer = sealer;
        self
    }

    /// The effective configuration, with canonical directories.
    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Encrypt `source` into a new blob named after `logical_name`.
    ///
    /// # Errors
    ///
    /// - [`BlobError::SourceUnavailable`] if `source` cannot be read.
    /// - [`BlobError::KeyUnavailable`] if the installation key cannot be loaded.
    /// - [`BlobError::EncryptionFailure`] if encryption fails and plaintext
    ///   fallback is disabled.
    /// - [`BlobError::Io`] if the blob cannot be written.
    pub async fn store(&self, source: &Path, logical_name: &str) -> Result<StoreOutcome, BlobError> {
        let content = Zeroizing::new(fs::read(source).await.map_err(|e| {
            BlobError::SourceUnavailable {
                path: source.display().to_string(),
                reason: e.to_string(),
            }
        })?);
        self.store_bytes(&content, logical_name).await
    }

    /// Encrypt an in-memory buffer into a new blob named after `logical_name`.
    ///
    /// # Errors
    ///
    /// Same as [`store`](Self::store), minus `SourceUnavailable`.
    pub async fn store_bytes(
        &self,
        content: &[u8],
        logical_name: &str,
    ) -> Result<StoreOutcome, BlobError> {
        let key = self.keys.get_or_create_key().await?;

        let created_at = Utc::now();
        let metadata = BlobMetadata::describe(logical_name, content, created_at);
        let metadata_json = metadata.to_json().map_err(|e| BlobError::Metadata {
            reason: e.to_string(),
        })?;

        let name = format!(
            "{}_{}.{BLOB_EXTENSION}",
            format::base_name(logical_name),
            hasher::name_digest(content, content.len() as u64, created_at.timestamp_millis()),
        );
        let path = self.config.vault_dir.join(name);
        let _guard = self.locks.lock(&path).await;

        match (self.sealer)(&key, &metadata_json, content) {
            Ok(blob) => {
                self.write_blob(&path, &blob).await?;
                info!(
                    path = %path.display(),
                    size = content.len(),
                    mime = %metadata.mime_type,
                    "blob stored"
                );
                Ok(StoreOutcome::StoredEncrypted { path })
            }
            Err(source) if self.config.allow_plaintext_fallback => {
                warn!(
                    path = %path.display(),
                    error = %source,
                    "encryption failed, storing an unencrypted copy"
                );
                self.write_blob(&path, content).await?;
                Ok(StoreOutcome::StoredPlain {
                    path,
                    reason: source.to_string(),
                })
            }
            Err(source) => Err(BlobError::EncryptionFailure {
                name: logical_name.to_owned(),
                source,
            }),
        }
    }

    /// Decrypt a blob into a fresh temp file.
    ///
    /// Paths that are not `.enc` files directly inside the vault come back
    /// unchanged with [`Integrity::Passthrough`]. What happens on a failed
    /// integrity check depends on the configured [`IntegrityPolicy`].
    ///
    /// # Errors
    ///
    /// - [`BlobError::Io`] if the blob cannot be read or the temp file written.
    /// - [`BlobError::KeyUnavailable`] if the installation key cannot be loaded.
    /// - [`BlobError::DecryptionFailure`] / [`BlobError::IntegrityMismatch`]
    ///   under [`IntegrityPolicy::FailClosed`].
    pub async fn materialize(&self, blob: &Path) -> Result<Materialized, BlobError> {
        let Some(path) = self.resolve_blob(blob).await else {
            debug!(path = %blob.display(), "not a vault blob, passing through");
            return Ok(Materialized {
                path: blob.to_path_buf(),
                integrity: Integrity::Passthrough,
                metadata: None,
            });
        };
        let _guard = self.locks.lock(&path).await;
        self.materialize_locked(&path).await
    }

    /// [`materialize`](Self::materialize) for a resolved blob path whose
    /// lock the caller already holds.
    async fn materialize_locked(&self, path: &Path) -> Result<Materialized, BlobError> {
        let bytes = fs::read(path).await.map_err(|e| BlobError::io(path, &e))?;
        let key = self.keys.get_or_create_key().await?;
        let opened = self.open_blob(&key, path, &bytes)?;

        let temp = self.temp_path_for(path, opened.metadata.as_ref());
        write_private(&temp, &opened.plaintext)
            .await
            .map_err(|e| BlobError::io(&temp, &e))?;
        self.manifest.record(path, &temp).await;

        debug!(
            blob = %path.display(),
            temp = %temp.display(),
            integrity = %opened.integrity,
            "blob materialized"
        );
        Ok(Materialized {
            path: temp,
            integrity: opened.integrity,
            metadata: opened.metadata,
        })
    }

    /// Erase a temp file returned by [`materialize`](Self::materialize).
    ///
    /// Anything that is not a `temp_*` file in the temp directory is left
    /// alone, so releasing a passthrough path never touches the caller's
    /// original.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Erase`] if the file could not be removed.
    pub async fn release(&self, temp: &Path) -> Result<EraseReport, BlobError> {
        let Some(temp) = self.resolve_temp(temp).await else {
            debug!(path = %temp.display(), "not a temp file, nothing to release");
            return Ok(EraseReport::default());
        };
        let report = eraser::erase(&temp, TEMP_ERASE_PASSES).await?;
        self.manifest.forget(&temp).await;
        debug!(path = %temp.display(), "temp file released");
        Ok(report)
    }

    /// Securely erase a blob, its sidecar, and every plaintext copy of it.
    ///
    /// The blob and sidecar get the configured number of passes. Temp files
    /// recorded for the blob, and `temp_<stem>_*` files left by earlier
    /// processes, get one pass. An absent blob is a no-op, as is any path
    /// outside the vault.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Erase`] if a file could not be removed at all, or
    /// [`BlobError::Io`] if the temp directory cannot be listed.
    pub async fn destroy(&self, blob: &Path) -> Result<EraseReport, BlobError> {
        let Some(path) = self.resolve_blob(blob).await else {
            warn!(path = %blob.display(), "refusing to destroy a path outside the vault");
            return Ok(EraseReport::default());
        };
        let _guard = self.locks.lock(&path).await;
        self.destroy_locked(&path).await
    }

    /// [`destroy`](Self::destroy) for a resolved blob path whose lock the
    /// caller already holds.
    async fn destroy_locked(&self, path: &Path) -> Result<EraseReport, BlobError> {
        let passes = self.config.erase_passes;
        let mut report = eraser::erase(path, passes).await?;
        report.merge(eraser::erase(&format::sidecar_path(path), passes).await?);

        for temp in self.manifest.take_for_blob(path).await {
            report.merge(eraser::erase(&temp, TEMP_ERASE_PASSES).await?);
        }
        report.merge(self.erase_leftover_temps(&blob_stem(path)).await?);

        if report.is_noop() {
            debug!(path = %path.display(), "nothing to destroy");
        } else {
            info!(
                path = %path.display(),
                erased = report.erased,
                degraded = report.degraded.len(),
                "blob destroyed"
            );
        }
        Ok(report)
    }

    /// Erase the whole vault directory and every `temp_*` file in the temp
    /// directory.
    ///
    /// The vault directory is recreated empty. Other files in the temp
    /// directory are left alone and the directory itself is kept.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Erase`] if something could not be removed, or
    /// [`BlobError::Io`] if a directory cannot be listed or recreated.
    pub async fn wipe_all(&self) -> Result<EraseReport, BlobError> {
        let mut report = eraser::erase(&self.config.vault_dir, self.config.erase_passes).await?;
        report.merge(self.erase_temp_files(Duration::ZERO).await?);
        self.manifest.clear().await;

        prepare_dir(&self.config.vault_dir).await?;

        info!(
            erased = report.erased,
            degraded = report.degraded.len(),
            "vault wiped"
        );
        Ok(report)
    }

    /// Wipe the vault, then delete the installation key.
    ///
    /// The key goes last: if the wipe fails the key is kept, so whatever
    /// survived can still be read.
    ///
    /// # Errors
    ///
    /// Returns the wipe error, or [`BlobError::KeyUnavailable`] if the key
    /// could not be deleted.
    pub async fn destroy_vault(&self) -> Result<EraseReport, BlobError> {
        let report = self.wipe_all().await?;
        self.keys.destroy_key().await?;
        info!("vault destroyed");
        Ok(report)
    }

    /// Check a blob against its verification sidecar.
    ///
    /// Without a sidecar, falls back to checking that the blob has two
    /// segments and its metadata decrypts. A missing blob or a path outside
    /// the vault does not verify.
    ///
    /// # Errors
    ///
    /// - [`BlobError::Io`] if the blob or sidecar cannot be read.
    /// - [`BlobError::KeyUnavailable`] if the structural check needs the key
    ///   and it cannot be loaded.
    pub async fn verify(&self, blob: &Path) -> Result<bool, BlobError> {
        let Some(path) = self.resolve_blob(blob).await else {
            return Ok(false);
        };
        let _guard = self.locks.lock(&path).await;

        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| BlobError::io(&path, &e))?;
        if !exists {
            return Ok(false);
        }

        let sidecar = format::sidecar_path(&path);
        match fs::read_to_string(&sidecar).await {
            Ok(expected) => {
                let head = read_head(&path)
                    .await
                    .map_err(|e| BlobError::io(&path, &e))?;
                let intact = hasher::digests_match(expected.trim(), &hasher::digest(&head));
                if !intact {
                    warn!(path = %path.display(), "blob does not match its sidecar");
                }
                Ok(intact)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no sidecar, checking structure");
                Ok(self.read_metadata(&path).await?.is_some())
            }
            Err(e) => Err(BlobError::io(&sidecar, &e)),
        }
    }

    /// Re-store a blob under the current cipher version and destroy the old
    /// one.
    ///
    /// Returns the new blob path, or `None` when the old blob is kept: it is
    /// not a vault blob, it did not materialize cleanly, or the new copy
    /// could not be stored encrypted. The old blob stays locked for the
    /// whole sequence.
    ///
    /// # Errors
    ///
    /// - [`BlobError::KeyUnavailable`] if the installation key cannot be loaded.
    /// - [`BlobError::Erase`] / [`BlobError::Io`] if cleanup fails.
    pub async fn re_encrypt(&self, blob: &Path) -> Result<Option<PathBuf>, BlobError> {
        let Some(path) = self.resolve_blob(blob).await else {
            debug!(path = %blob.display(), "not a vault blob, nothing to re-encrypt");
            return Ok(None);
        };
        let _guard = self.locks.lock(&path).await;

        let materialized = match self.materialize_locked(&path).await {
            Ok(materialized) => materialized,
            Err(e @ BlobError::KeyUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(path = %blob.display(), error = %e, "blob did not materialize, keeping it");
                return Ok(None);
            }
        };

        match &materialized.integrity {
            Integrity::Passthrough => return Ok(None),
            Integrity::Mismatch { .. } | Integrity::DecryptionFailed { .. } => {
                warn!(
                    path = %blob.display(),
                    integrity = %materialized.integrity,
                    "blob failed its integrity check, keeping it"
                );
                self.release(&materialized.path).await?;
                return Ok(None);
            }
            Integrity::Verified | Integrity::MetadataUnreadable { .. } | Integrity::Unchecked => {}
        }

        let logical_name = materialized.metadata.as_ref().map_or_else(
            || logical_name_from_stem(&blob_stem(&path)),
            |m| m.original_name.clone(),
        );
        let stored = self.store(&materialized.path, &logical_name).await;
        self.release(&materialized.path).await?;

        let outcome = match stored {
            Ok(outcome) => outcome,
            Err(e @ BlobError::KeyUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "new copy could not be stored, keeping old blob");
                return Ok(None);
            }
        };

        match outcome {
            StoreOutcome::StoredEncrypted { path: fresh } => {
                self.destroy_locked(&path).await?;
                info!(old = %path.display(), new = %fresh.display(), "blob re-encrypted");
                Ok(Some(fresh))
            }
            StoreOutcome::StoredPlain { path: fresh, reason } => {
                warn!(path = %path.display(), %reason, "re-encryption fell back to plaintext, keeping old blob");
                self.destroy(&fresh).await?;
                Ok(None)
            }
        }
    }

    /// Size, timestamps, and decrypted metadata of a blob.
    ///
    /// Only the metadata segment is read and decrypted. Legacy blobs, plain
    /// fallback copies, and paths outside the vault report no metadata.
    ///
    /// # Errors
    ///
    /// - [`BlobError::Io`] if the path cannot be inspected.
    /// - [`BlobError::KeyUnavailable`] if the installation key cannot be loaded.
    pub async fn get_info(&self, blob: &Path) -> Result<BlobInfo, BlobError> {
        let stat = match fs::metadata(blob).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BlobInfo::missing(blob));
            }
            Err(e) => return Err(BlobError::io(blob, &e)),
        };

        let metadata = match self.resolve_blob(blob).await {
            Some(path) => self.read_metadata(&path).await?,
            None => None,
        };

        Ok(BlobInfo {
            path: blob.to_path_buf(),
            exists: true,
            size: stat.len(),
            modified_at: stat.modified().ok().map(DateTime::<Utc>::from),
            metadata,
        })
    }

    /// Every blob in the vault, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Io`] if the vault directory cannot be listed.
    pub async fn list(&self) -> Result<Vec<PathBuf>, BlobError> {
        let dir = &self.config.vault_dir;
        let io_err = |e: std::io::Error| BlobError::io(dir, &e);

        let mut entries = fs::read_dir(dir).await.map_err(io_err)?;
        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if has_blob_extension(&path) && entry.file_type().await.map_err(io_err)?.is_file() {
                blobs.push(path);
            }
        }
        blobs.sort();
        Ok(blobs)
    }

    /// Erase temp files last modified at least `max_age` ago. Returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Io`] if the temp directory cannot be listed, or
    /// [`BlobError::Erase`] if a file could not be removed.
    pub async fn sweep_temp(&self, max_age: Duration) -> Result<usize, BlobError> {
        let swept = self.erase_temp_files(max_age).await?.removed();
        if swept > 0 {
            info!(swept, max_age_secs = max_age.as_secs(), "stale temp files erased");
        }
        Ok(swept)
    }

    /// Erase `temp_*` regular files in the temp directory at least `max_age`
    /// old. Anything else in the directory is left alone.
    async fn erase_temp_files(&self, max_age: Duration) -> Result<EraseReport, BlobError> {
        let dir = &self.config.temp_dir;
        let io_err = |e: std::io::Error| BlobError::io(dir, &e);

        let mut report = EraseReport::default();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(io_err(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if !is_temp {
                continue;
            }
            let stat = entry.metadata().await.map_err(io_err)?;
            if !stat.is_file() {
                continue;
            }
            let age = stat
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            let path = entry.path();
            report.merge(eraser::erase(&path, TEMP_ERASE_PASSES).await?);
            self.manifest.forget(&path).await;
        }
        Ok(report)
    }

    /// Decrypt and check raw blob bytes according to the integrity policy.
    fn open_blob(&self, key: &EncryptionKey, path: &Path, bytes: &[u8]) -> Result<Opened, BlobError> {
        let (metadata_segment, content_segment) = match format::split(bytes) {
            Layout::Segmented { metadata, content } => (Some(metadata), content),
            Layout::Legacy { content } => (None, content),
        };

        let plaintext = match open_segment(key, content_segment) {
            Ok(plaintext) => plaintext,
            Err(reason) => return self.undecryptable(path, bytes, reason),
        };

        let Some(metadata_segment) = metadata_segment else {
            return Ok(Opened {
                plaintext,
                metadata: None,
                integrity: Integrity::Unchecked,
            });
        };

        let metadata = match open_metadata(key, metadata_segment) {
            Ok(metadata) => metadata,
            Err(reason) => {
                warn!(path = %path.display(), error = %reason, "metadata segment unreadable");
                if self.config.integrity_policy == IntegrityPolicy::FailClosed {
                    return Err(BlobError::DecryptionFailure {
                        path: path.display().to_string(),
                        reason: format!("metadata segment: {reason}"),
                    });
                }
                return Ok(Opened {
                    plaintext,
                    metadata: None,
                    integrity: Integrity::MetadataUnreadable { reason },
                });
            }
        };

        let actual = hasher::content_digest(&plaintext);
        if hasher::digests_match(&metadata.content_digest, &actual) {
            return Ok(Opened {
                plaintext,
                metadata: Some(metadata),
                integrity: Integrity::Verified,
            });
        }

        warn!(path = %path.display(), "content digest mismatch");
        let expected = metadata.content_digest.clone();
        if self.config.integrity_policy == IntegrityPolicy::FailClosed {
            return Err(BlobError::IntegrityMismatch {
                path: path.display().to_string(),
                expected,
                actual,
            });
        }
        Ok(Opened {
            plaintext,
            metadata: Some(metadata),
            integrity: Integrity::Mismatch { expected, actual },
        })
    }

    /// Content that will not decrypt: raw bytes under the availability
    /// policy, an error otherwise.
    fn undecryptable(&self, path: &Path, bytes: &[u8], reason: String) -> Result<Opened, BlobError> {
        warn!(path = %path.display(), error = %reason, "content segment did not decrypt");
        match self.config.integrity_policy {
            IntegrityPolicy::FailClosed => Err(BlobError::DecryptionFailure {
                path: path.display().to_string(),
                reason,
            }),
            IntegrityPolicy::Availability => Ok(Opened {
                plaintext: Zeroizing::new(bytes.to_vec()),
                metadata: None,
                integrity: Integrity::DecryptionFailed { reason },
            }),
        }
    }

    /// Decrypt just the metadata segment of `path`. `None` when the blob has
    /// no readable metadata.
    async fn read_metadata(&self, path: &Path) -> Result<Option<BlobMetadata>, BlobError> {
        let Some(segment) = read_metadata_segment(path)
            .await
            .map_err(|e| BlobError::io(path, &e))?
        else {
            return Ok(None);
        };
        let key = self.keys.get_or_create_key().await?;
        match open_metadata(&key, &segment) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(reason) => {
                debug!(path = %path.display(), error = %reason, "metadata segment unreadable");
                Ok(None)
            }
        }
    }

    /// Write blob bytes and the sidecar derived from what landed on disk.
    async fn write_blob(&self, path: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        if let Err(e) = write_private(path, bytes).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                if let Err(cleanup) = eraser::erase(path, TEMP_ERASE_PASSES).await {
                    debug!(path = %path.display(), error = %cleanup, "partial blob cleanup failed");
                }
            }
            return Err(BlobError::io(path, &e));
        }

        let head = read_head(path).await.map_err(|e| BlobError::io(path, &e))?;
        let sidecar = format::sidecar_path(path);
        if let Err(e) = write_private(&sidecar, hasher::digest(&head).as_bytes()).await {
            warn!(path = %sidecar.display(), error = %e, "failed to write verification sidecar");
        }
        Ok(())
    }

    async fn erase_leftover_temps(&self, stem: &str) -> Result<EraseReport, BlobError> {
        let dir = &self.config.temp_dir;
        let io_err = |e: std::io::Error| BlobError::io(dir, &e);

        let mut report = EraseReport::default();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(io_err(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| manifest::is_temp_for(name, stem));
            if matches {
                report.merge(eraser::erase(&entry.path(), TEMP_ERASE_PASSES).await?);
            }
        }
        Ok(report)
    }

    /// Canonical path of `path` if it names a `.enc` file directly inside
    /// the vault. The file itself need not exist.
    async fn resolve_blob(&self, path: &Path) -> Option<PathBuf> {
        if !has_blob_extension(path) {
            return None;
        }
        let resolved = resolve(path).await?;
        (resolved.parent() == Some(self.config.vault_dir.as_path())).then_some(resolved)
    }

    /// Canonical path of `path` if it names a `temp_*` file directly inside
    /// the temp directory.
    async fn resolve_temp(&self, path: &Path) -> Option<PathBuf> {
        let is_temp = path
            .file_name()
            .and_then(OsStr::to_str)
            .is_some_and(|name| name.starts_with(TEMP_PREFIX));
        if !is_temp {
            return None;
        }
        let resolved = resolve(path).await?;
        (resolved.parent() == Some(self.config.temp_dir.as_path())).then_some(resolved)
    }

    /// `temp_<blob stem>_<uuid><.ext>`, with the extension taken from the
    /// stored logical name when it is short and plain alphanumeric.
    fn temp_path_for(&self, blob: &Path, metadata: Option<&BlobMetadata>) -> PathBuf {
        let ext = metadata
            .and_then(|m| Path::new(&m.original_name).extension())
            .and_then(OsStr::to_str)
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_TEMP_EXT_LEN
                    && ext.bytes().all(|b| b.is_ascii_alphanumeric())
            })
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default();
        let name = format!(
            "{}{}{ext}",
            manifest::temp_prefix_for(&blob_stem(blob)),
            Uuid::new_v4().simple()
        );
        self.config.temp_dir.join(name)
    }
}

fn seal(key: &EncryptionKey, metadata_json: &[u8], content: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let metadata = crypto::encrypt(key, metadata_json)?;
    let content = crypto::encrypt(key, content)?;
    Ok(format::join(
        &format::encode_segment(&metadata),
        &format::encode_segment(&content),
    ))
}

fn open_segment(key: &EncryptionKey, segment: &[u8]) -> Result<Zeroizing<Vec<u8>>, String> {
    let frame = format::decode_segment(segment).map_err(|e| e.to_string())?;
    crypto::decrypt(key, &frame)
        .map(Zeroizing::new)
        .map_err(|e| e.to_string())
}

fn open_metadata(key: &EncryptionKey, segment: &[u8]) -> Result<BlobMetadata, String> {
    let json = open_segment(key, segment)?;
    BlobMetadata::from_json(&json).map_err(|e| e.to_string())
}

fn has_blob_extension(path: &Path) -> bool {
    path.extension().and_then(OsStr::to_str) == Some(BLOB_EXTENSION)
}

fn blob_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Recover the logical base name from a `<base>_<digest>` stem, for blobs
/// with no readable metadata.
fn logical_name_from_stem(stem: &str) -> String {
    match stem.rsplit_once('_') {
        Some((base, digest))
            if digest.len() == NAME_DIGEST_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            base.to_owned()
        }
        _ => stem.to_owned(),
    }
}

/// Canonicalize `path`, or its parent when the file itself does not exist.
async fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path).await {
        return Some(resolved);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::canonicalize(parent).await.ok().map(|dir| dir.join(name))
}

/// Fail if any two directories are equal or nested.
fn check_disjoint(dirs: &[(&str, &PathBuf)]) -> Result<(), BlobError> {
    for (i, (a_name, a)) in dirs.iter().enumerate() {
        for (b_name, b) in &dirs[i + 1..] {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(BlobError::Layout {
                    reason: format!(
                        "{a_name} directory '{}' overlaps {b_name} directory '{}'",
                        a.display(),
                        b.display()
                    ),
                });
            }
        }
    }
    Ok(())
}

async fn prepare_dir(dir: &Path) -> Result<PathBuf, BlobError> {
    create_private_dir(dir)
        .await
        .map_err(|e| BlobError::io(dir, &e))?;
    fs::canonicalize(dir)
        .await
        .map_err(|e| BlobError::io(dir, &e))
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SAMPLE_LEN);
    file.take(SAMPLE_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Read up to the first delimiter. `None` if there is none within
/// [`MAX_METADATA_SEGMENT`] bytes.
async fn read_metadata_segment(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let mut file = fs::File::open(path).await?;
    let mut segment = Vec::new();
    let mut chunk = vec![0u8; 8 * 1024];

    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        // A delimiter may straddle two chunks.
        let search_from = segment.len().saturating_sub(DELIMITER.len() - 1);
        segment.extend_from_slice(&chunk[..n]);
        if let Some(at) = segment[search_from..]
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER)
        {
            segment.truncate(search_from + at);
            return Ok(Some(segment));
        }
        if segment.len() > MAX_METADATA_SEGMENT {
            return Ok(None);
        }
    }
}

/// Create a new owner-only file holding `bytes`. Fails if it already exists.
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(path).await
}

#[cfg(not(unix))]
async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use mediavault_storage::MemoryBackend;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        keys: Arc<KeyStore>,
        store: BlobStore,
    }

    async fn fixture_with(policy: IntegrityPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::new(dir.path());
        config.integrity_policy = policy;
        let keys = Arc::new(KeyStore::new(Arc::new(MemoryBackend::new())));
        let store = BlobStore::open(config, Arc::clone(&keys)).await.unwrap();
        Fixture { dir, keys, store }
    }

    async fn fixture() -> Fixture {
        fixture_with(IntegrityPolicy::Availability).await
    }

    impl Fixture {
        fn source(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        async fn stored(&self, name: &str, content: &[u8]) -> PathBuf {
            let source = self.source(name, content);
            let outcome = self.store.store(&source, name).await.unwrap();
            assert!(outcome.is_encrypted());
            outcome.into_path()
        }

        /// Write a blob by hand from a metadata record and content.
        async fn forged(&self, name: &str, metadata_segment: &[u8], content: &[u8]) -> PathBuf {
            let key = self.keys.get_or_create_key().await.unwrap();
            let content = format::encode_segment(&crypto::encrypt(&key, content).unwrap());
            let path = self.store.config().vault_dir.join(name);
            std::fs::write(&path, format::join(metadata_segment, &content)).unwrap();
            path
        }

        async fn metadata_segment(&self, metadata: &BlobMetadata) -> Vec<u8> {
            let key = self.keys.get_or_create_key().await.unwrap();
            let frame = crypto::encrypt(&key, &metadata.to_json().unwrap()).unwrap();
            format::encode_segment(&frame)
        }

        fn temp_files(&self) -> Vec<PathBuf> {
            let mut files: Vec<_> = std::fs::read_dir(&self.store.config().temp_dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            files.sort();
            files
        }
    }

    #[tokio::test]
    async fn store_names_blob_and_writes_sidecar() {
        let fx = fixture().await;
        let blob = fx.stored("My Photo.JPG", b"pixels").await;

        let name = blob.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("My_Photo_"));
        assert!(name.ends_with(".enc"));
        assert_eq!(name.len(), "My_Photo_".len() + NAME_DIGEST_LEN + ".enc".len());
        assert!(format::sidecar_path(&blob).exists());

        let raw = std::fs::read(&blob).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"pixels"));
    }

    #[tokio::test]
    async fn store_missing_source_is_source_unavailable() {
        let fx = fixture().await;
        let err = fx
            .store
            .store(&fx.dir.path().join("nope.jpg"), "nope.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn materialize_roundtrip_is_verified() {
        let fx = fixture().await;
        let blob = fx.stored("clip.MOV", b"frames").await;

        let out = fx.store.materialize(&blob).await.unwrap();
        assert_eq!(out.integrity, Integrity::Verified);
        assert_eq!(std::fs::read(&out.path).unwrap(), b"frames");
        assert_eq!(out.path.extension().unwrap(), "mov");
        let meta = out.metadata.unwrap();
        assert_eq!(meta.original_name, "clip.MOV");
        assert_eq!(meta.mime_type, "video/*");
        assert_eq!(meta.original_size, 6);
    }

    #[tokio::test]
    async fn materialize_passes_through_foreign_paths() {
        let fx = fixture().await;
        let original = fx.source("photo.jpg", b"mine");

        let out = fx.store.materialize(&original).await.unwrap();
        assert_eq!(out.integrity, Integrity::Passthrough);
        assert_eq!(out.path, original);

        // Releasing a passthrough must not touch the caller's file.
        let report = fx.store.release(&out.path).await.unwrap();
        assert!(report.is_noop());
        assert!(original.exists());

        // An .enc outside the vault is foreign too.
        let stray = fx.source("stray.enc", b"x");
        let out = fx.store.materialize(&stray).await.unwrap();
        assert_eq!(out.integrity, Integrity::Passthrough);
    }

    #[tokio::test]
    async fn release_erases_temp_file() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        let out = fx.store.materialize(&blob).await.unwrap();

        let report = fx.store.release(&out.path).await.unwrap();
        assert_eq!(report.removed(), 1);
        assert!(!out.path.exists());
        assert!(!fx.store.manifest.contains(&out.path).await);
    }

    #[tokio::test]
    async fn destroy_removes_blob_sidecar_and_plaintext_copies() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        let first = fx.store.materialize(&blob).await.unwrap();
        let second = fx.store.materialize(&blob).await.unwrap();

        // Left behind by an earlier process, so not in the manifest.
        let stem = blob_stem(&blob);
        let leftover = fx
            .store
            .config()
            .temp_dir
            .join(format!("temp_{stem}_{}.jpg", Uuid::new_v4().simple()));
        std::fs::write(&leftover, b"abc").unwrap();
        // Belongs to a blob whose base name is this blob's stem.
        let unrelated = fx.store.config().temp_dir.join(format!(
            "temp_{stem}_aaaaaaaaaaaa_{}.jpg",
            Uuid::new_v4().simple()
        ));
        std::fs::write(&unrelated, b"zzz").unwrap();

        let report = fx.store.destroy(&blob).await.unwrap();
        assert!(report.is_secure());
        assert_eq!(report.erased, 5);
        assert!(!blob.exists());
        assert!(!format::sidecar_path(&blob).exists());
        assert!(!first.path.exists());
        assert!(!second.path.exists());
        assert!(!leftover.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_ignores_foreign_paths() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        assert!(!fx.store.destroy(&blob).await.unwrap().is_noop());
        assert!(fx.store.destroy(&blob).await.unwrap().is_noop());

        let mine = fx.source("keep.jpg", b"keep");
        assert!(fx.store.destroy(&mine).await.unwrap().is_noop());
        assert!(mine.exists());
    }

    #[tokio::test]
    async fn mismatch_is_flagged_under_availability() {
        let fx = fixture().await;
        let mut meta = BlobMetadata::describe("x.jpg", b"original", Utc::now());
        meta.content_digest = hasher::content_digest(b"something else");
        let segment = fx.metadata_segment(&meta).await;
        let blob = fx.forged("x_000000000000.enc", &segment, b"original").await;

        let out = fx.store.materialize(&blob).await.unwrap();
        assert!(matches!(out.integrity, Integrity::Mismatch { .. }));
        assert_eq!(std::fs::read(&out.path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn mismatch_is_rejected_when_fail_closed() {
        let fx = fixture_with(IntegrityPolicy::FailClosed).await;
        let mut meta = BlobMetadata::describe("x.jpg", b"original", Utc::now());
        meta.content_digest = hasher::content_digest(b"something else");
        let segment = fx.metadata_segment(&meta).await;
        let blob = fx.forged("x_000000000000.enc", &segment, b"original").await;

        let err = fx.store.materialize(&blob).await.unwrap_err();
        assert!(matches!(err, BlobError::IntegrityMismatch { .. }));
        assert!(fx.temp_files().is_empty());
    }

    #[tokio::test]
    async fn unreadable_metadata_still_returns_content() {
        let fx = fixture().await;
        let blob = fx.forged("x_000000000000.enc", b"QUJD", b"content").await;

        let out = fx.store.materialize(&blob).await.unwrap();
        assert!(matches!(out.integrity, Integrity::MetadataUnreadable { .. }));
        assert!(out.metadata.is_none());
        assert_eq!(std::fs::read(&out.path).unwrap(), b"content");
    }

    #[tokio::test]
    async fn undecryptable_content_depends_on_policy() {
        let raw = b"plain bytes :: not a blob";

        let fx = fixture().await;
        let blob = fx.store.config().vault_dir.join("p_000000000000.enc");
        std::fs::write(&blob, raw).unwrap();
        let out = fx.store.materialize(&blob).await.unwrap();
        assert!(matches!(out.integrity, Integrity::DecryptionFailed { .. }));
        assert_eq!(std::fs::read(&out.path).unwrap(), raw);

        let fx = fixture_with(IntegrityPolicy::FailClosed).await;
        let blob = fx.store.config().vault_dir.join("p_000000000000.enc");
        std::fs::write(&blob, raw).unwrap();
        let err = fx.store.materialize(&blob).await.unwrap_err();
        assert!(matches!(err, BlobError::DecryptionFailure { .. }));
    }

    #[tokio::test]
    async fn verify_detects_tampering() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", &[7u8; 4096]).await;
        assert!(fx.store.verify(&blob).await.unwrap());

        let mut raw = std::fs::read(&blob).unwrap();
        raw[10] ^= 0x01;
        std::fs::write(&blob, raw).unwrap();
        assert!(!fx.store.verify(&blob).await.unwrap());
    }

    #[tokio::test]
    async fn verify_without_sidecar_checks_structure() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        std::fs::remove_file(format::sidecar_path(&blob)).unwrap();
        assert!(fx.store.verify(&blob).await.unwrap());

        let junk = fx.store.config().vault_dir.join("junk_000000000000.enc");
        std::fs::write(&junk, b"no delimiter here").unwrap();
        assert!(!fx.store.verify(&junk).await.unwrap());

        let missing = fx.store.config().vault_dir.join("gone_000000000000.enc");
        assert!(!fx.store.verify(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn get_info_reads_metadata_without_content() {
        let fx = fixture().await;
        let meta = BlobMetadata::describe("song.mp3", b"audio", Utc::now());
        let segment = fx.metadata_segment(&meta).await;
        // Content segment is garbage; metadata alone must still come back.
        let blob = fx.store.config().vault_dir.join("song_000000000000.enc");
        std::fs::write(&blob, format::join(&segment, b"!!!!")).unwrap();

        let info = fx.store.get_info(&blob).await.unwrap();
        assert!(info.exists);
        assert!(info.modified_at.is_some());
        assert_eq!(info.metadata.unwrap(), meta);

        let gone = fx.store.get_info(&fx.dir.path().join("gone.enc")).await.unwrap();
        assert!(!gone.exists);
        assert!(gone.metadata.is_none());
    }

    #[tokio::test]
    async fn re_encrypt_replaces_blob() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;

        let fresh = fx.store.re_encrypt(&blob).await.unwrap().unwrap();
        assert_ne!(fresh, blob);
        assert!(!blob.exists());
        assert!(fx.temp_files().is_empty());

        let out = fx.store.materialize(&fresh).await.unwrap();
        assert_eq!(out.integrity, Integrity::Verified);
        assert_eq!(out.metadata.unwrap().original_name, "a.jpg");
        assert_eq!(std::fs::read(&out.path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn re_encrypt_keeps_undecryptable_blob() {
        let fx = fixture().await;
        let blob = fx.store.config().vault_dir.join("p_000000000000.enc");
        std::fs::write(&blob, b"plain").unwrap();

        assert!(fx.store.re_encrypt(&blob).await.unwrap().is_none());
        assert!(blob.exists());
        assert!(fx.temp_files().is_empty());
    }

    #[tokio::test]
    async fn list_returns_sorted_blobs_only() {
        let fx = fixture().await;
        let a = fx.stored("a.jpg", b"1").await;
        let b = fx.stored("b.jpg", b"2").await;

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(fx.store.list().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn sweep_erases_stale_temp_files() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        let out = fx.store.materialize(&blob).await.unwrap();
        let other = fx.store.config().temp_dir.join("notes.txt");
        std::fs::write(&other, b"keep").unwrap();

        assert_eq!(fx.store.sweep_temp(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(fx.store.sweep_temp(Duration::ZERO).await.unwrap(), 1);
        assert!(!out.path.exists());
        assert!(other.exists());
        assert!(!fx.store.manifest.contains(&out.path).await);
    }

    #[tokio::test]
    async fn destroy_vault_erases_blobs_then_key() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        assert!(fx.keys.has_key().await.unwrap());

        fx.store.destroy_vault().await.unwrap();
        assert!(!blob.exists());
        assert!(fx.store.list().await.unwrap().is_empty());
        assert!(!fx.keys.has_key().await.unwrap());
    }

    #[tokio::test]
    async fn wipe_spares_foreign_files_in_temp_dir() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;
        let out = fx.store.materialize(&blob).await.unwrap();
        let foreign = fx.store.config().temp_dir.join("notes.txt");
        std::fs::write(&foreign, b"not ours").unwrap();

        let report = fx.store.wipe_all().await.unwrap();
        assert!(report.removed() >= 3);
        assert!(!blob.exists());
        assert!(!out.path.exists());
        assert_eq!(std::fs::read(&foreign).unwrap(), b"not ours");
        assert!(fx.store.config().vault_dir.is_dir());
    }

    #[tokio::test]
    async fn open_rejects_overlapping_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyStore::new(Arc::new(MemoryBackend::new())));

        let mut config = VaultConfig::new(dir.path());
        config.key_dir = config.vault_dir.join("keys");
        let err = BlobStore::open(config, Arc::clone(&keys)).await.unwrap_err();
        assert!(matches!(err, BlobError::Layout { .. }), "{err}");

        let mut config = VaultConfig::new(dir.path());
        config.temp_dir = config.vault_dir.clone();
        let err = BlobStore::open(config, keys).await.unwrap_err();
        assert!(matches!(err, BlobError::Layout { .. }), "{err}");
    }

    #[tokio::test]
    async fn long_logical_names_roundtrip() {
        let fx = fixture().await;

        for name in [
            format!("{}.jpg", "a".repeat(220)),
            format!("{}.jpg", "b".repeat(300)),
            format!("clip.{}", "x".repeat(240)),
        ] {
            let blob = fx.store.store_bytes(b"pixels", &name).await.unwrap().into_path();
            let blob_name = blob.file_name().unwrap().len();
            assert!(blob_name + format::SIDECAR_SUFFIX.len() <= 255, "{blob_name}");

            let out = fx.store.materialize(&blob).await.unwrap();
            assert_eq!(out.integrity, Integrity::Verified);
            assert!(out.path.file_name().unwrap().len() <= 255);
            assert_eq!(std::fs::read(&out.path).unwrap(), b"pixels");
            assert_eq!(out.metadata.unwrap().original_name, name);
        }
    }

    fn failing_seal(_: &EncryptionKey, _: &[u8], _: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::Encryption {
            reason: "cipher unavailable".to_owned(),
        })
    }

    async fn failing_store(fx: &Fixture, allow_plaintext_fallback: bool) -> BlobStore {
        let mut config = fx.store.config().clone();
        config.allow_plaintext_fallback = allow_plaintext_fallback;
        BlobStore::open(config, Arc::clone(&fx.keys))
            .await
            .unwrap()
            .with_sealer(failing_seal)
    }

    #[tokio::test]
    async fn encryption_failure_stores_plain_copy() {
        let fx = fixture().await;
        let store = failing_store(&fx, true).await;
        let source = fx.source("shot.jpg", b"raw pixels!");

        let outcome = store.store(&source, "shot.jpg").await.unwrap();
        assert!(!outcome.is_encrypted());
        assert!(matches!(
            &outcome,
            StoreOutcome::StoredPlain { reason, .. } if reason.contains("cipher unavailable")
        ));
        let blob = outcome.path();
        assert_eq!(std::fs::read(blob).unwrap(), b"raw pixels!");
        assert!(format::sidecar_path(blob).exists());
        assert!(store.verify(blob).await.unwrap());

        let out = store.materialize(blob).await.unwrap();
        assert!(matches!(out.integrity, Integrity::DecryptionFailed { .. }));
        assert_eq!(std::fs::read(&out.path).unwrap(), b"raw pixels!");
    }

    #[tokio::test]
    async fn encryption_failure_without_fallback_is_an_error() {
        let fx = fixture().await;
        let store = failing_store(&fx, false).await;
        let source = fx.source("shot.jpg", b"raw pixels!");

        let err = store.store(&source, "shot.jpg").await.unwrap_err();
        assert!(matches!(err, BlobError::EncryptionFailure { .. }), "{err}");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_encrypt_keeps_blob_when_new_copy_fails() {
        let fx = fixture().await;
        let blob = fx.stored("a.jpg", b"abc").await;

        for allow_plaintext_fallback in [false, true] {
            let store = failing_store(&fx, allow_plaintext_fallback).await;
            assert!(store.re_encrypt(&blob).await.unwrap().is_none());
            assert_eq!(store.list().await.unwrap(), vec![blob.clone()]);
            assert!(fx.temp_files().is_empty());
        }
        assert!(fx.store.verify(&blob).await.unwrap());
    }

    #[tokio::test]
    async fn re_encrypt_and_destroy_are_serialized() {
        let fx = fixture().await;
        let store = Arc::new(fx.store);

        for round in 0..8 {
            let source = fx.dir.path().join(format!("r{round}.jpg"));
            std::fs::write(&source, b"frames").unwrap();
            let blob = store.store(&source, "r.jpg").await.unwrap().into_path();

            let re = {
                let store = Arc::clone(&store);
                let blob = blob.clone();
                tokio::spawn(async move { store.re_encrypt(&blob).await.unwrap() })
            };
            let destroy = {
                let store = Arc::clone(&store);
                let blob = blob.clone();
                tokio::spawn(async move { store.destroy(&blob).await.unwrap() })
            };
            let fresh = re.await.unwrap();
            destroy.await.unwrap();

            assert!(!blob.exists());
            let remaining = store.list().await.unwrap();
            match fresh {
                Some(fresh) => {
                    assert_eq!(remaining, vec![fresh.clone()]);
                    store.destroy(&fresh).await.unwrap();
                }
                None => assert!(remaining.is_empty()),
            }
        }
    }

    #[test]
    fn logical_name_recovered_from_stem() {
        assert_eq!(logical_name_from_stem("photo_0123456789ab"), "photo");
        assert_eq!(logical_name_from_stem("my_trip_0123456789ab"), "my_trip");
        assert_eq!(logical_name_from_stem("no_digest"), "no_digest");
    }
}
