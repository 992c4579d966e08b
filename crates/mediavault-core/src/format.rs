//! On-disk blob layout.
//!
//! A blob file is two base64 segments joined by [`DELIMITER`]:
//!
//! ```text
//! base64(frame(metadata json)) "::" base64(frame(content))
//! ```
//!
//! Metadata and content are encrypted separately so the metadata can be
//! read without decrypting a large video. The standard base64 alphabet never
//! contains `:`, so the first delimiter found is always the separator.
//!
//! Blobs written before metadata existed hold a single segment with no
//! delimiter. [`split`] reports those as [`Layout::Legacy`].

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::CipherVersion;
use crate::error::FormatError;
use crate::hasher;

/// Separator between the metadata and content segments.
pub const DELIMITER: &[u8] = b"::";

/// File extension of blob files.
pub const BLOB_EXTENSION: &str = "enc";

/// Suffix appended to a blob path to name its verification sidecar.
pub const SIDECAR_SUFFIX: &str = ".verify";

/// Longest base name kept from a logical name.
///
/// Derived names add at most a 12-hex digest plus `.enc.verify` for blobs, or
/// `temp_`, a 32-hex id and a short extension for temp files. Capping the
/// base here keeps all of them under the common 255-byte file name limit.
pub const MAX_BASE_NAME_LEN: usize = 128;

/// Metadata record stored, encrypted, in the first segment of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    /// Coarse MIME family derived from the logical name's extension.
    pub mime_type: String,
    /// Logical name the caller stored the file under.
    pub original_name: String,
    /// When the blob was stored.
    pub created_at: DateTime<Utc>,
    /// Plaintext size in bytes.
    pub original_size: u64,
    /// Cipher used for both segments.
    pub cipher_version: CipherVersion,
    /// Hex SHA-256 of the first KiB of plaintext.
    pub content_digest: String,
}

impl BlobMetadata {
    /// Build the metadata record for `content` stored as `logical_name`.
    #[must_use]
    pub fn describe(logical_name: &str, content: &[u8], created_at: DateTime<Utc>) -> Self {
        Self {
            mime_type: mime_family(logical_name).to_owned(),
            original_name: logical_name.to_owned(),
            created_at,
            original_size: content.len() as u64,
            cipher_version: CipherVersion::CURRENT,
            content_digest: hasher::content_digest(content),
        }
    }

    /// Serialize to the JSON bytes that get encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Metadata`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec(self).map_err(|e| FormatError::Metadata {
            reason: e.to_string(),
        })
    }

    /// Parse decrypted JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Metadata`] if the bytes are not a valid record.
    pub fn from_json(bytes: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(bytes).map_err(|e| FormatError::Metadata {
            reason: e.to_string(),
        })
    }
}

/// Coarse MIME family for a logical file name, by extension.
#[must_use]
pub fn mime_family(logical_name: &str) -> &'static str {
    let ext = Path::new(logical_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "bmp" | "tif" | "tiff" => {
            "image/*"
        }
        "mp4" | "mov" | "m4v" | "avi" | "mkv" | "webm" | "3gp" => "video/*",
        "mp3" | "m4a" | "aac" | "wav" | "ogg" | "flac" => "audio/*",
        _ => "application/octet-stream",
    }
}

/// The two shapes a blob file can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout<'a> {
    /// `metadata :: content`.
    Segmented { metadata: &'a [u8], content: &'a [u8] },
    /// Content only, from before metadata segments existed.
    Legacy { content: &'a [u8] },
}

/// Split raw blob bytes on the first delimiter.
#[must_use]
pub fn split(bytes: &[u8]) -> Layout<'_> {
    match bytes
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
    {
        Some(at) => Layout::Segmented {
            metadata: &bytes[..at],
            content: &bytes[at + DELIMITER.len()..],
        },
        None => Layout::Legacy { content: bytes },
    }
}

/// Join two encoded segments into blob file bytes.
#[must_use]
pub fn join(metadata: &[u8], content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(metadata.len() + DELIMITER.len() + content.len());
    out.extend_from_slice(metadata);
    out.extend_from_slice(DELIMITER);
    out.extend_from_slice(content);
    out
}

/// Encode an encrypted frame as a segment.
#[must_use]
pub fn encode_segment(frame: &[u8]) -> Vec<u8> {
    BASE64.encode(frame).into_bytes()
}

/// Decode a segment back into an encrypted frame.
///
/// Surrounding ASCII whitespace is ignored.
///
/// # Errors
///
/// Returns [`FormatError::Encoding`] if the segment is not valid base64.
pub fn decode_segment(segment: &[u8]) -> Result<Vec<u8>, FormatError> {
    BASE64
        .decode(segment.trim_ascii())
        .map_err(|e| FormatError::Encoding {
            reason: e.to_string(),
        })
}

/// Path of the verification sidecar for `blob`.
#[must_use]
pub fn sidecar_path(blob: &Path) -> std::path::PathBuf {
    let mut name = blob.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    std::path::PathBuf::from(name)
}

/// Reduce a logical name to a safe file-name stem.
///
/// Keeps `[A-Za-z0-9._-]` from the name without its extension and maps
/// everything else to `_`. The result is cut to [`MAX_BASE_NAME_LEN`]
/// bytes. Empty results become `blob`.
#[must_use]
pub fn base_name(logical_name: &str) -> String {
    let stem = Path::new(logical_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut cleaned = cleaned.trim_start_matches('.');
    // Every kept char is ASCII, so any byte index is a char boundary.
    if cleaned.len() > MAX_BASE_NAME_LEN {
        cleaned = &cleaned[..MAX_BASE_NAME_LEN];
    }
    if cleaned.is_empty() {
        "blob".to_owned()
    } else {
        cleaned.to_owned()
    }
}
