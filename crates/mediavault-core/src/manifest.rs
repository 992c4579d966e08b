//! Which temp plaintext files belong to which blob.
//!
//! Every successful materialization records `blob -> temp` here, so
//! destroying a blob erases exactly the plaintext copies made from it in
//! this process. Copies left by an earlier process are found by their
//! `temp_<blob stem>_` name prefix instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Prefix shared by every temp plaintext file name.
pub const TEMP_PREFIX: &str = "temp_";

/// Length of the simple-form UUID that makes each temp name unique.
pub const TEMP_ID_LEN: usize = 32;

/// In-memory map from blob path to the temp files materialized from it.
#[derive(Debug, Default)]
pub struct TempManifest {
    entries: Mutex<HashMap<PathBuf, Vec<PathBuf>>>,
}

impl TempManifest {
    /// Create an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `temp` was materialized from `blob`.
    pub async fn record(&self, blob: &Path, temp: &Path) {
        let mut entries = self.entries.lock().await;
        entries
            .entry(blob.to_path_buf())
            .or_default()
            .push(temp.to_path_buf());
    }

    /// Remove and return every temp file recorded for `blob`.
    pub async fn take_for_blob(&self, blob: &Path) -> Vec<PathBuf> {
        let mut entries = self.entries.lock().await;
        entries.remove(blob).unwrap_or_default()
    }

    /// Forget a single temp file. Returns whether it was recorded.
    pub async fn forget(&self, temp: &Path) -> bool {
        let mut entries = self.entries.lock().await;
        let mut found = false;
        entries.retain(|_, temps| {
            let before = temps.len();
            temps.retain(|t| t != temp);
            found |= temps.len() != before;
            !temps.is_empty()
        });
        found
    }

    /// Whether `temp` is currently recorded for any blob.
    pub async fn contains(&self, temp: &Path) -> bool {
        let entries = self.entries.lock().await;
        entries.values().any(|temps| temps.iter().any(|t| t == temp))
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// File-name prefix of temp files materialized from the blob with `stem`.
#[must_use]
pub fn temp_prefix_for(blob_stem: &str) -> String {
    format!("{TEMP_PREFIX}{blob_stem}_")
}

/// Whether `file_name` is a temp file materialized from the blob with `stem`.
///
/// The prefix alone is not enough: a blob whose logical name happens to be
/// another blob's stem would share it. After the prefix there must be exactly
/// a 32-hex-digit id and an optional extension.
#[must_use]
pub fn is_temp_for(file_name: &str, blob_stem: &str) -> bool {
    let Some(rest) = file_name.strip_prefix(&temp_prefix_for(blob_stem)) else {
        return false;
    };
    let id = rest.split_once('.').map_or(rest, |(id, _)| id);
    id.len() == TEMP_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}
