//! Vault configuration.
//!
//! Built from a root directory with sensible defaults, or loaded from
//! `MEDIAVAULT_*` environment variables. Unparseable values fall back to the
//! default rather than failing startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::eraser::DEFAULT_PASSES;

/// What `materialize` does when a blob fails its integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityPolicy {
    /// Return the best available bytes and flag the problem.
    #[default]
    Availability,
    /// Refuse to return bytes that did not verify.
    FailClosed,
}

impl FromStr for IntegrityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "availability" | "available" => Ok(Self::Availability),
            "fail-closed" | "fail_closed" | "strict" => Ok(Self::FailClosed),
            other => Err(format!("unknown integrity policy '{other}'")),
        }
    }
}

impl fmt::Display for IntegrityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Availability => f.write_str("availability"),
            Self::FailClosed => f.write_str("fail-closed"),
        }
    }
}

/// Blob store configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Base directory the other paths default under.
    pub root: PathBuf,
    /// Directory holding `*.enc` blobs and their `.verify` sidecars.
    pub vault_dir: PathBuf,
    /// Volatile directory for materialized `temp_*` plaintext files.
    pub temp_dir: PathBuf,
    /// Directory for the file key backend.
    pub key_dir: PathBuf,
    /// Overwrite passes when destroying blobs and sidecars.
    pub erase_passes: u32,
    /// Behaviour of `materialize` on integrity failures.
    pub integrity_policy: IntegrityPolicy,
    /// Whether `store` may fall back to an unencrypted copy when encryption
    /// fails.
    pub allow_plaintext_fallback: bool,
    /// Age after which the cache sweep erases temp plaintext files.
    pub temp_max_age_secs: u64,
    /// Log filter (e.g. `warn`, `mediavault_core=debug`).
    pub log_level: String,
}

impl VaultConfig {
    /// Default configuration rooted at `root`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            root: root.to_path_buf(),
            vault_dir: root.join("vault"),
            temp_dir: root.join("cache"),
            key_dir: root.join("keys"),
            erase_passes: DEFAULT_PASSES,
            integrity_policy: IntegrityPolicy::default(),
            allow_plaintext_fallback: true,
            temp_max_age_secs: 3600,
            log_level: "warn".to_owned(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MEDIAVAULT_ROOT`: base directory (default: `./mediavault-data`)
    /// - `MEDIAVAULT_VAULT_DIR`: blob directory (default: `<root>/vault`)
    /// - `MEDIAVAULT_TEMP_DIR`: temp plaintext directory (default: `<root>/cache`)
    /// - `MEDIAVAULT_KEY_DIR`: key backend directory (default: `<root>/keys`)
    /// - `MEDIAVAULT_ERASE_PASSES`: overwrite passes (default: `3`)
    /// - `MEDIAVAULT_INTEGRITY_POLICY`: `availability` or `fail-closed` (default: `availability`)
    /// - `MEDIAVAULT_ALLOW_PLAINTEXT_FALLBACK`: (default: `true`)
    /// - `MEDIAVAULT_TEMP_MAX_AGE`: seconds before temp files are swept (default: `3600`)
    /// - `MEDIAVAULT_LOG_LEVEL`: log filter (default: `warn`)
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var("MEDIAVAULT_ROOT")
            .unwrap_or_else(|_| "./mediavault-data".to_owned());
        Self::from_env_with_root(root)
    }

    /// Like [`from_env`](Self::from_env) but with an explicit root, which
    /// the per-directory variables still override.
    #[must_use]
    pub fn from_env_with_root(root: impl AsRef<Path>) -> Self {
        let mut config = Self::new(root);

        if let Ok(dir) = std::env::var("MEDIAVAULT_VAULT_DIR") {
            config.vault_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("MEDIAVAULT_TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("MEDIAVAULT_KEY_DIR") {
            config.key_dir = PathBuf::from(dir);
        }

        config.erase_passes = std::env::var("MEDIAVAULT_ERASE_PASSES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&p: &u32| p > 0)
            .unwrap_or(DEFAULT_PASSES);

        config.integrity_policy = std::env::var("MEDIAVAULT_INTEGRITY_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        config.allow_plaintext_fallback = std::env::var("MEDIAVAULT_ALLOW_PLAINTEXT_FALLBACK")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        config.temp_max_age_secs = std::env::var("MEDIAVAULT_TEMP_MAX_AGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        config.log_level =
            std::env::var("MEDIAVAULT_LOG_LEVEL").unwrap_or_else(|_| "warn".to_owned());

        config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_lays_out_dirs_under_root() {
        let config = VaultConfig::new("/data/mv");
        assert_eq!(config.root, Path::new("/data/mv"));
        assert_eq!(config.vault_dir, Path::new("/data/mv/vault"));
        assert_eq!(config.temp_dir, Path::new("/data/mv/cache"));
        assert_eq!(config.key_dir, Path::new("/data/mv/keys"));
        assert_eq!(config.erase_passes, 3);
        assert_eq!(config.integrity_policy, IntegrityPolicy::Availability);
        assert!(config.allow_plaintext_fallback);
    }

    #[test]
    fn integrity_policy_parses() {
        assert_eq!(
            "fail-closed".parse::<IntegrityPolicy>().unwrap(),
            IntegrityPolicy::FailClosed
        );
        assert_eq!(
            "Availability".parse::<IntegrityPolicy>().unwrap(),
            IntegrityPolicy::Availability
        );
        assert!("whatever".parse::<IntegrityPolicy>().is_err());
        assert_eq!(IntegrityPolicy::FailClosed.to_string(), "fail-closed");
    }
}
