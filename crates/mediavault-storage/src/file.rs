//! Filesystem storage backend, the production default.
//!
//! Each key maps to one file under the root directory (`sys/blob_key` →
//! `<root>/sys/blob_key`). Writes go to a sibling temp file first and are
//! renamed into place, so a crash never leaves a half-written key.
//!
//! On Unix, files are created with mode `0600` and directories with `0700`,
//! which is what makes this backend report itself as secure. Elsewhere the
//! platform offers no such guarantee and [`FileBackend::is_secure`] is
//! `false`.

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{StorageBackend, StorageError};

/// A storage backend writing one file per key below a root directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a file backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the root directory cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        create_private_dir(&root)
            .await
            .map_err(|e| StorageError::Open {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { root })
    }

    /// Return the root directory of this backend.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage key onto a path inside the root.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidKey {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };

        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(invalid("key must be a relative path without '.' or '..'")),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let write_err = |e: std::io::Error| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            create_private_dir(parent).await.map_err(write_err)?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = private_file_options()
            .open(&temp)
            .await
            .map_err(write_err)?;
        file.write_all(value).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        fs::rename(&temp, &path).await.map_err(write_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path).await.map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    }

    fn is_secure(&self) -> bool {
        cfg!(unix)
    }
}

#[cfg(unix)]
fn private_file_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn private_file_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    options
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
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("keys")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let (_dir, backend) = backend().await;
        backend.put("sys/blob_key", b"secret").await.unwrap();
        let val = backend.get("sys/blob_key").await.unwrap();
        assert_eq!(val, Some(b"secret".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (_dir, backend) = backend().await;
        assert_eq!(backend.get("sys/nothing").await.unwrap(), None);
        assert!(!backend.exists("sys/nothing").await.unwrap());
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let (dir, backend) = backend().await;
        backend.put("sys/blob_key", b"v1").await.unwrap();

        let reopened = FileBackend::open(dir.path().join("keys")).await.unwrap();
        assert_eq!(
            reopened.get("sys/blob_key").await.unwrap(),
            Some(b"v1".to_vec())
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, backend) = backend().await;
        backend.put("sys/blob_key", b"v").await.unwrap();
        backend.delete("sys/blob_key").await.unwrap();
        backend.delete("sys/blob_key").await.unwrap();
        assert!(!backend.exists("sys/blob_key").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, backend) = backend().await;
        for key in ["", "../outside", "/etc/passwd", "sys/../../x"] {
            let result = backend.put(key, b"x").await;
            assert!(
                matches!(result, Err(StorageError::InvalidKey { .. })),
                "key {key:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, backend) = backend().await;
        backend.put("sys/blob_key", b"secret").await.unwrap();
        let meta = std::fs::metadata(backend.root().join("sys/blob_key")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(backend.is_secure());
    }
}
