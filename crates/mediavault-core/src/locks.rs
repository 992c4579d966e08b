//! Per-path async locks.
//!
//! Serializes blob store operations on the same blob path so a `destroy`
//! cannot interleave with a `materialize` reading the same file. Different
//! paths never contend. Entries whose lock nobody holds are pruned on the
//! next acquisition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by path.
#[derive(Debug, Default)]
pub struct PathLocks {
    table: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`. Released when the guard drops.
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().await;
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(table.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of paths currently tracked.
    pub async fn tracked(&self) -> usize {
        self.table.lock().await.len()
    }
}
