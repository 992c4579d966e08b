//! Multi-pass secure erasure.
//!
//! [`erase`] overwrites a file in place before unlinking it, or walks a
//! directory depth-first doing the same for every file in it. Each pass
//! writes a pattern over the first window of the file, and over the last
//! window too when the file is larger than one window, then syncs to disk
//! before the next pass starts.
//!
//! Pass patterns: pass 0 is random, the last pass is all zero, and passes in
//! between alternate `0x55` / `0xAA`. A single-pass erase writes zeros.
//!
//! # Limitations
//!
//! - Only the head and tail windows (1 MiB each) are overwritten. The middle
//!   of a larger file is unlinked without being overwritten.
//! - Copy-on-write and journaling filesystems, and flash wear levelling, may
//!   keep old blocks around regardless of what is written here.
//! - A directory erase is not atomic. A crash part-way leaves some files
//!   erased and others untouched, never a file with recoverable new content.
//!
//! If an overwrite pass fails the file is still unlinked and the degradation
//! is recorded in the returned [`EraseReport`].

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::crypto;
use crate::error::EraseError;

/// Default number of overwrite passes.
pub const DEFAULT_PASSES: u32 = 3;

/// Largest region overwritten at each end of a file.
pub const MAX_WINDOW: u64 = 1024 * 1024;

/// A file whose overwrite failed and was removed by plain unlink instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedErase {
    /// The file that was unlinked without a complete overwrite.
    pub path: PathBuf,
    /// Why the overwrite failed.
    pub reason: String,
}

/// Outcome of an erase over a file or tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EraseReport {
    /// Files fully overwritten and unlinked.
    pub erased: usize,
    /// Files unlinked after a failed overwrite.
    pub degraded: Vec<DegradedErase>,
}

impl EraseReport {
    /// Whether nothing was found to erase.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.erased == 0 && self.degraded.is_empty()
    }

    /// Whether every file found was fully overwritten.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.degraded.is_empty()
    }

    /// Total files removed, secure or not.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.erased + self.degraded.len()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: EraseReport) {
        self.erased += other.erased;
        self.degraded.extend(other.degraded);
    }
}

/// Number of overwrite passes [`erase`] runs when asked for `passes`.
#[must_use]
pub fn effective_passes(passes: u32) -> u32 {
    passes.max(1)
}

/// Securely erase the file or directory tree at `path`.
///
/// A missing path is a no-op. `passes` of zero is treated as one.
///
/// # Errors
///
/// Returns [`EraseError`] only when something could not be removed at all.
/// Overwrite failures are reported through [`EraseReport::degraded`].
pub async fn erase(path: &Path, passes: u32) -> Result<EraseReport, EraseError> {
    let passes = effective_passes(passes);
    let mut report = EraseReport::default();

    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "nothing to erase");
            return Ok(report);
        }
        Err(e) => {
            return Err(EraseError::Metadata {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };

    if meta.is_dir() {
        erase_dir(path, passes, &mut report).await?;
    } else if meta.file_type().is_symlink() {
        // Overwriting would clobber the link target, so only the link goes.
        remove_file(path).await?;
        report.erased += 1;
    } else {
        erase_file(path, meta.len(), passes, &mut report).await?;
    }
    Ok(report)
}

fn erase_dir<'a>(
    dir: &'a Path,
    passes: u32,
    report: &'a mut EraseReport,
) -> Pin<Box<dyn Future<Output = Result<(), EraseError>> + Send + 'a>> {
    Box::pin(async move {
        let read_err = |e: std::io::Error| EraseError::ReadDir {
            path: dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = fs::read_dir(dir).await.map_err(read_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)
                .await
                .map_err(|e| EraseError::Metadata {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            if meta.is_dir() {
                erase_dir(&path, passes, report).await?;
            } else if meta.file_type().is_symlink() {
                remove_file(&path).await?;
                report.erased += 1;
            } else {
                erase_file(&path, meta.len(), passes, report).await?;
            }
        }

        match fs::remove_dir(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EraseError::Remove {
                path: dir.display().to_string(),
                reason: e.to_string(),
            }),
        }
    })
}

async fn erase_file(
    path: &Path,
    size: u64,
    passes: u32,
    report: &mut EraseReport,
) -> Result<(), EraseError> {
    match overwrite(path, size, passes).await {
        Ok(()) => {
            remove_file(path).await?;
            debug!(path = %path.display(), passes, "file securely erased");
            report.erased += 1;
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "overwrite failed, falling back to plain delete"
            );
            remove_file(path).await?;
            report.degraded.push(DegradedErase {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

/// Run every overwrite pass over `path` without unlinking it.
pub(crate) async fn overwrite(path: &Path, size: u64, passes: u32) -> std::io::Result<()> {
    let window = size.min(MAX_WINDOW);
    if window == 0 {
        return Ok(());
    }
    let window_len = usize::try_from(window).map_err(std::io::Error::other)?;
    let tail_offset = (size > window).then(|| size - window);

    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    let mut pattern = vec![0u8; window_len];

    for pass in 0..passes {
        fill_pattern(&mut pattern, pass, passes);

        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&pattern).await?;

        if let Some(offset) = tail_offset {
            let tail = async {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&pattern).await
            };
            if let Err(e) = tail.await {
                debug!(path = %path.display(), pass, error = %e, "tail overwrite skipped");
            }
        }

        file.flush().await?;
        file.sync_data().await?;
        debug!(path = %path.display(), pass, "overwrite pass complete");
    }
    Ok(())
}

/// Fill `buf` with the pattern for `pass` out of `passes`.
fn fill_pattern(buf: &mut [u8], pass: u32, passes: u32) {
    if pass + 1 >= passes {
        buf.fill(0x00);
    } else if pass == 0 {
        crypto::fill_random(buf);
    } else if pass % 2 == 1 {
        buf.fill(0x55);
    } else {
        buf.fill(0xAA);
    }
}

async fn remove_file(path: &Path) -> Result<(), EraseError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EraseError::Remove {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}
