//! `.partial` files left behind by interrupted resumable transfers.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};

pub const PARTIAL_SUFFIX: &str = ".partial";

/// `<output>.partial`, next to the final file.
pub fn partial_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

/// Where to resume writing `partial`.
///
/// A partial that is larger than the announced size belongs to a different
/// version of the file, so it is deleted and the transfer restarts at zero.
pub async fn resume_offset(partial: &Path, declared_size: u64) -> Result<u64> {
    let existing = match tokio::fs::metadata(partial).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TransferError::fs(partial, e)),
    };

    if existing > declared_size {
        warn!(
            "Partial {} has {} bytes but only {} announced, restarting",
            partial.display(),
            existing,
            declared_size
        );
        tokio::fs::remove_file(partial)
            .await
            .map_err(|e| TransferError::fs(partial, e))?;
        return Ok(0);
    }

    Ok(existing)
}

/// Delete `.partial` files under `dir` not modified for at least `max_age`.
///
/// Returns how many files were removed. Files that cannot be inspected or
/// removed are logged and skipped.
pub fn cleanup_stale_partials(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_partial(path) {
            continue;
        }

        let age = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(modified) => now.duration_since(modified).unwrap_or_default(),
            None => {
                debug!("Cannot read mtime of {}", path.display());
                continue;
            }
        };

        if age < max_age {
            continue;
        }

        match std::fs::remove_file(path) {
            Ok(()) => {
                info!("Removed stale partial {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}
