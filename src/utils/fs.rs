//! Filesystem helpers used by grains

use crate::error::{Result, SandboxError};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Copy the tree under `source` into `target`, creating `target` if needed.
/// Existing files are overwritten. Returns the number of files copied.
pub fn copy_dir_all(source: &Path, target: &Path) -> Result<usize> {
    std::fs::create_dir_all(target)?;

    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| SandboxError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| SandboxError::Other(e.to_string()))?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            debug!("Copying {}", destination.display());
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }

    Ok(copied)
}
