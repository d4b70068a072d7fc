//! Filesystem containment checks

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Resolve `candidate` (following symlinks) and require that it stays inside
/// `base`. `base` must already be canonical.
///
/// # Errors
///
/// Returns `Error::Config` when the path cannot be resolved or escapes `base`.
pub fn contained_in(base: &Path, candidate: &Path) -> Result<PathBuf> {
    let resolved = candidate
        .canonicalize()
        .map_err(|e| Error::Config(format!("Cannot resolve {}: {e}", candidate.display())))?;

    if resolved.starts_with(base) {
        Ok(resolved)
    } else {
        Err(Error::Config(format!(
            "{} escapes {}",
            candidate.display(),
            base.display()
        )))
    }
}

/// Canonicalize a directory that must exist
///
/// # Errors
///
/// Returns `Error::Config` if the path is missing or not a directory.
pub fn canonical_dir(dir: &Path) -> Result<PathBuf> {
    let resolved = dir
        .canonicalize()
        .map_err(|e| Error::Config(format!("Cannot resolve {}: {e}", dir.display())))?;
    if !resolved.is_dir() {
        return Err(Error::Config(format!("{} is not a directory", dir.display())));
    }
    Ok(resolved)
}
