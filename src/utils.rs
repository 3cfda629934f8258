//! Utility functions for origin-control
//!
//! Small filesystem helpers shared by the workspace, the backup recorder and
//! the offline registry: hashing, atomic writes, directory listings and
//! rename-based moves.
//!
//! ## Thread Safety
//!
//! All helpers are stateless and can be called concurrently. Moves rely on
//! `rename(2)` being atomic within a single filesystem.

use crate::error::{OriginError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::trace;

/// Hash a file's content using SHA-256
///
/// Reads the file in 8KB chunks and returns the digest as a 64-character
/// hexadecimal string.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Write a file atomically
///
/// Content goes to a sibling `.tmp` file which is then renamed over the
/// target, so readers observe either the old file or the complete new one.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        fs::remove_file(&temp_path).ok();
        return Err(e.into());
    }

    Ok(())
}

/// Create a directory, tolerating one that already exists
pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(OriginError::workspace(format!(
            "cannot create directory {:?}: {}",
            path, e
        ))),
    }
}

/// List the names of regular files in a directory
///
/// The result is a point-in-time snapshot sorted by name. Entries that are
/// not valid UTF-8 or are not files are skipped.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        OriginError::workspace(format!("cannot list directory {:?}: {}", dir, e))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => trace!("Skipping non UTF-8 entry {:?}", raw),
        }
    }
    names.sort();
    Ok(names)
}

/// Move `name` between directories, reporting whether the source existed
///
/// A missing source yields `Ok(false)` instead of an error so callers can
/// probe several locations without a separate existence check.
pub fn move_file_if_present(name: &str, from: &Path, to: &Path) -> Result<bool> {
    let source = from.join(name);
    let destination = to.join(name);
    match fs::rename(&source, &destination) {
        Ok(()) => {
            trace!("Moved {} from {:?} to {:?}", name, from, to);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound && !source.exists() => Ok(false),
        Err(e) => Err(OriginError::workspace(format!(
            "cannot move {:?} to {:?}: {}",
            source, destination, e
        ))),
    }
}
