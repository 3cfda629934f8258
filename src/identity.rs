//! Content identity of input data sets
//!
//! A workspace and its backup are namespaced by the SHA-256 digest of the raw
//! bytes of the input file. Running again against a byte-identical file
//! therefore lands in the same workspace, while any edit to the input starts
//! a fresh one.

use crate::error::Result;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Deterministic fingerprint of an input data set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentIdentity(String);

impl ContentIdentity {
    /// Fingerprint of in-memory bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(utils::hash_data(data))
    }

    /// Fingerprint of a file's raw content
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self(utils::hash_file_content(path)?))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated digest for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for ContentIdentity {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}
