//! Toolkit configuration
//!
//! Every setting a run depends on lives in an explicit [`ToolkitConfig`]
//! value that is passed to [`crate::apply::ApplyRun`]. A configuration can be
//! loaded from a JSON file; missing fields take their defaults and command
//! line flags override whatever was loaded.

use crate::backup::DEFAULT_QUEUE_CAPACITY;
use crate::dispatch::DEFAULT_WORKERS;
use crate::error::{OriginError, Result};
use crate::workspace::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Settings shared by every run of the toolkit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Directory holding one workspace per input
    pub workspaces_home: PathBuf,
    /// Directory holding one backup file per input
    pub backups_home: PathBuf,
    /// Number of dispatcher workers
    pub workers: usize,
    /// Per-call registry timeout in milliseconds, unbounded when absent
    pub call_timeout_ms: Option<u64>,
    /// Handling of input records that map to the same task
    pub duplicate_policy: DuplicatePolicy,
    /// Records that may wait for the backup writer
    pub backup_queue_capacity: usize,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            workspaces_home: PathBuf::from("workspaces"),
            backups_home: PathBuf::from("backups"),
            workers: DEFAULT_WORKERS,
            call_timeout_ms: None,
            duplicate_policy: DuplicatePolicy::Reject,
            backup_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ToolkitConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            OriginError::InvalidConfiguration(format!("cannot read {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Reject values no run can work with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(OriginError::InvalidConfiguration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.backup_queue_capacity == 0 {
            return Err(OriginError::InvalidConfiguration(
                "backup_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(OriginError::InvalidConfiguration(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Registry call timeout, if any
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}
