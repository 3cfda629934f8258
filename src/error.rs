//! Error types for origin-control
//!
//! This module defines every error that can surface while validating input,
//! driving a workspace, recording backups, or talking to a registry.
//!
//! Errors fall into two groups. Task-level failures (a registry call failed,
//! timed out, or targeted the wrong domain) are caught at the dispatcher
//! boundary and recorded against a single task. Everything else indicates
//! that the durability guarantees of the run can no longer be trusted and is
//! propagated to the caller.

use std::time::Duration;
use thiserror::Error;

/// Type alias for Results in the origin-control library
pub type Result<T> = std::result::Result<T, OriginError>;

/// Main error type for all origin-control operations
#[derive(Debug, Error)]
pub enum OriginError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors while reading or writing CSV records
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or mismatched input record
    #[error("[{line}] {message}")]
    Validation {
        /// 1-based line number in the input file
        line: u64,
        /// What was wrong with the line
        message: String,
    },

    /// Two input records map to the same task file
    #[error("[{line}] duplicate task {id}")]
    DuplicateTask {
        /// Line of the second occurrence
        line: u64,
        /// Task id (derived filename)
        id: String,
    },

    /// Task targets a different domain than the registry client
    #[error("Domain mismatch! You supplied {actual} but we expected {expected}.")]
    DomainMismatch {
        /// Domain the client is configured for
        expected: String,
        /// Domain found on the task
        actual: String,
    },

    /// Remote registry failure (network, throttling, authorization)
    #[error("Registry error: {0}")]
    Registry(String),

    /// A registry call did not complete in time
    #[error("Registry call timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// Workspace directories could not be created, read or moved
    #[error("Workspace error: {0}")]
    WorkspaceState(String),

    /// Task id not present in any workspace collection
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Backup writer failure
    #[error("Backup error: {0}")]
    Backup(String),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid origin restriction string or flag value
    #[error("Invalid restriction: {0}")]
    InvalidRestriction(String),

    /// Operator declined to continue
    #[error("User elected not to continue.")]
    UserAborted,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OriginError {
    /// Create a registry error with a custom message
    pub fn registry(msg: impl Into<String>) -> Self {
        OriginError::Registry(msg.into())
    }

    /// Create a workspace error with a custom message
    pub fn workspace(msg: impl Into<String>) -> Self {
        OriginError::WorkspaceState(msg.into())
    }

    /// Create a backup error with a custom message
    pub fn backup(msg: impl Into<String>) -> Self {
        OriginError::Backup(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        OriginError::Internal(msg.into())
    }

    /// Create a validation error for a given input line
    pub fn validation(line: u64, msg: impl Into<String>) -> Self {
        OriginError::Validation {
            line,
            message: msg.into(),
        }
    }

    /// Check if this error must abort the whole run
    ///
    /// Anything else raised while processing a task is recorded against that
    /// task and the run carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OriginError::WorkspaceState(_)
                | OriginError::Backup(_)
                | OriginError::ThreadPool(_)
                | OriginError::Internal(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            OriginError::Validation { line, message } => {
                format!("Input is invalid at line {}: {}. Fix the file and run again.", line, message)
            }
            OriginError::DuplicateTask { line, id } => {
                format!(
                    "Line {} repeats task '{}'. Remove the duplicate or use --on-duplicate last-wins.",
                    line, id
                )
            }
            _ => self.to_string(),
        }
    }
}
