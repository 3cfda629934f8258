//! # origin-control - Bulk origin restrictions for package registries
//!
//! Applies upstream/publish origin restrictions to many packages of a
//! registry repository in one resumable, crash-safe batch.
//!
//! ## Overview
//!
//! A run starts from a CSV plan with one row per package:
//!
//! ```text
//! domain,repository,format,namespace,package,upstream,publish
//! corp,internal,npm,,left-pad,BLOCK,ALLOW
//! corp,internal,maven,org.acme,core,ALLOW,ALLOW
//! ```
//!
//! The plan is validated, split into one task file per package inside a
//! workspace, and the tasks are processed by a pool of workers. Before a
//! package is changed its current restrictions are written to a backup file,
//! which can later be fed back in to undo the run.
//!
//! ## Architecture
//!
//! - **Workspace**: task state is directory membership (`todo`, `error`,
//!   `done`). Transitions are single renames, so an interrupted run can
//!   always be resumed by running again on the same input.
//! - **Content identity**: a workspace and its backup are keyed by the
//!   SHA-256 of the input bytes.
//! - **Dispatcher**: a bounded rayon pool processes each task exactly once.
//!   Registry failures are recorded against their task; workspace and backup
//!   failures abort the run.
//! - **Backup recorder**: a single writer thread fed by a bounded channel
//!   appends and flushes one row per package.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use origin_control::{ApplyOutcome, ApplyRunBuilder, FileRegistry};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(FileRegistry::open(Path::new("registry.json"))?);
//!
//! let run = ApplyRunBuilder::new("corp", "internal", "origin_configuration_corp_internal.csv")
//!     .client(registry)
//!     .build()?;
//!
//! match run.execute()? {
//!     ApplyOutcome::Completed(summary) => println!("{}", summary.report.summary()),
//!     other => println!("{:?}", other),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Working with a Workspace Directly
//!
//! ```rust,no_run
//! use origin_control::Workspace;
//! use std::path::Path;
//!
//! # fn main() -> origin_control::Result<()> {
//! let workspace = Workspace::initialize(Path::new("plan.csv"), Path::new("workspaces"))?;
//! for task in workspace.failed_tasks()? {
//!     println!("{} failed: {:?}", task.id(), task.read()?);
//!     task.mark_retry()?;
//! }
//! println!("{:?}", workspace.status()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, OriginError>`. See
//! [`OriginError::is_fatal`] for which errors abort a run.
//!
//! ## Module Organization
//!
//! - [`workspace`]: durable three-state task store
//! - [`dispatch`]: concurrent task processing and run reports
//! - [`backup`]: asynchronous single-writer backups
//! - [`registry`]: registry client trait, offline registry, call timeouts
//! - [`plan`]: plan generation and upstream graph traversal
//! - [`apply`]: orchestration of a complete run
//! - [`input`]: input validation
//! - [`identity`]: content identity of inputs
//! - [`config`]: toolkit configuration
//! - [`types`]: records, keys and restrictions
//! - [`error`]: error types and handling

// Public API modules
pub mod apply;
pub mod backup;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod input;
pub mod plan;
pub mod registry;
pub mod types;
pub mod workspace;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use apply::{ApplyMode, ApplyOptions, ApplyOutcome, ApplyRun, ApplyRunBuilder, ApplySummary};
pub use backup::{backup_path_for, BackupRecorder};
pub use config::ToolkitConfig;
pub use dispatch::{
    Confirmer, DispatchHook, DispatchOptions, Dispatcher, PromptConfirmation, RunReport, TaskOutcome,
};
pub use error::{OriginError, Result};
pub use identity::ContentIdentity;
pub use registry::{FileRegistry, PackageFilter, RegistryClient, TimeoutClient};
pub use types::*;
pub use workspace::{DuplicatePolicy, TaskHandle, TaskIter, TaskState, Workspace, WorkspaceStatus};
