//! Orchestration of one apply run
//!
//! An [`ApplyRun`] ties the pieces together for a single input file:
//!
//! 1. validate the input against the expected domain and repository
//! 2. open the workspace (built from the backup file in restore mode)
//! 3. handle the maintenance modes (delete workspace, list failures)
//! 4. start the backup recorder unless disabled or restoring
//! 5. dispatch pending tasks, or failed tasks in retry mode
//! 6. drain the backup and delete the workspace if it ended clean
//!
//! ## Example
//!
//! ```rust,no_run
//! use origin_control::apply::{ApplyOutcome, ApplyRunBuilder};
//! use origin_control::registry::FileRegistry;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> origin_control::Result<()> {
//! let registry = Arc::new(FileRegistry::open(Path::new("registry.json"))?);
//! let run = ApplyRunBuilder::new("corp", "internal", "plan.csv")
//!     .client(registry)
//!     .dry_run(true)
//!     .build()?;
//!
//! if let ApplyOutcome::Completed(summary) = run.execute()? {
//!     println!("{}", summary.report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::backup::{backup_path_for, BackupRecorder};
use crate::config::ToolkitConfig;
use crate::dispatch::{Confirmer, DispatchHook, DispatchOptions, Dispatcher, RunReport};
use crate::error::{OriginError, Result};
use crate::identity::ContentIdentity;
use crate::input::{self, InputExpectations};
use crate::registry::{RegistryClient, TimeoutClient};
use crate::types::PackageRecord;
use crate::workspace::{DuplicatePolicy, Workspace};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What an apply run should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Process pending tasks
    #[default]
    Apply,
    /// Process failed tasks
    RetryFailed,
    /// Report failed tasks without processing anything
    ListFailed,
    /// Force-delete the workspace of the input
    DeleteWorkspace,
    /// Stop after validating the input
    ValidateOnly,
}

/// Flags of an apply run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Mode of the run
    pub mode: ApplyMode,
    /// Do not mutate the registry
    pub dry_run: bool,
    /// Log every task outcome
    pub trace: bool,
    /// Confirm every task and backup overwrites
    pub ask_confirmation: bool,
    /// Skip recording current restrictions
    pub no_backup: bool,
    /// Use the backup of the input as the task source
    pub restore: bool,
    /// Keep the workspace even when it ends clean
    pub conserve_workspace: bool,
}

/// Result of a completed dispatch
#[derive(Debug, Clone)]
pub struct ApplySummary {
    /// Dispatcher report
    pub report: RunReport,
    /// Backup file and rows written by this run
    pub backup: Option<(PathBuf, u64)>,
    /// Workspace root
    pub workspace_root: PathBuf,
    /// Whether the workspace was deleted at the end
    pub workspace_deleted: bool,
}

/// Outcome of [`ApplyRun::execute`]
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Input is valid and holds this many records
    Validated(usize),
    /// Whether a workspace existed and was deleted
    WorkspaceDeleted(bool),
    /// Failed tasks and their records
    FailedTasks(Vec<(String, PackageRecord)>),
    /// Tasks were dispatched
    Completed(ApplySummary),
}

/// Records a run takes its tasks from
struct TaskSource {
    path: PathBuf,
    data: Vec<u8>,
    duplicate_policy: DuplicatePolicy,
}

/// A configured apply run for one input file
pub struct ApplyRun {
    input: PathBuf,
    expectations: InputExpectations,
    config: ToolkitConfig,
    options: ApplyOptions,
    client: Option<Arc<dyn RegistryClient>>,
    confirmer: Option<Arc<dyn Confirmer>>,
    hook: Option<Arc<dyn DispatchHook>>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for ApplyRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyRun")
            .field("input", &self.input)
            .field("expectations", &self.expectations)
            .field("config", &self.config)
            .field("options", &self.options)
            .field("client", &self.client.as_ref().map(|c| c.domain().to_string()))
            .finish()
    }
}

impl ApplyRun {
    /// Run according to the configured mode
    #[instrument(skip(self), fields(input = ?self.input, mode = ?self.options.mode))]
    pub fn execute(&self) -> Result<ApplyOutcome> {
        let data = fs::read(&self.input)?;
        let lines = input::validate_data(&data, &self.expectations)?;
        if self.options.mode == ApplyMode::ValidateOnly {
            return Ok(ApplyOutcome::Validated(lines.len()));
        }

        let identity = ContentIdentity::from_bytes(&data);
        let source = self.task_source(&identity, data)?;
        let source_identity = ContentIdentity::from_bytes(&source.data);

        match self.options.mode {
            ApplyMode::DeleteWorkspace => {
                info!("Deleting workspace for {:?}", self.input);
                return match Workspace::open_as(&source.path, source_identity, &self.config.workspaces_home) {
                    Ok(workspace) => Ok(ApplyOutcome::WorkspaceDeleted(workspace.destroy(true)?)),
                    Err(OriginError::WorkspaceState(_)) => Ok(ApplyOutcome::WorkspaceDeleted(false)),
                    Err(e) => Err(e),
                };
            }
            ApplyMode::ListFailed => {
                return match Workspace::open_as(&source.path, source_identity, &self.config.workspaces_home) {
                    Ok(workspace) => {
                        let mut failed = Vec::new();
                        for task in workspace.failed_tasks()? {
                            failed.push((task.id().to_string(), task.read()?));
                        }
                        Ok(ApplyOutcome::FailedTasks(failed))
                    }
                    Err(OriginError::WorkspaceState(_)) => Ok(ApplyOutcome::FailedTasks(Vec::new())),
                    Err(e) => Err(e),
                };
            }
            _ => {}
        }

        let client = self.client.as_ref().ok_or_else(|| {
            OriginError::InvalidConfiguration("a registry client is required to apply restrictions".to_string())
        })?;
        if client.domain() != self.expectations.domain {
            return Err(OriginError::DomainMismatch {
                expected: client.domain().to_string(),
                actual: self.expectations.domain.clone(),
            });
        }
        let confirmer = if self.options.ask_confirmation {
            Some(self.confirmer.as_ref().ok_or_else(|| {
                OriginError::InvalidConfiguration("confirmation requested without a confirmer".to_string())
            })?)
        } else {
            None
        };

        let workspace = Workspace::initialize_from_data(
            &source.path,
            &source.data,
            &self.config.workspaces_home,
            source.duplicate_policy,
        )?;
        let backup = self.start_backup(&identity, &workspace, confirmer.map(|c| c.as_ref()))?;

        let timed;
        let client: &dyn RegistryClient = match self.config.call_timeout() {
            Some(timeout) => {
                timed = TimeoutClient::new(Arc::clone(client), timeout);
                &timed
            }
            None => client.as_ref(),
        };

        let options = DispatchOptions {
            workers: self.config.workers,
            dry_run: self.options.dry_run,
            trace: self.options.trace,
        };
        let mut dispatcher =
            Dispatcher::new(client, options).with_cancellation(Arc::clone(&self.cancel));
        if let Some(backup) = &backup {
            dispatcher = dispatcher.with_backup(backup);
        }
        if let Some(confirmer) = confirmer {
            dispatcher = dispatcher.with_confirmer(confirmer.as_ref());
        }
        if let Some(hook) = &self.hook {
            dispatcher = dispatcher.with_hook(hook.as_ref());
        }

        let tasks = if self.options.mode == ApplyMode::RetryFailed {
            workspace.failed_tasks()?
        } else {
            workspace.tasks()?
        };
        let report = dispatcher.run(tasks)?;

        let backup = match backup {
            Some(recorder) => {
                let path = recorder.path().to_path_buf();
                Some((path, recorder.finish()?))
            }
            None => None,
        };

        let workspace_deleted = if self.options.conserve_workspace {
            false
        } else {
            workspace.destroy(false)?
        };
        if !workspace_deleted && !report.was_cancelled() {
            let status = workspace.status()?;
            if status.error > 0 {
                warn!(
                    "{} tasks failed, inspect them with list-failed and rerun with retry-failed",
                    status.error
                );
            }
        }

        Ok(ApplyOutcome::Completed(ApplySummary {
            report,
            backup,
            workspace_root: workspace.root().to_path_buf(),
            workspace_deleted,
        }))
    }

    /// Input file, or the backup belonging to it in restore mode
    ///
    /// A backup that was appended to by a resumed or retried run holds one
    /// row per attempt for the same package. Only the first row carries the
    /// state from before the first attempt, so restores keep that one.
    fn task_source(&self, identity: &ContentIdentity, input_data: Vec<u8>) -> Result<TaskSource> {
        if !self.options.restore {
            return Ok(TaskSource {
                path: self.input.clone(),
                data: input_data,
                duplicate_policy: self.config.duplicate_policy,
            });
        }
        let path = backup_path_for(&self.config.backups_home, identity);
        if !path.is_file() {
            return Err(OriginError::InvalidConfiguration(format!(
                "no backup found for {:?} at {:?}",
                self.input, path
            )));
        }
        let data = fs::read(&path)?;
        input::validate_data(&data, &self.expectations)?;
        info!("Restoring from backup {:?}", path);
        Ok(TaskSource {
            path,
            data,
            duplicate_policy: DuplicatePolicy::FirstWriteWins,
        })
    }

    fn start_backup(
        &self,
        identity: &ContentIdentity,
        workspace: &Workspace,
        confirmer: Option<&dyn Confirmer>,
    ) -> Result<Option<BackupRecorder>> {
        if self.options.no_backup || self.options.restore {
            return Ok(None);
        }
        let path = backup_path_for(&self.config.backups_home, identity);
        let capacity = self.config.backup_queue_capacity;

        let status = workspace.status()?;
        let resuming = status.done + status.error > 0;
        if path.exists() && resuming {
            info!("Resuming, appending to existing backup {:?}", path);
            return BackupRecorder::append(&path, capacity).map(Some);
        }

        if path.exists() {
            if let Some(confirmer) = confirmer {
                let question = format!("Backup file {} already exists. Overwrite?", path.display());
                if !confirmer.confirm(&question)? {
                    return Err(OriginError::UserAborted);
                }
            }
        }
        BackupRecorder::with_capacity(&path, capacity).map(Some)
    }

    /// Input file of the run
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Flag that stops new tasks from starting once set
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

/// Builder for [`ApplyRun`]
///
/// # Default Values
///
/// - `config`: [`ToolkitConfig::default`]
/// - `options`: [`ApplyOptions::default`] (apply mode, backups on)
pub struct ApplyRunBuilder {
    input: PathBuf,
    expectations: InputExpectations,
    config: ToolkitConfig,
    options: ApplyOptions,
    client: Option<Arc<dyn RegistryClient>>,
    confirmer: Option<Arc<dyn Confirmer>>,
    hook: Option<Arc<dyn DispatchHook>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ApplyRunBuilder {
    /// Start a run for `input`, expecting every record to target
    /// `domain`/`repository`
    pub fn new(domain: impl Into<String>, repository: impl Into<String>, input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            expectations: InputExpectations {
                domain: domain.into(),
                repository: repository.into(),
            },
            config: ToolkitConfig::default(),
            options: ApplyOptions::default(),
            client: None,
            confirmer: None,
            hook: None,
            cancel: None,
        }
    }

    /// Use a configuration
    pub fn config(mut self, config: ToolkitConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace all flags at once
    pub fn options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the mode
    pub fn mode(mut self, mode: ApplyMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Do not mutate the registry
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.options.dry_run = dry_run;
        self
    }

    /// Keep the workspace even when clean
    pub fn conserve_workspace(mut self, conserve: bool) -> Self {
        self.options.conserve_workspace = conserve;
        self
    }

    /// Skip backups
    pub fn no_backup(mut self, no_backup: bool) -> Self {
        self.options.no_backup = no_backup;
        self
    }

    /// Restore from the backup of the input
    pub fn restore(mut self, restore: bool) -> Self {
        self.options.restore = restore;
        self
    }

    /// Registry to run against
    pub fn client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Ask this confirmer before every task
    pub fn confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self.options.ask_confirmation = true;
        self
    }

    /// Report progress to a hook
    pub fn hook(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Share a cancellation flag, e.g. one set by a signal handler
    pub fn cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validate the configuration and build the run
    pub fn build(self) -> Result<ApplyRun> {
        self.config.validate()?;
        Ok(ApplyRun {
            input: self.input,
            expectations: self.expectations,
            config: self.config,
            options: self.options,
            client: self.client,
            confirmer: self.confirmer,
            hook: self.hook,
            cancel: self
                .cancel
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
        })
    }
}
