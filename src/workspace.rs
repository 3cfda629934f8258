//! Directory-backed task workspace
//!
//! A workspace holds one file per task and encodes the task's state purely
//! through directory membership. Transitions are single `rename` calls, which
//! makes every state change crash-consistent on filesystems with atomic
//! rename.
//!
//! ## Layout
//!
//! ```text
//! <workspaces_home>/<content_hash>/
//! ├── metadata.json                      # Written once the workspace is populated
//! ├── todo/<domain>-<repository>-<format>-<namespace>-<package>
//! ├── error/<same filename>
//! └── done/<same filename>
//! ```
//!
//! Each task file holds a single CSV row (no header) with the seven fields of
//! a [`PackageRecord`].
//!
//! ## Resumption
//!
//! The workspace directory is keyed by the content hash of the input, so
//! running again against an unmodified file reopens the same workspace.
//! [`Workspace::populate`] only splits the input into task files when all
//! three collections are empty; pending or failed tasks from a previous run
//! are never overwritten.
//!
//! ## Thread Safety
//!
//! `Workspace` is `Sync`. [`Workspace::mark_done`], [`Workspace::mark_error`]
//! and [`Workspace::mark_retry`] may be called concurrently for different task
//! ids. Each id must be driven by one caller at a time, which [`TaskIter`]
//! guarantees by handing out every listed name exactly once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use origin_control::workspace::Workspace;
//! use std::path::Path;
//!
//! # fn main() -> origin_control::Result<()> {
//! let workspace = Workspace::initialize(Path::new("input.csv"), Path::new("workspaces"))?;
//! for task in workspace.tasks()? {
//!     let record = task.read()?;
//!     println!("{} -> {}/{}", task.id(), record.upstream, record.publish);
//!     task.mark_done()?;
//! }
//! assert!(workspace.is_clean()?);
//! # Ok(())
//! # }
//! ```

use crate::error::{OriginError, Result};
use crate::identity::ContentIdentity;
use crate::input;
use crate::types::PackageRecord;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Directory holding pending tasks
pub const TODO_DIR: &str = "todo";
/// Directory holding failed tasks
pub const ERROR_DIR: &str = "error";
/// Directory holding completed tasks
pub const DONE_DIR: &str = "done";
/// Workspace metadata file
pub const METADATA_FILE: &str = "metadata.json";
/// Scratch directory used while splitting the input
const STAGING_DIR: &str = ".staging";

/// What to do when two input records map to the same task file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Abort population with [`OriginError::DuplicateTask`]
    #[default]
    Reject,
    /// Keep the record that appears last in the input
    LastWriteWins,
    /// Keep the record that appears first in the input
    ///
    /// Used for backups, where the first row of a package holds the state it
    /// had before any run touched it.
    FirstWriteWins,
}

/// State of a task, i.e. the collection currently holding its file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Pending
    Todo,
    /// Failed at least once and not yet succeeded
    Error,
    /// Completed
    Done,
}

/// Number of tasks in each collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    /// Pending tasks
    pub todo: usize,
    /// Failed tasks
    pub error: usize,
    /// Completed tasks
    pub done: usize,
}

impl WorkspaceStatus {
    /// A previous run fully succeeded: work was done and nothing is left
    pub fn is_clean(&self) -> bool {
        self.done > 0 && self.todo == 0 && self.error == 0
    }

    /// Total number of tasks across all collections
    pub fn total(&self) -> usize {
        self.todo + self.error + self.done
    }
}

/// Result of [`Workspace::populate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// Previous run fully succeeded, nothing was written
    AlreadyClean,
    /// Failed tasks are present and were preserved
    ErrorsPresent,
    /// Pending tasks are present and were preserved
    PendingPresent,
    /// Input was split into this many task files
    Populated(usize),
}

/// Metadata recorded when a workspace is populated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    /// Layout version
    pub format_version: u32,
    /// Version of the tool that populated the workspace
    pub tool_version: String,
    /// Content hash of the input
    pub content_hash: ContentIdentity,
    /// Input file the workspace was populated from
    pub input_path: PathBuf,
    /// Number of task files created
    pub task_count: usize,
    /// Population timestamp
    pub created_at: DateTime<Utc>,
}

/// Durable three-state task store
#[derive(Debug)]
pub struct Workspace {
    /// `<workspaces_home>/<content_hash>`
    root: PathBuf,
    /// Input the workspace belongs to
    input_path: PathBuf,
    /// Content hash of the input
    identity: ContentIdentity,
    todo_dir: PathBuf,
    error_dir: PathBuf,
    done_dir: PathBuf,
    duplicate_policy: DuplicatePolicy,
}

impl Workspace {
    /// Open or create the workspace for an input file and populate it
    ///
    /// Uses [`DuplicatePolicy::Reject`].
    pub fn initialize(input_path: &Path, workspaces_home: &Path) -> Result<Self> {
        Self::initialize_with(input_path, workspaces_home, DuplicatePolicy::default())
    }

    /// Open or create the workspace for an input file with an explicit
    /// duplicate policy
    ///
    /// Reads the input once and hands the bytes to
    /// [`Workspace::initialize_from_data`].
    pub fn initialize_with(
        input_path: &Path,
        workspaces_home: &Path,
        duplicate_policy: DuplicatePolicy,
    ) -> Result<Self> {
        let data = fs::read(input_path)?;
        Self::initialize_from_data(input_path, &data, workspaces_home, duplicate_policy)
    }

    /// Open or create the workspace for input bytes already read from
    /// `input_path`
    ///
    /// The content identity and the task files both come from `data`, so
    /// the workspace cannot mix two versions of the file. Creates the three
    /// state directories (tolerating existing ones) and populates them.
    ///
    /// # Errors
    ///
    /// - [`OriginError::WorkspaceState`] if directories cannot be created
    /// - [`OriginError::DuplicateTask`] under [`DuplicatePolicy::Reject`]
    /// - [`OriginError::Validation`] if the data is not a valid input
    #[instrument(skip(data, workspaces_home), fields(bytes = data.len()))]
    pub fn initialize_from_data(
        input_path: &Path,
        data: &[u8],
        workspaces_home: &Path,
        duplicate_policy: DuplicatePolicy,
    ) -> Result<Self> {
        info!("Initializing workspace from {:?}", input_path);

        let identity = ContentIdentity::from_bytes(data);
        let workspace = Self::at(input_path, workspaces_home, identity, duplicate_policy);
        workspace.create_layout(workspaces_home)?;
        workspace.populate_from(data)?;

        info!("Workspace initialized at {:?}", workspace.root);
        Ok(workspace)
    }

    /// Open the workspace for an input without creating or populating it
    ///
    /// Fails with [`OriginError::WorkspaceState`] if the workspace does not
    /// exist.
    pub fn open(input_path: &Path, workspaces_home: &Path) -> Result<Self> {
        let identity = ContentIdentity::from_file(input_path)?;
        Self::open_as(input_path, identity, workspaces_home)
    }

    /// Same as [`Workspace::open`] with an identity computed by the caller
    pub fn open_as(input_path: &Path, identity: ContentIdentity, workspaces_home: &Path) -> Result<Self> {
        let workspace = Self::at(input_path, workspaces_home, identity, DuplicatePolicy::default());
        for dir in [&workspace.todo_dir, &workspace.error_dir, &workspace.done_dir] {
            if !dir.is_dir() {
                return Err(OriginError::workspace(format!(
                    "no workspace for {:?} at {:?}",
                    input_path, workspace.root
                )));
            }
        }
        Ok(workspace)
    }

    fn at(
        input_path: &Path,
        workspaces_home: &Path,
        identity: ContentIdentity,
        duplicate_policy: DuplicatePolicy,
    ) -> Self {
        let root = workspaces_home.join(&identity);
        Self {
            todo_dir: root.join(TODO_DIR),
            error_dir: root.join(ERROR_DIR),
            done_dir: root.join(DONE_DIR),
            root,
            input_path: input_path.to_path_buf(),
            identity,
            duplicate_policy,
        }
    }

    fn create_layout(&self, workspaces_home: &Path) -> Result<()> {
        fs::create_dir_all(workspaces_home).map_err(|e| {
            OriginError::workspace(format!("cannot create {:?}: {}", workspaces_home, e))
        })?;
        utils::ensure_dir(&self.root)?;
        utils::ensure_dir(&self.todo_dir)?;
        utils::ensure_dir(&self.error_dir)?;
        utils::ensure_dir(&self.done_dir)?;
        Ok(())
    }

    /// Split the input into task files unless earlier state must be kept
    ///
    /// Rules, in order:
    /// 1. `done` non-empty and `todo`/`error` empty: clean, nothing to do.
    /// 2. `error` non-empty: failures are preserved for inspection or retry.
    /// 3. `todo` non-empty: a previous run is still in progress.
    /// 4. Otherwise one file per task is created under `todo`.
    ///
    /// Files are written to a staging directory first and swapped in with a
    /// single rename, so an interrupted population leaves `todo` empty and
    /// the next call starts over.
    ///
    /// Fails with [`OriginError::WorkspaceState`] if the input file no longer
    /// matches the content identity of the workspace.
    pub fn populate(&self) -> Result<PopulateOutcome> {
        let data = fs::read(&self.input_path)?;
        if ContentIdentity::from_bytes(&data) != self.identity {
            return Err(OriginError::workspace(format!(
                "{:?} changed since workspace {} was created",
                self.input_path, self.identity
            )));
        }
        self.populate_from(&data)
    }

    fn populate_from(&self, data: &[u8]) -> Result<PopulateOutcome> {
        let status = self.status()?;
        if status.is_clean() {
            info!("All items already processed correctly and no error found.");
            return Ok(PopulateOutcome::AlreadyClean);
        }
        if status.error > 0 {
            info!("Error items are present, skipping file parsing.");
            return Ok(PopulateOutcome::ErrorsPresent);
        }
        if status.todo > 0 {
            info!("To do items are present, skipping file parsing.");
            return Ok(PopulateOutcome::PendingPresent);
        }

        let tasks = self.collect_tasks(data)?;

        let staging = self.root.join(STAGING_DIR);
        if staging.exists() {
            debug!("Removing leftover staging directory {:?}", staging);
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;
        for (id, record) in &tasks {
            write_task_file(&staging.join(id), record)?;
        }

        fs::remove_dir(&self.todo_dir).map_err(|e| {
            OriginError::workspace(format!("cannot replace {:?}: {}", self.todo_dir, e))
        })?;
        fs::rename(&staging, &self.todo_dir).map_err(|e| {
            OriginError::workspace(format!("cannot move staged tasks into {:?}: {}", self.todo_dir, e))
        })?;

        let metadata = WorkspaceMetadata {
            format_version: 1,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            content_hash: self.identity.clone(),
            input_path: self.input_path.clone(),
            task_count: tasks.len(),
            created_at: Utc::now(),
        };
        let metadata_json = serde_json::to_string_pretty(&metadata)?;
        utils::atomic_write(&self.root.join(METADATA_FILE), metadata_json.as_bytes())?;

        info!("Created {} task files in {:?}", tasks.len(), self.todo_dir);
        Ok(PopulateOutcome::Populated(tasks.len()))
    }

    /// Parse the input and key every record by its task id
    fn collect_tasks(&self, data: &[u8]) -> Result<BTreeMap<String, PackageRecord>> {
        let mut tasks = BTreeMap::new();
        for line in input::parse_data(data)? {
            let id = line.record.key().task_id();
            if tasks.contains_key(&id) {
                match self.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        return Err(OriginError::DuplicateTask { line: line.line, id });
                    }
                    DuplicatePolicy::LastWriteWins => {
                        warn!("Line {} overrides earlier record for {}", line.line, id);
                    }
                    DuplicatePolicy::FirstWriteWins => {
                        debug!("Line {} repeats {}, keeping the first record", line.line, id);
                        continue;
                    }
                }
            }
            tasks.insert(id, line.record);
        }
        Ok(tasks)
    }

    /// Snapshot of pending tasks
    pub fn tasks(&self) -> Result<TaskIter<'_>> {
        self.iter_dir(&self.todo_dir)
    }

    /// Snapshot of failed tasks
    pub fn failed_tasks(&self) -> Result<TaskIter<'_>> {
        self.iter_dir(&self.error_dir)
    }

    fn iter_dir(&self, dir: &Path) -> Result<TaskIter<'_>> {
        let names = utils::list_file_names(dir)?;
        Ok(TaskIter {
            names: names.into_iter(),
            workspace: self,
        })
    }

    /// Read a task's record, looking in `todo` first and then in `error`
    pub fn read_task(&self, id: &str) -> Result<PackageRecord> {
        for dir in [&self.todo_dir, &self.error_dir] {
            match read_task_file(&dir.join(id)) {
                Ok(record) => return Ok(record),
                Err(OriginError::Io(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Err(OriginError::TaskNotFound(id.to_string()))
    }

    /// Move a task from `todo` or `error` into `done`
    pub fn mark_done(&self, id: &str) -> Result<()> {
        if utils::move_file_if_present(id, &self.todo_dir, &self.done_dir)? {
            return Ok(());
        }
        if utils::move_file_if_present(id, &self.error_dir, &self.done_dir)? {
            return Ok(());
        }
        Err(OriginError::TaskNotFound(id.to_string()))
    }

    /// Move a task from `todo` into `error`
    ///
    /// The first recorded failure wins: if `error` already holds the id, its
    /// file is left untouched and any pending copy is discarded.
    pub fn mark_error(&self, id: &str) -> Result<()> {
        let existing = self.error_dir.join(id);
        if existing.exists() {
            let pending = self.todo_dir.join(id);
            if pending.exists() {
                warn!("Task {} already failed before, dropping pending copy", id);
                fs::remove_file(&pending).map_err(|e| {
                    OriginError::workspace(format!("cannot remove {:?}: {}", pending, e))
                })?;
            }
            return Ok(());
        }
        if utils::move_file_if_present(id, &self.todo_dir, &self.error_dir)? {
            return Ok(());
        }
        Err(OriginError::TaskNotFound(id.to_string()))
    }

    /// Move a failed task back into `todo`
    pub fn mark_retry(&self, id: &str) -> Result<()> {
        if utils::move_file_if_present(id, &self.error_dir, &self.todo_dir)? {
            return Ok(());
        }
        Err(OriginError::TaskNotFound(id.to_string()))
    }

    /// Move every failed task back into `todo`, returning how many moved
    pub fn retry_all_failed(&self) -> Result<usize> {
        let mut moved = 0;
        for task in self.failed_tasks()? {
            task.mark_retry()?;
            moved += 1;
        }
        info!("Moved {} failed tasks back to {}", moved, TODO_DIR);
        Ok(moved)
    }

    /// Collection currently holding a task, if any
    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        if self.todo_dir.join(id).is_file() {
            Some(TaskState::Todo)
        } else if self.error_dir.join(id).is_file() {
            Some(TaskState::Error)
        } else if self.done_dir.join(id).is_file() {
            Some(TaskState::Done)
        } else {
            None
        }
    }

    /// Count tasks in every collection
    pub fn status(&self) -> Result<WorkspaceStatus> {
        Ok(WorkspaceStatus {
            todo: utils::list_file_names(&self.todo_dir)?.len(),
            error: utils::list_file_names(&self.error_dir)?.len(),
            done: utils::list_file_names(&self.done_dir)?.len(),
        })
    }

    /// True iff `done` is non-empty and `todo`/`error` are both empty
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status()?.is_clean())
    }

    /// Delete the whole workspace tree
    ///
    /// Without `force` the workspace is only deleted when clean. Returns
    /// whether anything was deleted.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub fn destroy(&self, force: bool) -> Result<bool> {
        if !force && !self.is_clean()? {
            info!("Workspace has pending or failed tasks, keeping it");
            return Ok(false);
        }
        fs::remove_dir_all(&self.root).map_err(|e| {
            OriginError::workspace(format!("cannot delete {:?}: {}", self.root, e))
        })?;
        info!("Deleted workspace {:?}", self.root);
        Ok(true)
    }

    /// Metadata written at population time, if present
    pub fn metadata(&self) -> Result<Option<WorkspaceMetadata>> {
        let path = self.root.join(METADATA_FILE);
        match fs::read_to_string(&path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Workspace root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content hash of the input
    pub fn identity(&self) -> &ContentIdentity {
        &self.identity
    }

    /// Input file the workspace belongs to
    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Directory of a given collection
    pub fn state_dir(&self, state: TaskState) -> &Path {
        match state {
            TaskState::Todo => &self.todo_dir,
            TaskState::Error => &self.error_dir,
            TaskState::Done => &self.done_dir,
        }
    }
}

/// Handle to one task of a workspace
///
/// Carries the task id together with access to its record and its state
/// transitions.
#[derive(Debug, Clone)]
pub struct TaskHandle<'a> {
    id: String,
    workspace: &'a Workspace,
}

impl<'a> TaskHandle<'a> {
    /// Task id (the task filename)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the task's record
    pub fn read(&self) -> Result<PackageRecord> {
        self.workspace.read_task(&self.id)
    }

    /// Transition to `done`
    pub fn mark_done(&self) -> Result<()> {
        self.workspace.mark_done(&self.id)
    }

    /// Transition to `error`
    pub fn mark_error(&self) -> Result<()> {
        self.workspace.mark_error(&self.id)
    }

    /// Transition from `error` back to `todo`
    pub fn mark_retry(&self) -> Result<()> {
        self.workspace.mark_retry(&self.id)
    }
}

/// Point-in-time listing of one collection
///
/// Files created or removed after the listing are not observed. Call
/// [`Workspace::tasks`] or [`Workspace::failed_tasks`] again to restart.
#[derive(Debug)]
pub struct TaskIter<'a> {
    names: std::vec::IntoIter<String>,
    workspace: &'a Workspace,
}

impl<'a> Iterator for TaskIter<'a> {
    type Item = TaskHandle<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.names.next().map(|id| TaskHandle {
            id,
            workspace: self.workspace,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.names.size_hint()
    }
}

impl ExactSizeIterator for TaskIter<'_> {}

fn write_task_file(path: &Path, record: &PackageRecord) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(record.to_fields())?;
    writer.flush()?;
    Ok(())
}

fn read_task_file(path: &Path) -> Result<PackageRecord> {
    let file = fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(file);
    match reader.deserialize::<PackageRecord>().next() {
        Some(record) => Ok(record?),
        None => Err(OriginError::workspace(format!("task file {:?} is empty", path))),
    }
}
