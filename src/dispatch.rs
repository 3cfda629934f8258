//! Concurrent task processing
//!
//! The [`Dispatcher`] drains a [`TaskIter`] snapshot on a dedicated pool of
//! worker threads. For every task it runs, in order:
//!
//! 1. read the task record
//! 2. ask for confirmation, if a [`Confirmer`] is configured
//! 3. record the current restrictions, if a [`BackupRecorder`] is configured
//! 4. apply the desired restrictions, unless running dry
//! 5. move the task to `done`, or to `error` when any step failed
//!
//! Tasks are not retried within a run. Registry failures stay local to their
//! task; workspace and backup failures abort the run because the outcome of
//! further tasks could no longer be recorded reliably.
//!
//! ## Cancellation
//!
//! The cancellation flag is checked before each task starts. Tasks already
//! running are completed and every task that was not started stays in its
//! current collection for the next run.

use crate::backup::BackupRecorder;
use crate::error::{OriginError, Result};
use crate::registry::RegistryClient;
use crate::types::PackageRecord;
use crate::workspace::{TaskHandle, TaskIter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default number of worker threads
pub const DEFAULT_WORKERS: usize = 4;

/// Settings of a dispatch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Number of worker threads
    pub workers: usize,
    /// Skip the mutating registry call
    pub dry_run: bool,
    /// Log the outcome of every task
    pub trace: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            dry_run: false,
            trace: false,
        }
    }
}

/// What happened to a single task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TaskOutcome {
    /// Restrictions applied (or skipped in dry-run), task moved to `done`
    Succeeded,
    /// A step failed, task moved to `error`
    Failed(String),
    /// Operator declined, task left where it was
    Declined,
    /// Not started because the run was cancelled
    Cancelled,
}

impl TaskOutcome {
    /// Whether the task ended in `done`
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// A task that ended in `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    /// Task id
    pub id: String,
    /// Error message
    pub reason: String,
}

/// Aggregated outcome of a dispatch run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id of the run
    pub run_id: Uuid,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration: Duration,
    /// Tasks that moved to `done`
    pub succeeded: usize,
    /// Tasks that moved to `error`
    pub failed: usize,
    /// Tasks declined by the operator
    pub declined: usize,
    /// Tasks not started because of cancellation
    pub cancelled: usize,
    /// Details of failed tasks, sorted by id
    pub failures: Vec<FailedTask>,
}

impl RunReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            duration: Duration::ZERO,
            succeeded: 0,
            failed: 0,
            declined: 0,
            cancelled: 0,
            failures: Vec::new(),
        }
    }

    fn add(&mut self, id: String, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(FailedTask { id, reason });
            }
            TaskOutcome::Declined => self.declined += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Tasks that were started (everything except cancelled ones)
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.declined
    }

    /// Whether the run was interrupted before every task started
    pub fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }

    /// One-line summary of the run
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Processed {} tasks ({} successes, {} failures)",
            self.processed(),
            self.succeeded,
            self.failed
        );
        if self.declined > 0 {
            line.push_str(&format!(", {} declined", self.declined));
        }
        if self.cancelled > 0 {
            line.push_str(&format!(", {} not started", self.cancelled));
        }
        line
    }
}

/// Yes/no decision source for interactive runs
pub trait Confirmer: Send + Sync {
    /// Ask a question, returning `true` for yes
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Confirmer that always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirmer for FixedAnswer {
    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Confirmer that prompts on a line-oriented stream
///
/// Accepts `Y`, `y`, `N` and `n`. Anything else is reported and asked again.
/// End of input counts as no. The whole prompt-and-read cycle holds a lock,
/// so prompts from concurrent workers never interleave.
pub struct PromptConfirmation<R, W> {
    io: Mutex<(R, W)>,
}

impl PromptConfirmation<BufReader<Stdin>, Stdout> {
    /// Prompt on stdout and read answers from stdin
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead + Send, W: Write + Send> PromptConfirmation<R, W> {
    /// Prompt on `output` and read answers from `input`
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }

    /// Give back the underlying streams
    pub fn into_inner(self) -> (R, W) {
        self.io.into_inner()
    }
}

impl<R: BufRead + Send, W: Write + Send> Confirmer for PromptConfirmation<R, W> {
    fn confirm(&self, question: &str) -> Result<bool> {
        let mut guard = self.io.lock();
        let (input, output) = &mut *guard;
        loop {
            write!(output, "{} [y/n] ", question)?;
            output.flush()?;

            let mut answer = String::new();
            if input.read_line(&mut answer)? == 0 {
                writeln!(output)?;
                return Ok(false);
            }
            match answer.trim() {
                "Y" | "y" => return Ok(true),
                "N" | "n" => return Ok(false),
                other => writeln!(output, "{} is not a valid input.", other)?,
            }
        }
    }
}

/// Observer of task progress
pub trait DispatchHook: Send + Sync {
    /// Called once with the number of tasks about to be dispatched
    fn tasks_queued(&self, _count: usize) {}

    /// Called when a worker picks up a task
    fn task_started(&self, _id: &str) {}

    /// Called once per task with its final outcome
    fn task_finished(&self, id: &str, outcome: &TaskOutcome);
}

/// Runs tasks against a registry on a bounded pool of workers
pub struct Dispatcher<'a> {
    client: &'a dyn RegistryClient,
    options: DispatchOptions,
    backup: Option<&'a BackupRecorder>,
    confirmer: Option<&'a dyn Confirmer>,
    hook: Option<&'a dyn DispatchHook>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for Dispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("domain", &self.client.domain())
            .field("options", &self.options)
            .field("backup", &self.backup.map(|b| b.path().to_path_buf()))
            .field("confirmer", &self.confirmer.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl<'a> Dispatcher<'a> {
    /// Create a dispatcher for a registry client
    pub fn new(client: &'a dyn RegistryClient, options: DispatchOptions) -> Self {
        Self {
            client,
            options,
            backup: None,
            confirmer: None,
            hook: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record current restrictions before mutating
    pub fn with_backup(mut self, backup: &'a BackupRecorder) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Ask for confirmation before every task
    pub fn with_confirmer(mut self, confirmer: &'a dyn Confirmer) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Report progress to a hook
    pub fn with_hook(mut self, hook: &'a dyn DispatchHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Use an externally owned cancellation flag
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops new tasks from starting once set
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Process every task of a snapshot
    ///
    /// Returns once every listed task has an outcome, or with the first
    /// fatal error.
    #[instrument(skip(self, tasks), fields(tasks = tasks.len(), workers = self.options.workers, dry_run = self.options.dry_run))]
    pub fn run(&self, tasks: TaskIter<'_>) -> Result<RunReport> {
        if self.options.workers == 0 {
            return Err(OriginError::InvalidConfiguration(
                "worker count must be at least 1".to_string(),
            ));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|i| format!("dispatch-{}", i))
            .build()
            .map_err(|e| OriginError::ThreadPool(e.to_string()))?;

        info!("Dispatching {} tasks", tasks.len());
        if let Some(hook) = self.hook {
            hook.tasks_queued(tasks.len());
        }
        let outcomes = pool.install(|| {
            tasks
                .par_bridge()
                .map(|task| self.process(&task))
                .collect::<Result<Vec<(String, TaskOutcome)>>>()
        })?;

        let mut report = RunReport::new(started_at);
        for (id, outcome) in outcomes {
            report.add(id, outcome);
        }
        report.failures.sort_by(|a, b| a.id.cmp(&b.id));
        report.duration = start.elapsed();

        info!("{}", report.summary());
        Ok(report)
    }

    fn process(&self, task: &TaskHandle<'_>) -> Result<(String, TaskOutcome)> {
        let id = task.id().to_string();
        if self.cancel.load(Ordering::SeqCst) {
            return Ok((id, TaskOutcome::Cancelled));
        }
        if let Some(hook) = self.hook {
            hook.task_started(&id);
        }

        let outcome = match self.execute(task) {
            Ok(true) => {
                task.mark_done()?;
                TaskOutcome::Succeeded
            }
            Ok(false) => TaskOutcome::Declined,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Task {} failed: {}", id, e);
                task.mark_error()?;
                TaskOutcome::Failed(e.to_string())
            }
        };

        if self.options.trace {
            info!(
                "{} | Coordinate {} success: {}",
                thread::current().name().unwrap_or("worker"),
                id,
                outcome.is_success()
            );
        }
        if let Some(hook) = self.hook {
            hook.task_finished(&id, &outcome);
        }
        Ok((id, outcome))
    }

    /// Returns `Ok(false)` when the operator declined
    fn execute(&self, task: &TaskHandle<'_>) -> Result<bool> {
        let record = task.read()?;

        if let Some(confirmer) = self.confirmer {
            if !confirmer.confirm(&describe(&record))? {
                debug!("Task {} declined", task.id());
                return Ok(false);
            }
        }

        let key = record.key();
        if let Some(backup) = self.backup {
            let before = self.client.describe_restrictions(&key)?;
            backup.record(&key, before)?;
        }

        if self.options.dry_run {
            debug!("Dry run, not applying restrictions to {}", key);
        } else {
            self.client.apply_restrictions(&key, record.restrictions())?;
        }
        Ok(true)
    }
}

fn describe(record: &PackageRecord) -> String {
    format!(
        "Set upstream={} publish={} on {}?",
        record.upstream,
        record.publish,
        record.key()
    )
}
