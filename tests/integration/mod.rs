//! End-to-end tests for origin-control
//!
//! Runs complete apply/retry/restore cycles against an in-memory registry
//! and checks the registry, the workspace and the backup afterwards.

use ::origin_control::registry::{
    PackageSummary, RegistryState, RepositoryUpstreams, StoredPackage, StoredRepository,
};
use ::origin_control::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::info;
use tracing_test::traced_test;

pub const HEADER: &str = "domain,repository,format,namespace,package,upstream,publish";

/// Registry wrapper that counts calls and fails on demand
#[derive(Debug)]
pub struct CountingRegistry {
    inner: FileRegistry,
    described: AtomicUsize,
    applied: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl CountingRegistry {
    pub fn new(state: RegistryState) -> Self {
        Self {
            inner: FileRegistry::in_memory(state),
            described: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every apply for this package fail until healed
    pub fn fail_package(&self, package: &str) {
        self.failing.lock().unwrap().insert(package.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn describe_calls(&self) -> usize {
        self.described.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn restrictions_of(&self, package: &str) -> Restrictions {
        self.inner.snapshot().repositories["internal"]
            .packages
            .iter()
            .find(|p| p.package == package)
            .map(|p| p.restrictions)
            .unwrap()
    }
}

impl RegistryClient for CountingRegistry {
    fn domain(&self) -> &str {
        self.inner.domain()
    }

    fn describe_restrictions(&self, key: &PackageKey) -> Result<Restrictions> {
        self.described.fetch_add(1, Ordering::SeqCst);
        self.inner.describe_restrictions(key)
    }

    fn apply_restrictions(&self, key: &PackageKey, restrictions: Restrictions) -> Result<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&key.package) {
            return Err(OriginError::registry(format!("injected failure for {}", key)));
        }
        self.inner.apply_restrictions(key, restrictions)
    }

    fn list_packages(&self, repository: &str, filter: &PackageFilter) -> Result<Vec<PackageSummary>> {
        self.inner.list_packages(repository, filter)
    }

    fn repository_upstreams(&self, repository: &str) -> Result<RepositoryUpstreams> {
        self.inner.repository_upstreams(repository)
    }
}

/// One input file, one registry and a private workspace/backup home
pub struct RunHarness {
    pub temp_dir: TempDir,
    pub input: PathBuf,
    pub registry: Arc<CountingRegistry>,
}

impl RunHarness {
    /// Registry holding `packages` with everything allowed, and an input
    /// blocking upstream versions for each of them
    pub fn new(packages: &[&str]) -> Self {
        Self::with_rows(packages, &blocking_rows(packages))
    }

    pub fn with_rows(packages: &[&str], rows: &[String]) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("plan.csv");
        write_input(&input, rows);

        Self {
            temp_dir,
            input,
            registry: Arc::new(CountingRegistry::new(npm_registry(packages))),
        }
    }

    pub fn config(&self) -> ToolkitConfig {
        ToolkitConfig {
            workspaces_home: self.workspaces_home(),
            backups_home: self.backups_home(),
            workers: 3,
            ..Default::default()
        }
    }

    pub fn workspaces_home(&self) -> PathBuf {
        self.temp_dir.path().join("workspaces")
    }

    pub fn backups_home(&self) -> PathBuf {
        self.temp_dir.path().join("backups")
    }

    pub fn builder(&self) -> ApplyRunBuilder {
        ApplyRunBuilder::new("corp", "internal", &self.input)
            .config(self.config())
            .client(self.registry.clone())
    }

    pub fn run(&self, builder: ApplyRunBuilder) -> ApplySummary {
        match builder.build().unwrap().execute().unwrap() {
            ApplyOutcome::Completed(summary) => {
                info!("{}", summary.report.summary());
                summary
            }
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::open(&self.input, &self.workspaces_home()).unwrap()
    }

    pub fn backup_rows(&self) -> Vec<PackageRecord> {
        let identity = ContentIdentity::from_file(&self.input).unwrap();
        let path = backup_path_for(&self.backups_home(), &identity);
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.deserialize().map(|r| r.unwrap()).collect()
    }
}

/// Registry `corp` whose `internal` repository holds these npm packages,
/// everything allowed
pub fn npm_registry<S: AsRef<str>>(packages: &[S]) -> RegistryState {
    let stored = packages
        .iter()
        .map(|p| StoredPackage {
            format: "npm".to_string(),
            namespace: String::new(),
            package: p.as_ref().to_string(),
            restrictions: Restrictions::ALLOW_ALL,
        })
        .collect();
    RegistryState::new("corp").with_repository(
        "internal",
        StoredRepository {
            packages: stored,
            ..Default::default()
        },
    )
}

/// Input blocking upstream versions for these npm packages
pub fn blocking_rows<S: AsRef<str>>(packages: &[S]) -> Vec<String> {
    packages
        .iter()
        .map(|p| format!("corp,internal,npm,,{},BLOCK,ALLOW", p.as_ref()))
        .collect()
}

pub fn write_input(path: &Path, rows: &[String]) {
    let mut content = format!("{}\n", HEADER);
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(path, content).unwrap();
}

#[test]
#[traced_test]
fn test_invalid_input_touches_nothing() {
    let rows = vec![
        "corp,internal,npm,,a,BLOCK,ALLOW".to_string(),
        "corp,internal,npm,,b,ALLOW,ALLOW".to_string(),
        "corp,internal,npm,,c,MAYBE,ALLOW".to_string(),
    ];
    let harness = RunHarness::with_rows(&["a", "b", "c"], &rows);

    let err = harness.builder().build().unwrap().execute().unwrap_err();
    match err {
        OriginError::Validation { line, message } => {
            assert_eq!(line, 4);
            assert!(message.contains("MAYBE"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert!(!harness.workspaces_home().exists());
    assert!(!harness.backups_home().exists());
    assert_eq!(harness.registry.describe_calls(), 0);
    assert_eq!(harness.registry.apply_calls(), 0);
}

#[test]
#[traced_test]
fn test_dry_run_records_backup_without_applying() {
    let harness = RunHarness::new(&["left-pad", "is-odd"]);

    let summary = harness.run(harness.builder().dry_run(true));

    assert_eq!(summary.report.succeeded, 2);
    assert_eq!(summary.report.failed, 0);
    assert!(summary.workspace_deleted);
    assert_eq!(harness.registry.apply_calls(), 0);
    assert_eq!(harness.registry.describe_calls(), 2);

    let (_, written) = summary.backup.unwrap();
    assert_eq!(written, 2);
    let rows = harness.backup_rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.restrictions() == Restrictions::ALLOW_ALL));
    assert_eq!(harness.registry.restrictions_of("left-pad"), Restrictions::ALLOW_ALL);
}

#[test]
#[traced_test]
fn test_failures_are_isolated_and_retried() {
    let packages = ["a", "b", "c", "d", "e"];
    let harness = RunHarness::new(&packages);
    harness.registry.fail_package("c");

    let summary = harness.run(harness.builder());
    assert_eq!(summary.report.succeeded, 4);
    assert_eq!(summary.report.failed, 1);
    assert_eq!(summary.report.failures[0].id, "corp-internal-npm--c");
    assert!(!summary.workspace_deleted);

    let workspace = harness.workspace();
    let status = workspace.status().unwrap();
    assert_eq!((status.todo, status.error, status.done), (0, 1, 4));
    assert_eq!(workspace.state_of("corp-internal-npm--c"), Some(TaskState::Error));
    assert_eq!(harness.registry.restrictions_of("c"), Restrictions::ALLOW_ALL);

    // Listing does not process anything
    let listed = harness
        .builder()
        .mode(ApplyMode::ListFailed)
        .build()
        .unwrap()
        .execute()
        .unwrap();
    match listed {
        ApplyOutcome::FailedTasks(failed) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].1.package, "c");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    harness.registry.heal();
    let retried = harness.run(harness.builder().mode(ApplyMode::RetryFailed));
    assert_eq!(retried.report.succeeded, 1);
    assert_eq!(retried.report.failed, 0);
    assert!(retried.workspace_deleted);

    for package in packages {
        assert_eq!(
            harness.registry.restrictions_of(package),
            Restrictions::UPSTREAM_BLOCKED
        );
    }
    // The retry appended to the first backup instead of replacing it
    assert_eq!(harness.backup_rows().len(), 6);
}

#[test]
#[traced_test]
fn test_resume_processes_only_pending_tasks() {
    let packages = ["a", "b", "c", "d", "e"];
    let harness = RunHarness::new(&packages);

    // An earlier run was interrupted after two tasks
    {
        let workspace = Workspace::initialize(&harness.input, &harness.workspaces_home()).unwrap();
        workspace.mark_done("corp-internal-npm--a").unwrap();
        workspace.mark_done("corp-internal-npm--b").unwrap();
    }

    let summary = harness.run(harness.builder());
    assert_eq!(summary.report.succeeded, 3);
    assert_eq!(harness.registry.apply_calls(), 3);
    assert!(summary.workspace_deleted);

    assert_eq!(harness.registry.restrictions_of("a"), Restrictions::ALLOW_ALL);
    assert_eq!(harness.registry.restrictions_of("e"), Restrictions::UPSTREAM_BLOCKED);
}

#[test]
#[traced_test]
fn test_restore_reverts_a_run() {
    let harness = RunHarness::new(&["x", "y", "z"]);

    harness.run(harness.builder());
    for package in ["x", "y", "z"] {
        assert_eq!(
            harness.registry.restrictions_of(package),
            Restrictions::UPSTREAM_BLOCKED
        );
    }

    let restored = harness.run(harness.builder().restore(true));
    assert_eq!(restored.report.succeeded, 3);
    assert!(restored.backup.is_none());
    for package in ["x", "y", "z"] {
        assert_eq!(harness.registry.restrictions_of(package), Restrictions::ALLOW_ALL);
    }
}

#[test]
#[traced_test]
fn test_restore_after_retry_reverts_everything() {
    let harness = RunHarness::new(&["a", "b", "c"]);
    harness.registry.fail_package("c");

    let first = harness.run(harness.builder());
    assert_eq!(first.report.failed, 1);
    harness.registry.heal();
    let retried = harness.run(harness.builder().mode(ApplyMode::RetryFailed));
    assert_eq!(retried.report.succeeded, 1);

    // "c" was backed up by both attempts
    let rows = harness.backup_rows();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().filter(|r| r.package == "c").count(), 2);

    let restored = harness.run(harness.builder().restore(true));
    assert_eq!(restored.report.succeeded, 3);
    assert_eq!(restored.report.failed, 0);
    for package in ["a", "b", "c"] {
        assert_eq!(harness.registry.restrictions_of(package), Restrictions::ALLOW_ALL);
    }
}

#[test]
#[traced_test]
fn test_confirmation_decides_per_task() {
    struct OnlyFirst;

    impl Confirmer for OnlyFirst {
        fn confirm(&self, question: &str) -> Result<bool> {
            Ok(question.contains("first"))
        }
    }

    let harness = RunHarness::new(&["first", "second"]);
    let summary = harness.run(
        harness
            .builder()
            .conserve_workspace(true)
            .confirmer(Arc::new(OnlyFirst)),
    );

    assert_eq!(summary.report.succeeded, 1);
    assert_eq!(summary.report.declined, 1);
    assert_eq!(harness.registry.restrictions_of("first"), Restrictions::UPSTREAM_BLOCKED);
    assert_eq!(harness.registry.restrictions_of("second"), Restrictions::ALLOW_ALL);

    let workspace = harness.workspace();
    assert_eq!(workspace.state_of("corp-internal-npm--second"), Some(TaskState::Todo));
}
