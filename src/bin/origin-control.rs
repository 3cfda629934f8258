//! # origin-control CLI
//!
//! Command-line front end for bulk origin restriction changes.
//!
//! ## Usage
//! ```bash
//! # Generate a plan that blocks upstream versions wherever it is safe
//! origin-control generate --domain corp --repository internal --registry-state registry.json
//!
//! # Check the plan without touching anything
//! origin-control apply --domain corp --repository internal \
//!     --input origin_configuration_corp_internal.csv --validate-only
//!
//! # Apply it with 8 workers
//! origin-control apply --domain corp --repository internal \
//!     --input origin_configuration_corp_internal.csv --registry-state registry.json --num-workers 8
//!
//! # Inspect and retry failures
//! origin-control apply ... --list-failed
//! origin-control apply ... --retry-failed
//!
//! # Undo the run using the backup taken before each change
//! origin-control apply ... --restore
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use origin_control::dispatch::{DispatchHook, PromptConfirmation, TaskOutcome};
use origin_control::plan::{self, PlanRequest};
use origin_control::registry::{FileRegistry, PackageFilter, RegistryClient};
use origin_control::{
    ApplyMode, ApplyOptions, ApplyOutcome, ApplyRunBuilder, DuplicatePolicy, OriginError, Result,
    ToolkitConfig, PACKAGE_FORMATS,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// origin-control - Bulk origin restrictions for package registries
#[derive(Parser)]
#[command(name = "origin-control")]
#[command(version)]
#[command(about = "Apply upstream/publish origin restrictions to many packages in one resumable run")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the restrictions listed in an input file
    Apply(ApplyArgs),

    /// Generate an input file for a repository
    #[command(alias = "gen")]
    Generate(GenerateArgs),
}

#[derive(Args)]
struct ApplyArgs {
    /// Registry domain
    #[arg(long)]
    domain: String,

    /// Repository name
    #[arg(long)]
    repository: String,

    /// Input CSV file
    #[arg(long)]
    input: PathBuf,

    /// Offline registry state file
    #[arg(long)]
    registry_state: Option<PathBuf>,

    /// Validate the input file and exit
    #[arg(long)]
    validate_only: bool,

    /// Keep the workspace after a successful run
    #[arg(long)]
    conserve_workspace: bool,

    /// Delete the workspace of the input and exit
    #[arg(long, conflicts_with_all = ["list_failed", "retry_failed"])]
    delete_workspace: bool,

    /// List packages whose update failed and exit
    #[arg(long, conflicts_with = "retry_failed")]
    list_failed: bool,

    /// Process only packages whose update failed
    #[arg(long)]
    retry_failed: bool,

    /// Print the outcome of every task
    #[arg(long)]
    trace: bool,

    /// Do not change anything in the registry
    #[arg(long)]
    dry_run: bool,

    /// Confirm every change interactively
    #[arg(long)]
    ask_confirmation: bool,

    /// Do not back up the current restrictions
    #[arg(long)]
    no_backup: bool,

    /// Restore packages to the state recorded in the backup of the input
    #[arg(long)]
    restore: bool,

    /// Number of parallel workers
    #[arg(long)]
    num_workers: Option<usize>,

    /// Timeout for each registry call (e.g. "30s", "2m")
    #[arg(long, value_parser = humantime::parse_duration)]
    call_timeout: Option<std::time::Duration>,

    /// What to do with rows that map to the same package
    #[arg(long, value_enum)]
    on_duplicate: Option<DuplicateMode>,

    /// Directory holding workspaces
    #[arg(long)]
    workspaces_home: Option<PathBuf>,

    /// Directory holding backups
    #[arg(long)]
    backups_home: Option<PathBuf>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Registry domain
    #[arg(long)]
    domain: String,

    /// Repository name
    #[arg(long)]
    repository: String,

    /// Offline registry state file
    #[arg(long)]
    registry_state: Option<PathBuf>,

    /// Package namespace (requires --format)
    #[arg(long)]
    namespace: Option<String>,

    /// Package format
    #[arg(long, value_parser = PACKAGE_FORMATS)]
    format: Option<String>,

    /// Package name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Restrictions for every package, e.g. "publish=ALLOW,upstream=BLOCK"
    #[arg(long = "set-restrictions")]
    restrictions: Option<String>,

    /// File with one package name per line (requires --format)
    #[arg(long)]
    from_list: Option<PathBuf>,

    /// Output file [default: origin_configuration_<domain>_<repository>.csv]
    #[arg(long)]
    output_file: Option<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum DuplicateMode {
    /// Refuse inputs with duplicate packages
    Reject,
    /// Keep the last row for each package
    LastWins,
}

impl From<DuplicateMode> for DuplicatePolicy {
    fn from(mode: DuplicateMode) -> Self {
        match mode {
            DuplicateMode::Reject => DuplicatePolicy::Reject,
            DuplicateMode::LastWins => DuplicatePolicy::LastWriteWins,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ToolkitConfig::load(path)?,
        None => ToolkitConfig::default(),
    };

    match cli.command {
        Commands::Apply(args) => cmd_apply(config, args),
        Commands::Generate(args) => cmd_generate(args),
    }
}

fn open_registry(path: Option<&PathBuf>) -> Result<Option<Arc<FileRegistry>>> {
    path.map(|p| FileRegistry::open(p).map(Arc::new)).transpose()
}

/// Progress bar fed by the dispatcher
struct ProgressHook {
    bar: ProgressBar,
    trace: bool,
}

impl DispatchHook for ProgressHook {
    fn tasks_queued(&self, count: usize) {
        self.bar.set_length(count as u64);
    }

    fn task_finished(&self, id: &str, outcome: &TaskOutcome) {
        self.bar.inc(1);
        match outcome {
            TaskOutcome::Failed(reason) => {
                self.bar.println(format!("{} {}: {}", "✗".red().bold(), id, reason));
            }
            TaskOutcome::Succeeded if self.trace => {
                self.bar.println(format!("{} {}", "✓".green(), id));
            }
            _ => {}
        }
    }
}

/// Apply restrictions from an input file
///
/// Validates the input, creates or resumes its workspace, backs up the
/// current restrictions and applies the new ones in parallel.
fn cmd_apply(mut config: ToolkitConfig, args: ApplyArgs) -> Result<()> {
    if let Some(workers) = args.num_workers {
        config.workers = workers;
    }
    if let Some(timeout) = args.call_timeout {
        config.call_timeout_ms = Some(timeout.as_millis() as u64);
    }
    if let Some(mode) = args.on_duplicate {
        config.duplicate_policy = mode.into();
    }
    if let Some(home) = args.workspaces_home {
        config.workspaces_home = home;
    }
    if let Some(home) = args.backups_home {
        config.backups_home = home;
    }

    let mode = if args.validate_only {
        ApplyMode::ValidateOnly
    } else if args.delete_workspace {
        ApplyMode::DeleteWorkspace
    } else if args.list_failed {
        ApplyMode::ListFailed
    } else if args.retry_failed {
        ApplyMode::RetryFailed
    } else {
        ApplyMode::Apply
    };
    let options = ApplyOptions {
        mode,
        dry_run: args.dry_run,
        trace: args.trace,
        ask_confirmation: args.ask_confirmation,
        no_backup: args.no_backup,
        restore: args.restore,
        conserve_workspace: args.conserve_workspace,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel))?;

    let needs_registry = matches!(mode, ApplyMode::Apply | ApplyMode::RetryFailed);
    let registry = open_registry(args.registry_state.as_ref())?;
    if needs_registry && registry.is_none() {
        return Err(OriginError::InvalidConfiguration(
            "--registry-state is required to apply restrictions".to_string(),
        ));
    }

    // Interactive prompts and a progress bar do not mix
    let show_progress = needs_registry && !args.ask_confirmation;
    let hook = Arc::new(ProgressHook {
        bar: if show_progress {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} packages")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            ProgressBar::hidden()
        },
        trace: args.trace,
    });

    let mut builder = ApplyRunBuilder::new(&args.domain, &args.repository, &args.input)
        .config(config)
        .options(options)
        .cancellation(Arc::clone(&cancel))
        .hook(hook.clone());
    if let Some(registry) = registry {
        builder = builder.client(registry);
    }
    if args.ask_confirmation {
        builder = builder.confirmer(Arc::new(PromptConfirmation::stdio()));
    }
    let run = builder.build()?;

    if mode == ApplyMode::Apply || mode == ApplyMode::RetryFailed {
        println!("{}", "Applying origin control changes...".blue().bold());
    }
    let start = Instant::now();
    let outcome = run.execute()?;
    hook.bar.finish_and_clear();

    match outcome {
        ApplyOutcome::Validated(count) => {
            println!("{} File is valid and contains {} records", "✓".green().bold(), count);
        }
        ApplyOutcome::WorkspaceDeleted(true) => {
            println!("{} Deleted workspace for {}", "✓".green().bold(), args.input.display());
        }
        ApplyOutcome::WorkspaceDeleted(false) => {
            println!("No workspace found for {}", args.input.display());
        }
        ApplyOutcome::FailedTasks(failed) => {
            if failed.is_empty() {
                println!("{}", "No failed packages".green());
            }
            for (_, record) in failed {
                println!("{}", record.to_fields().join(","));
            }
        }
        ApplyOutcome::Completed(summary) => {
            let report = &summary.report;
            let line = report.summary();
            if report.failed > 0 {
                println!("{} {}", "!".yellow().bold(), line.yellow());
            } else {
                println!("{} {}", "✓".green().bold(), line);
            }
            println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
            if let Some((path, rows)) = &summary.backup {
                println!("  Backup: {} ({} records)", path.display().to_string().cyan(), rows);
            }
            if summary.workspace_deleted {
                println!("  Workspace: deleted");
            } else {
                println!("  Workspace: {}", summary.workspace_root.display().to_string().cyan());
            }
            if report.was_cancelled() {
                println!(
                    "{}",
                    "Interrupted. Run the same command again to resume.".yellow()
                );
            } else if report.failed > 0 {
                println!("\nNext steps:");
                println!("  - Inspect failures: {}", "--list-failed".yellow());
                println!("  - Retry them: {}", "--retry-failed".yellow());
            }
        }
    }

    Ok(())
}

/// Generate an input file
///
/// Without `--set-restrictions` upstream versions are blocked for every
/// package that no upstream repository and no external connection can
/// provide; everything else stays allowed.
fn cmd_generate(args: GenerateArgs) -> Result<()> {
    let restrictions = args
        .restrictions
        .as_deref()
        .map(plan::parse_restrictions)
        .transpose()?;
    let request = PlanRequest {
        domain: args.domain.clone(),
        repository: args.repository.clone(),
        filter: PackageFilter {
            format: args.format,
            namespace: args.namespace,
            prefix: args.prefix,
        },
        restrictions,
        from_list: args.from_list,
    };
    request.validate()?;

    let output = args
        .output_file
        .unwrap_or_else(|| PathBuf::from(plan::default_output_name(&args.domain, &args.repository)));
    println!("Result is going to be written to {}", output.display().to_string().cyan());

    let registry = if request.is_offline() {
        None
    } else {
        let registry = open_registry(args.registry_state.as_ref())?;
        if registry.is_none() {
            return Err(OriginError::InvalidConfiguration(
                "--registry-state is required unless --from-list and --set-restrictions are both given"
                    .to_string(),
            ));
        }
        registry
    };

    let records = plan::generate(
        registry.as_deref().map(|r| r as &dyn RegistryClient),
        &request,
    )?;
    let written = plan::write_plan(&output, &records)?;
    println!("{} Wrote {} records", "✓".green().bold(), written);
    Ok(())
}
