use anyhow::{Context, Result};
use ci_medic::artifacts::{read_json, ArtifactStore};
use ci_medic::config::Config;
use ci_medic::diagnose::DiagnosisEngine;
use ci_medic::exec::checkpoint;
use ci_medic::exec::runner::SystemRunner;
use ci_medic::exec::{RepairExecutor, RepairOutcome};
use ci_medic::input::{resolve_log, workflow_context};
use ci_medic::model::{DiagnosisReport, RepairResult, WorkflowContext};
use ci_medic::publish::GitPublisher;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ci-medic",
    about = "Diagnose CI failure logs and apply safe automated fixes",
    version
)]
struct Cli {
    /// Path to the repository (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Debug logging (RUST_LOG still applies when not set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a CI log and write a diagnosis report
    Diagnose(RunArgs),
    /// Diagnose, then apply the auto-fixable part of the plan
    Repair(RepairArgs),
    /// List the known error families
    Patterns,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// CI log to read (defaults to <out>/ci.log, then <out>/logs/*.log, then $CI_MEDIC_LOG)
    #[arg(long)]
    log: Option<PathBuf>,
    /// Artifact directory (defaults to .ci-medic under the repository)
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    workflow: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    commit: Option<String>,
    /// Branch the failing run was on
    #[arg(long)]
    branch: Option<String>,
}

#[derive(Args, Debug)]
struct RepairArgs {
    #[command(flatten)]
    run: RunArgs,
    /// Report every step without running anything
    #[arg(long)]
    dry_run: bool,
    /// Commit locally but do not push or open a pull request
    #[arg(long)]
    no_publish: bool,
    /// Leave verified fixes uncommitted in the working tree
    #[arg(long)]
    no_commit: bool,
    /// Attempts per step
    #[arg(long)]
    max_retries: Option<u32>,
    /// Repair from a stored diagnosis report instead of a log
    #[arg(long, conflicts_with = "log")]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository path {} not found", cli.repo.display()))?;
    // Outside a git repository diagnosis still works; repair will refuse.
    let root = checkpoint::workdir(&repo).unwrap_or(repo);
    let config = Config::load(&root);
    info!(config = %config.config_location(), "configuration loaded");

    match cli.command {
        Commands::Diagnose(args) => diagnose(&root, &config, &args),
        Commands::Repair(args) => repair(&root, config, &args),
        Commands::Patterns => patterns(&config),
    }
}

fn artifact_store(root: &Path, config: &Config, args: &RunArgs) -> ArtifactStore {
    let dir = args
        .out
        .clone()
        .map(|out| if out.is_absolute() { out } else { root.join(out) })
        .unwrap_or_else(|| config.artifact_dir(root));
    ArtifactStore::new(root, dir)
}

fn build_report(
    root: &Path,
    config: &Config,
    args: &RunArgs,
    store: &ArtifactStore,
) -> Result<DiagnosisReport> {
    let library = config
        .pattern_library()
        .context("Invalid pattern configuration")?;
    let engine = DiagnosisEngine::new(Arc::new(library)).with_source_root(root);

    let source = resolve_log(args.log.as_deref(), store.dir(), |k| std::env::var(k).ok())?;
    let context = workflow_context(
        |k| std::env::var(k).ok(),
        WorkflowContext {
            workflow: args.workflow.clone(),
            run_id: args.run_id.clone(),
            commit: args.commit.clone(),
            branch: args.branch.clone(),
        },
    );
    info!(source = %source.label, "diagnosing log");
    let report = engine.diagnose_from(&source.content, &context, Some(&source.label));
    info!(
        findings = report.summary.total_findings,
        auto_fixable = report.summary.auto_fixable_findings,
        "diagnosis complete"
    );
    Ok(report)
}

fn diagnose(root: &Path, config: &Config, args: &RunArgs) -> Result<ExitCode> {
    let store = artifact_store(root, config, args);
    let report = build_report(root, config, args, &store)?;
    let path = store.write_report(&report)?;
    info!(path = %path.display(), "report written");
    print_json(&report)?;

    Ok(if report.findings.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn repair(root: &Path, config: Config, args: &RepairArgs) -> Result<ExitCode> {
    let store = artifact_store(root, &config, &args.run);
    let (report, stored) = match &args.report {
        Some(path) => (
            read_json::<DiagnosisReport>(path)
                .with_context(|| format!("Failed to load report {}", path.display()))?,
            true,
        ),
        None => (build_report(root, &config, &args.run, &store)?, false),
    };

    let mut policy = config.repair_policy();
    policy.dry_run = args.dry_run;
    if args.no_publish {
        policy.auto_publish = false;
    }
    if args.no_commit {
        policy.auto_commit = false;
    }
    if let Some(n) = args.max_retries {
        policy.max_retries = n.max(1);
    }

    let executor = RepairExecutor::new(
        root,
        Box::new(SystemRunner::new(&config.allowed_programs)),
        Box::new(GitPublisher),
    );

    // Refusals leave the repository exactly as found: no artifact dir, no exclude entry.
    if report.fix_plan.can_auto_fix {
        if let Err(err) = executor.preflight(&policy) {
            warn!("repair refused: {}", err);
            print_json(&RepairResult::refused(Some(report.id.clone()), &err.to_string()))?;
            return Ok(ExitCode::FAILURE);
        }
    }

    // Exclude the artifact dir before the checkpoint looks at the tree.
    store.ensure_dir()?;
    if !stored {
        store.write_report(&report)?;
    }
    if report.findings.is_empty() {
        info!("no findings; nothing to repair");
        return Ok(ExitCode::SUCCESS);
    }
    if !policy.rollback_enabled {
        warn!("rollback is disabled by configuration");
    }

    match executor.run(&report, &policy) {
        Ok(RepairOutcome::Executed(result)) => {
            store.write_result(&result)?;
            info!(outcome = ?result.outcome, "{}", result.summary);
            print_json(&result)?;
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Ok(RepairOutcome::Manual(guidance)) => {
            let path = store.write_guidance(&guidance)?;
            warn!(path = %path.display(), "{}", guidance.summary);
            print_json(&guidance)?;
            Ok(ExitCode::FAILURE)
        }
        Err(err) => {
            warn!("repair refused: {}", err);
            let result = RepairResult::refused(Some(report.id.clone()), &err.to_string());
            store.write_result(&result)?;
            print_json(&result)?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn patterns(config: &Config) -> Result<ExitCode> {
    let library = config
        .pattern_library()
        .context("Invalid pattern configuration")?;
    println!(
        "{:<18} {:<14} {:<9} {:<8} {:<21} DESCRIPTION",
        "FAMILY", "CATEGORY", "SEVERITY", "AUTOFIX", "EXIT POLICY"
    );
    for pattern in library.patterns() {
        println!(
            "{:<18} {:<14} {:<9} {:<8} {:<21} {}",
            pattern.family,
            pattern.category.as_str(),
            pattern.severity.as_str(),
            if pattern.auto_fixable { "yes" } else { "no" },
            pattern.exit_policy.as_str(),
            pattern.description
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
