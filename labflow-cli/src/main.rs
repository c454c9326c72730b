use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labflow::acquire::PipelineSource;
use labflow::config::RunnerConfig;
use labflow::events::LoggingEventSink;
use labflow::manifest::PipelineManifest;
use labflow::observability::init_tracing;
use labflow::params::{parse_override_tokens, resolve_params, ResolvedParams};
use labflow::scheduler::{RunOptions, Scheduler};
use labflow::store::ArtifactStore;
use tracing::info;

/// Default runner configuration file looked up under the work directory.
const CONFIG_FILE: &str = "labflow.yaml";

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_log);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let exit_code = runtime.block_on(dispatch(cli.command))?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            pipeline,
            revision,
            config,
            workdir,
            force,
            max_parallel,
            report,
            overrides,
        } => {
            run_pipeline(
                &pipeline,
                revision,
                config,
                workdir,
                force,
                max_parallel,
                report,
                &overrides,
            )
            .await
        }
        Commands::Validate {
            pipeline,
            revision,
            workdir,
        } => validate_pipeline(&pipeline, revision, workdir).await,
        Commands::Plan {
            pipeline,
            revision,
            config,
            workdir,
            overrides,
        } => plan_pipeline(&pipeline, revision, config, workdir, &overrides).await,
        Commands::Params { pipeline, revision } => list_params(&pipeline, revision).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    pipeline: &str,
    revision: Option<String>,
    config: Option<PathBuf>,
    workdir: Option<PathBuf>,
    force: bool,
    max_parallel: Option<usize>,
    report_path: Option<PathBuf>,
    overrides: &[String],
) -> Result<i32> {
    let workdir = resolve_workdir(workdir)?;
    let mut config = load_config(config, &workdir)?;
    if let Some(parallel) = max_parallel {
        config.max_parallel = parallel;
    }

    let manifest = load_manifest(pipeline, revision, &workdir, &config).await?;
    let params = resolve_overrides(&manifest, overrides)?;

    let scheduler = Scheduler::new(manifest, params, config)
        .with_events(Arc::new(LoggingEventSink));

    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel("interrupt");
        }
    });

    let report = scheduler
        .run(&RunOptions {
            workdir: workdir.clone(),
            force,
        })
        .await?;

    if let Some(path) = report_path {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create report directory: {}", parent.display())
                })?;
            }
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    if report.failures.has_failures() {
        eprintln!(
            "Run failed; failed stages: {}",
            report.failures.failed_stages().join(", ")
        );
    } else if report.cancelled {
        eprintln!("Run cancelled");
    } else {
        println!(
            "Run succeeded: {} executed, {} up to date",
            report.executed_stages().len(),
            report.cached_stages().len()
        );
    }

    Ok(report.exit_code())
}

async fn validate_pipeline(
    pipeline: &str,
    revision: Option<String>,
    workdir: Option<PathBuf>,
) -> Result<i32> {
    let workdir = resolve_workdir(workdir)?;
    let config = RunnerConfig::default();
    let manifest = load_manifest(pipeline, revision, &workdir, &config).await?;

    let scheduler = Scheduler::new(manifest, ResolvedParams::default(), config);
    let plan = scheduler.plan(&workdir)?;

    println!("Pipeline is valid. Execution order:");
    for name in plan.graph.execution_order() {
        println!("- {name}");
    }
    Ok(0)
}

async fn plan_pipeline(
    pipeline: &str,
    revision: Option<String>,
    config: Option<PathBuf>,
    workdir: Option<PathBuf>,
    overrides: &[String],
) -> Result<i32> {
    let workdir = resolve_workdir(workdir)?;
    let config = load_config(config, &workdir)?;
    let manifest = load_manifest(pipeline, revision, &workdir, &config).await?;
    let params = resolve_overrides(&manifest, overrides)?;

    let scheduler = Scheduler::new(manifest, params, config.clone());
    let plan = scheduler.plan(&workdir)?;
    let store = ArtifactStore::open(&config.store_root_for(&workdir))?;

    println!("{:<24} {:<34} status", "stage", "fingerprint");
    for (name, cached) in plan.cache_status(&store)? {
        let status = if cached { "cached" } else { "will run" };
        println!("{:<24} {:<34} {status}", name, plan.fingerprints[&name]);
    }
    Ok(0)
}

async fn list_params(pipeline: &str, revision: Option<String>) -> Result<i32> {
    let workdir = resolve_workdir(None)?;
    let config = RunnerConfig::default();
    let manifest = load_manifest(pipeline, revision, &workdir, &config).await?;

    if manifest.params.is_empty() {
        println!("Pipeline '{}' declares no parameters.", manifest.name);
        return Ok(0);
    }

    println!("Parameters of '{}':", manifest.name);
    for decl in &manifest.params {
        let description = decl.description.as_deref().unwrap_or("");
        println!(
            "  --{} <{}>  (default: {})  {}",
            decl.name,
            decl.default.type_name(),
            decl.default,
            description
        );
    }
    Ok(0)
}

fn resolve_workdir(workdir: Option<PathBuf>) -> Result<PathBuf> {
    match workdir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

fn load_config(explicit: Option<PathBuf>, workdir: &Path) -> Result<RunnerConfig> {
    if let Some(path) = explicit {
        return Ok(RunnerConfig::load(&path)?);
    }
    let implicit = workdir.join(CONFIG_FILE);
    if implicit.is_file() {
        return Ok(RunnerConfig::load(&implicit)?);
    }
    Ok(RunnerConfig::default())
}

async fn load_manifest(
    pipeline: &str,
    revision: Option<String>,
    workdir: &Path,
    config: &RunnerConfig,
) -> Result<PipelineManifest> {
    let source = PipelineSource::classify(pipeline, revision);
    let cache_root = config.store_root_for(workdir).join("pipelines");
    let local = source.materialize(&cache_root, &config.retry).await?;
    Ok(PipelineManifest::load(&local)?)
}

fn resolve_overrides(
    manifest: &PipelineManifest,
    overrides: &[String],
) -> Result<ResolvedParams> {
    let tokens: BTreeMap<String, String> = parse_override_tokens(overrides)?;
    let params = resolve_params(&manifest.params, &tokens)?;
    Ok(params)
}

#[derive(Parser)]
#[command(
    name = "labflow",
    version,
    about = "Declarative pipeline runner for reproducible research workflows"
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_log: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, schedule, and execute a pipeline.
    Run {
        /// Manifest path, directory containing pipeline.yaml, or git URL.
        pipeline: String,
        /// Revision to check out for git pipeline references.
        #[arg(long)]
        revision: Option<String>,
        /// Runner configuration file (defaults to labflow.yaml in the work
        /// directory when present).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Work directory for pre-supplied inputs and the artifact store.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Re-execute stages even when a published artifact matches.
        #[arg(long)]
        force: bool,
        /// Cap on concurrently running stages.
        #[arg(long = "max-parallel")]
        max_parallel: Option<usize>,
        /// Write the run report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Parameter overrides as `--name value` pairs.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        overrides: Vec<String>,
    },
    /// Check a pipeline's configuration without executing anything.
    Validate {
        /// Manifest path, directory, or git URL.
        pipeline: String,
        /// Revision to check out for git pipeline references.
        #[arg(long)]
        revision: Option<String>,
        /// Work directory pre-supplied inputs are resolved against.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Show the execution order and per-stage cache status.
    Plan {
        /// Manifest path, directory, or git URL.
        pipeline: String,
        /// Revision to check out for git pipeline references.
        #[arg(long)]
        revision: Option<String>,
        /// Runner configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Work directory.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Parameter overrides as `--name value` pairs.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        overrides: Vec<String>,
    },
    /// List a pipeline's declared parameters.
    Params {
        /// Manifest path, directory, or git URL.
        pipeline: String,
        /// Revision to check out for git pipeline references.
        #[arg(long)]
        revision: Option<String>,
    },
}
