//! Promptlab CLI
//!
//! The `promptlab` command drives prompt documents through the lifecycle.
//!
//! ## Commands
//!
//! - `run`: evaluate, improve and promote one document or a whole stage
//! - `events`: print and verify the event stream of a workflow
//! - `report`: print the verified report of a workflow
//! - `matrix`: show the effective scoring matrix of a category

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use promptlab_core::domain::EventStatus;
use promptlab_core::reporting::render_report_md;
use promptlab_core::{
    cancel_pair, init_tracing, read_report, verify_stream, Category, FsDocumentStore,
    JsonlEventLog, LifecycleConfig, LifecycleOrchestrator, LogFormat, OpenAiJudge,
    PipelineContext, PipelineError, ProcessedDocument, RunOutcome, Stage, TimeoutJudge,
    WorkflowId,
};

#[derive(Parser)]
#[command(name = "promptlab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Score, improve and promote versioned prompt documents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML config file
    #[arg(short, long, global = true, env = "PROMPTLAB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run documents through the lifecycle
    Run {
        /// Single prompt file to process
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        file: Option<PathBuf>,

        /// Process every document of --stage
        #[arg(long)]
        all: bool,

        /// Stage to process with --all (raw, template, config)
        #[arg(long, default_value = "raw")]
        stage: Stage,

        /// Promotion threshold in [0, 1]
        #[arg(long)]
        threshold: Option<f64>,

        /// Improvement rounds before aborting
        #[arg(long)]
        max_retries: Option<u32>,

        /// Documents processed concurrently with --all
        #[arg(long)]
        workers: Option<usize>,

        /// Per-call judge timeout
        #[arg(long)]
        judge_timeout_ms: Option<u64>,

        /// Skip writing workflow reports
        #[arg(long)]
        no_report: bool,
    },

    /// Print and verify the event stream of a workflow
    Events {
        workflow_id: String,

        /// Event log directory (default: from config)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Print the report of a workflow
    Report {
        workflow_id: String,

        /// Report directory (default: from config)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Print the raw JSON instead of markdown
        #[arg(long)]
        raw: bool,
    },

    /// Show the effective scoring matrix of a category
    Matrix { category: Category },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(format, level);

    let config = LifecycleConfig::resolve(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            file,
            all,
            stage,
            threshold,
            max_retries,
            workers,
            judge_timeout_ms,
            no_report,
        } => {
            let mut config = config;
            if let Some(t) = threshold {
                config.threshold = t;
            }
            if let Some(r) = max_retries {
                config.max_retries = r;
            }
            if let Some(w) = workers {
                config.workers = w;
            }
            if let Some(ms) = judge_timeout_ms {
                config.judge_timeout_ms = ms;
            }
            config.validate().context("Invalid command-line override")?;

            let target = match (file, all) {
                (Some(path), _) => RunTarget::File(path),
                (None, _) => RunTarget::Stage(stage),
            };
            cmd_run(&config, target, no_report).await
        }
        Commands::Events {
            workflow_id,
            log_dir,
        } => cmd_events(&workflow_id, log_dir.as_deref().unwrap_or(&config.log_dir)).await,
        Commands::Report {
            workflow_id,
            report_dir,
            raw,
        } => cmd_report(
            &workflow_id,
            report_dir.as_deref().unwrap_or(&config.report_dir),
            raw,
        ),
        Commands::Matrix { category } => cmd_matrix(&config, category),
    }
}

enum RunTarget {
    File(PathBuf),
    Stage(Stage),
}

fn build_pipeline(config: &LifecycleConfig, no_report: bool) -> Result<PipelineContext> {
    let judge = OpenAiJudge::new(config.openai_config()).context("Failed to build judge client")?;
    let judge = TimeoutJudge::new(judge, Duration::from_millis(config.judge_timeout_ms));

    let sink = JsonlEventLog::new(&config.log_dir)
        .with_context(|| format!("Failed to open event log {:?}", config.log_dir))?;
    let store = FsDocumentStore::new(&config.prompts_dir, &config.archive_dir)
        .with_context(|| format!("Failed to open prompt store {:?}", config.prompts_dir))?;

    let orchestrator = LifecycleOrchestrator::new(Arc::new(judge), Arc::new(sink), config.policy()?)
        .context("Invalid lifecycle policy")?
        .with_outage_limit(config.consecutive_outage_limit);

    Ok(PipelineContext {
        store: Arc::new(store),
        orchestrator: Arc::new(orchestrator),
        registry: config.matrix_registry()?,
        report_dir: (!no_report).then(|| config.report_dir.clone()),
    })
}

/// Run one file or a whole stage
async fn cmd_run(config: &LifecycleConfig, target: RunTarget, no_report: bool) -> Result<()> {
    let pipeline = build_pipeline(config, no_report)?;

    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current step");
            handle.cancel();
        }
    });

    let results: Vec<Result<ProcessedDocument, PipelineError>> = match target {
        RunTarget::File(path) => vec![pipeline.process_document(&path, &cancel).await],
        RunTarget::Stage(stage) => {
            info!(stage = %stage, workers = config.workers, "processing stage");
            pipeline
                .process_stage(stage, config.workers, &cancel)
                .await
                .with_context(|| format!("Failed to list stage {stage}"))?
        }
    };

    if results.is_empty() {
        println!("No documents found.");
        return Ok(());
    }

    let mut failures = 0usize;
    for result in &results {
        match result {
            Ok(doc) => {
                if matches!(doc.outcome, RunOutcome::Failed { .. }) {
                    failures += 1;
                }
                print_processed(doc);
            }
            Err(e) => {
                failures += 1;
                println!("error     {e}");
            }
        }
    }

    let promoted = results
        .iter()
        .filter(|r| matches!(r, Ok(d) if matches!(d.outcome, RunOutcome::Promoted { .. })))
        .count();
    println!();
    println!(
        "{} document(s): {} promoted, {} not promoted, {} failed",
        results.len(),
        promoted,
        results.len() - promoted - failures,
        failures
    );

    if failures > 0 {
        bail!("{failures} document(s) failed");
    }
    Ok(())
}

fn print_processed(doc: &ProcessedDocument) {
    let scores: Vec<String> = doc.scores.iter().map(|s| format!("{s:.3}")).collect();
    println!(
        "{:<9} {} -> {} v{}  scores=[{}]  workflow={}",
        doc.outcome.label(),
        doc.source.display(),
        doc.final_stage,
        doc.final_version,
        scores.join(", "),
        doc.workflow_id
    );
    if let RunOutcome::Failed { kind, message } = &doc.outcome {
        println!("          {kind}: {message}");
    }
    if let Some(path) = &doc.written {
        println!("          wrote {}", path.display());
    }
}

/// Print and verify a workflow's event stream
async fn cmd_events(workflow_id: &str, log_dir: &Path) -> Result<()> {
    let log = JsonlEventLog::new(log_dir)
        .with_context(|| format!("Failed to open event log {:?}", log_dir))?;
    let events = log
        .read(&WorkflowId::new(workflow_id))
        .await
        .with_context(|| format!("Failed to read events for {workflow_id}"))?;

    for event in &events {
        let status = match event.status {
            EventStatus::Success => "ok",
            EventStatus::Error => "ERROR",
        };
        println!(
            "{:>4}  {:<8}  v{:<8}  {:<5}  {}",
            event.seq,
            event.step.as_str(),
            event.prompt_version.to_string(),
            status,
            event.payload.kind_str()
        );
    }

    let summary = verify_stream(&events).context("Event stream failed verification")?;
    println!();
    println!("Workflow:      {}", summary.workflow_id);
    println!("Terminal:      {:?}", summary.terminal_state);
    println!("Evaluations:   {}", summary.evaluations);
    println!("Improvements:  {}", summary.improvements);
    println!("Final version: {}", summary.final_version);
    println!("Replay digest: {}", summary.replay_digest);
    Ok(())
}

/// Print a verified workflow report
fn cmd_report(workflow_id: &str, report_dir: &Path, raw: bool) -> Result<()> {
    let report = read_report(report_dir, workflow_id)
        .with_context(|| format!("Failed to read report for {workflow_id}"))?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report_md(&report));
    }
    Ok(())
}

/// Show the effective scoring matrix
fn cmd_matrix(config: &LifecycleConfig, category: Category) -> Result<()> {
    let registry = config.matrix_registry()?;
    let matrix = registry.get(category);

    println!("Scoring matrix: {category}");
    println!("Required fields: {}", category.required_fields().join(", "));
    println!();
    for criterion in matrix.criteria() {
        println!(
            "  {:<28} weight {:>4.1}  -> {}",
            criterion.name, criterion.weight, criterion.target_field
        );
        println!("      {}", criterion.description);
    }
    println!();
    println!("Total weight: {:.1}", matrix.total_weight());
    Ok(())
}
