//! Ramp CLI

mod plan;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use ramp_log::{ProgressLog, ProgressSummary};
use ramp_sweep::{ExperimentPool, SchedulerOptions, SweepScheduler};
use ramp_types::{RunReport, SweepStatus};

use crate::plan::{Overrides, RunPlan};

#[derive(Parser)]
#[command(name = "ramp")]
#[command(about = "Ramp - speculative saturation sweeps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep every experiment in a plan
    Run {
        /// Run plan (JSON)
        plan: PathBuf,

        /// Root directory for experiment outputs
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Progress log path
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Final report path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Experiments swept concurrently
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Check a plan without running anything
    Validate {
        /// Run plan (JSON)
        plan: PathBuf,
    },

    /// Follow a progress log and redraw a summary table
    Watch {
        /// Progress log to read
        log: PathBuf,

        /// Refresh interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Print the table once and exit
        #[arg(long)]
        once: bool,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run {
            plan,
            output,
            log_file,
            report,
            jobs,
        } => {
            let overrides = Overrides {
                output_dir: output,
                log_file,
                report_file: report,
                max_experiments: jobs,
            };
            cmd_run(&plan, &overrides).await
        }
        Commands::Validate { plan } => cmd_validate(&plan),
        Commands::Watch {
            log,
            interval_ms,
            once,
        } => cmd_watch(&log, Duration::from_millis(interval_ms), once).await,
    }
}

fn load_plan(path: &Path, overrides: &Overrides) -> Result<RunPlan> {
    let mut plan = RunPlan::load(path)?;
    plan.apply_env(|key| std::env::var(key).ok())?;
    plan.apply_overrides(overrides);
    Ok(plan)
}

async fn cmd_run(plan_path: &Path, overrides: &Overrides) -> Result<()> {
    let plan = load_plan(plan_path, overrides)?;
    let evaluator = plan.validate()?;
    let configs = plan.experiments();

    let log_path = plan.run.log_file();
    let progress = Arc::new(
        ProgressLog::create(&log_path)
            .with_context(|| format!("creating progress log {}", log_path.display()))?,
    );
    let scheduler = SweepScheduler::new(Arc::new(evaluator), Arc::clone(&progress)).with_options(
        SchedulerOptions {
            cancel_grace: plan.run.cancel_grace(),
        },
    );
    let pool = ExperimentPool::new(scheduler, plan.run.max_experiments);

    let shutdown = pool.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling experiments");
            shutdown.cancel();
        }
    });

    info!(
        plan = %plan_path.display(),
        experiments = configs.len(),
        output_dir = %plan.run.output_dir.display(),
        log_file = %log_path.display(),
        "starting run"
    );

    let started_at = Utc::now();
    let reports = pool.run_all(configs).await?;
    let report = RunReport::new(started_at, reports);

    let report_path = plan.run.report_file();
    report
        .write_json(&report_path)
        .with_context(|| format!("writing report {}", report_path.display()))?;
    progress.note(report.to_json_pretty()?);

    for experiment in &report.experiments {
        let outcome = match &experiment.status {
            SweepStatus::ThresholdReached { parameter } => format!("threshold at {parameter:.2}"),
            SweepStatus::Exhausted => "exhausted".to_string(),
            SweepStatus::Aborted => "aborted".to_string(),
            SweepStatus::Failed { error } => format!("failed: {error}"),
        };
        println!(
            "{:<50} {:>4} points  {}",
            experiment.name(),
            experiment.results.len(),
            outcome
        );
    }
    info!(report = %report_path.display(), run_id = %report.run_id, "run finished");

    if pool.shutdown_token().is_cancelled() {
        bail!("run interrupted; partial report written to {}", report_path.display());
    }
    Ok(())
}

fn cmd_validate(plan_path: &Path) -> Result<()> {
    let plan = load_plan(plan_path, &Overrides::default())?;
    plan.validate()?;
    println!(
        "{}: {} experiments, up to {} at a time, outputs under {}",
        plan_path.display(),
        plan.experiments.len(),
        plan.run.max_experiments,
        plan.run.output_dir.display()
    );
    Ok(())
}

async fn cmd_watch(log: &Path, interval: Duration, once: bool) -> Result<()> {
    let started = Instant::now();
    loop {
        let summary = match ProgressSummary::read(log) {
            Ok(summary) => summary,
            Err(e) if e.kind() == ErrorKind::NotFound => ProgressSummary::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", log.display()));
            }
        };
        let table = summary.render(started.elapsed());

        {
            let mut stdout = std::io::stdout().lock();
            if once {
                write!(stdout, "{table}")?;
                return Ok(());
            }
            write!(stdout, "\x1B[2J\x1B[H{table}")?;
            stdout.flush()?;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
