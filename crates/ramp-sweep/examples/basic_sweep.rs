use std::sync::Arc;

use chrono::Utc;
use ramp_log::ProgressLog;
use ramp_sweep::{ExperimentPool, FnEvaluator, SweepScheduler};
use ramp_types::{ExperimentConfig, RunReport, SweepSettings};

/// Queueing-style latency curve that blows up as the rate approaches the
/// network's saturation point.
fn synthetic_latency(config: &ExperimentConfig, rate: f64) -> ramp_types::EvalResult<f64> {
    let saturation = config
        .descriptor_field("saturation")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.3);
    let base = 20.0;
    if rate >= saturation {
        return Ok(10_000.0);
    }
    Ok(base / (1.0 - rate / saturation))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Ramp basic sweep example");

    let progress = Arc::new(ProgressLog::in_memory());
    let evaluator = Arc::new(FnEvaluator::new("synthetic", synthetic_latency));
    let pool = ExperimentPool::new(SweepScheduler::new(evaluator, Arc::clone(&progress)), 3);

    let configs: Vec<ExperimentConfig> = [("mesh-16", 0.42), ("mesh-64", 0.26), ("torus-64", 0.34)]
        .into_iter()
        .map(|(name, saturation)| {
            ExperimentConfig::new(name, SweepSettings::new(0.02, 200.0, 4))
                .with_descriptor("topology", name.split('-').next().unwrap_or(name))
                .with_descriptor("saturation", saturation)
        })
        .collect();
    println!("Sweeping {} experiments", configs.len());

    let started_at = Utc::now();
    let reports = pool.run_all(configs).await?;

    for report in &reports {
        println!(
            "{:<10} {:>3} points, stopped at {:?}, peak latency {:.1}",
            report.name(),
            report.results.len(),
            report.stats.stopped_at,
            report.peak_metric().unwrap_or_default()
        );
    }

    let run = RunReport::new(started_at, reports);
    println!("{}", run.to_json_pretty()?);

    if let Some(log) = progress.contents() {
        println!("Progress log:\n{log}");
    }
    Ok(())
}
