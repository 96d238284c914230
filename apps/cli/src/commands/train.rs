//! Training command implementation.

use crate::{logging, setup};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_training::{
    make_artifact, write_manifest, ArtifactKind, FitReport, JsonlTelemetrySink, RunId, RunLayout,
    RunManifest, StdoutProgressSink, Telemetry, TrainerStatus,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub config: PathBuf,
    pub epochs: Option<u32>,
    pub seed: Option<u64>,
    pub json: bool,
}

pub async fn execute(options: TrainOptions, log_level: Option<String>) -> Result<()> {
    let mut config = setup::load_config(&options.config)?;
    if let Some(epochs) = options.epochs {
        config.hyper_parameters.epochs = epochs;
    }
    if let Some(seed) = options.seed {
        config.meta.rand_seed = Some(seed);
    }

    let run_id = RunId::new();
    let layout = RunLayout::for_config(&config, &run_id);
    layout.ensure_dirs().context("Failed to create run directory")?;
    let console = logging::console_level(log_level.as_deref(), config.logging.console.level)?;
    logging::init(console, Some((layout.log_path().as_path(), config.logging.file.level)))?;

    let sink = JsonlTelemetrySink::create(&layout.telemetry_path())
        .with_context(|| format!("Failed to create {}", layout.telemetry_path().display()))?;
    let mut trainer = setup::prepare(config)?
        .with_run_id(run_id.clone())
        .with_telemetry(Telemetry::new(Box::new(sink)));
    if !options.json {
        trainer = trainer.with_progress(Arc::new(StdoutProgressSink));
    }
    info!(run = %run_id, dir = %layout.run_dir().display(), "Starting run");

    let cancel = trainer.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });
    let (trainer, result) = tokio::task::spawn_blocking(move || {
        let result = trainer.fit();
        (trainer, result)
    })
    .await
    .context("Training task panicked")?;
    interrupt.abort();
    let report = result.context("Training failed")?;

    let evaluation = match trainer.evaluate("val") {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(error = %e, "Final evaluation failed");
            None
        }
    };

    let mut artifacts = vec![make_artifact(ArtifactKind::Config, options.config.clone())?];
    for (kind, path) in [(ArtifactKind::Telemetry, layout.telemetry_path()), (ArtifactKind::Log, layout.log_path())] {
        if path.exists() {
            artifacts.push(make_artifact(kind, path)?);
        }
    }
    let manifest = trainer.manifest(&report, evaluation, artifacts)?;
    write_manifest(&layout.manifest_path(), &manifest)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        print_summary(&report, &manifest, &layout);
    }

    match report.status {
        TrainerStatus::Finished => Ok(()),
        TrainerStatus::Cancelled => anyhow::bail!("Run {} was cancelled", report.run_id),
        _ => anyhow::bail!(
            "Run {} is incomplete: {}",
            report.run_id,
            report
                .incomplete
                .iter()
                .map(|i| format!("{}/{} at {}/{} epochs", i.optimizer, i.objective, i.epochs, i.budget))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn print_summary(report: &FitReport, manifest: &RunManifest, layout: &RunLayout) {
    println!();
    let title = match report.status {
        TrainerStatus::Finished => "Training complete".bold().green(),
        _ => format!("Training {}", report.status.label()).bold().yellow(),
    };
    println!("{title}");
    println!("  Run: {}", report.run_id.0.cyan());
    println!("  Steps: {}", report.train_steps);
    for (optimizer, examples) in &report.optimizer_steps {
        println!("  {}: {} examples", optimizer, examples);
    }
    if let Some(evaluation) = &manifest.evaluation {
        for (objective, result) in &evaluation.objectives {
            let loss = result.loss.map_or_else(|| "n/a".to_string(), |l| format!("{l:.6}"));
            println!("  {} {}: loss {}", evaluation.split.dimmed(), objective, loss);
        }
    }
    println!("  Manifest: {}", layout.manifest_path().display().to_string().dimmed());
    println!();
}
