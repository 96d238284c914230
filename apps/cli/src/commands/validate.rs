//! Configuration validation command.
//!
//! Runs the same setup as `train` and opens every declared split once.

use crate::{logging, setup};
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tessera_training::convert_to_single_pass_iterator;

#[derive(Serialize)]
struct ValidationOutput {
    valid: bool,
    fingerprint: String,
    outputs: Vec<String>,
    datasets: Vec<String>,
    objectives: Vec<String>,
    optimizers: Vec<String>,
    tracker_entries: usize,
}

pub fn execute(path: &Path, json: bool, log_level: Option<&str>) -> Result<()> {
    let config = setup::load_config(path)?;
    logging::init(logging::console_level(log_level, config.logging.console.level)?, None)?;
    let fingerprint = config.fingerprint()?;

    let trainer = setup::prepare(config).context("Configuration is not runnable")?;
    convert_to_single_pass_iterator(trainer.datasets()).context("Failed to open dataset splits")?;

    let output = ValidationOutput {
        valid: true,
        fingerprint,
        outputs: trainer.analysis().output_names(),
        datasets: trainer.datasets().names().map(str::to_string).collect(),
        objectives: trainer.objectives().names().map(str::to_string).collect(),
        optimizers: trainer.optimizers().names(),
        tracker_entries: trainer.tracker().len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "✓".green(), format!("{} is valid", path.display()).bold());
    println!("  Outputs:    {}", output.outputs.join(", "));
    println!("  Datasets:   {}", output.datasets.join(", "));
    println!("  Objectives: {}", output.objectives.join(", "));
    println!("  Optimizers: {}", output.optimizers.join(", "));
    println!("  Trackers:   {}", output.tracker_entries);
    println!("  Fingerprint: {}", output.fingerprint.dimmed());
    println!();
    Ok(())
}
