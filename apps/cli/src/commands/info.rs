//! Run configuration overview.

use crate::{logging, setup};
use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::path::Path;

pub fn execute(path: &Path, json: bool, log_level: Option<&str>) -> Result<()> {
    let config = setup::load_config(path)?;
    logging::init(logging::console_level(log_level, config.logging.console.level)?, None)?;
    let trainer = setup::prepare(config)?;
    let analysis = trainer.analysis();
    let objectives = trainer.objectives();

    let bindings: Vec<(String, String, String)> = trainer
        .optimizers()
        .iter()
        .flat_map(|optimizer| {
            optimizer.objectives.iter().map(move |objective| {
                let dataset = objectives
                    .get(objective)
                    .map(|o| o.dataset().to_string())
                    .unwrap_or_default();
                (optimizer.name.clone(), objective.clone(), dataset)
            })
        })
        .collect();

    if json {
        let outputs: Vec<_> = analysis
            .output_names()
            .into_iter()
            .map(|name| {
                let path = analysis.subgraph(&name).map(<[String]>::to_vec).unwrap_or_default();
                json!({ "name": name, "path": path })
            })
            .collect();
        let bindings: Vec<_> = bindings
            .iter()
            .map(|(optimizer, objective, dataset)| {
                json!({ "optimizer": optimizer, "objective": objective, "dataset": dataset })
            })
            .collect();
        let out = json!({
            "model": trainer.config().model.name,
            "outputs": outputs,
            "bindings": bindings,
            "tracker_entries": trainer.tracker().len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Model {}", trainer.config().model.name).bold().cyan());
    println!();
    println!("{}", "Outputs".bold());
    for name in analysis.output_names() {
        let path = analysis.subgraph(&name).map(|p| p.join(" -> ")).unwrap_or_default();
        println!("  {:<16} {}", name.cyan(), path.dimmed());
    }
    println!();
    println!("{}", "Bindings".bold());
    println!("  {:<16} {:<16} {}", "Optimizer", "Objective", "Dataset");
    println!("  {}", "─".repeat(48));
    for (optimizer, objective, dataset) in &bindings {
        println!("  {:<16} {:<16} {}", optimizer, objective, dataset);
    }
    println!();
    println!("  Tracker entries: {}", trainer.tracker().len());
    println!();
    Ok(())
}
