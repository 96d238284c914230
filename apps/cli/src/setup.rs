//! Wiring between a run configuration and the reference engine.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tessera_abstraction::RecordSource;
use tessera_reference::{CsvColumn, CsvSource, LinearGraph, ReferenceFactory};
use tessera_training::{DependencyGraph, TrainConfig, Trainer};

pub fn load_config(path: &Path) -> Result<TrainConfig> {
    TrainConfig::from_path(path).with_context(|| format!("Failed to load configuration {}", path.display()))
}

/// One CSV source per dataset. Every declared split needs a `path`.
pub fn build_sources(config: &TrainConfig) -> Result<BTreeMap<String, Arc<dyn RecordSource>>> {
    let mut sources: BTreeMap<String, Arc<dyn RecordSource>> = BTreeMap::new();

    for (name, dataset) in config.data.datasets.iter() {
        let features = dataset.inputs().map(|(f, c)| CsvColumn::new(f, c.width())).collect();
        let labels = dataset.labels().map(|(f, c)| CsvColumn::new(f, c.width())).collect();
        let mut source = CsvSource::new(features, labels);

        if dataset.splits.is_empty() {
            anyhow::bail!("dataset '{name}' declares no splits");
        }
        for (split, split_config) in dataset.splits.iter() {
            let Some(path) = &split_config.path else {
                anyhow::bail!("split '{split}' of dataset '{name}' has no path");
            };
            source = source.with_split(split, path.clone());
        }
        sources.insert(name.to_string(), Arc::new(source));
    }

    Ok(sources)
}

/// A linear head per model endpoint. `units` comes from the layer options.
pub fn build_graph(config: &TrainConfig) -> Result<LinearGraph> {
    let analysis = DependencyGraph::analyze(&config.data, &config.model)?;

    let mut widths = config
        .data
        .datasets
        .values()
        .map(|d| d.inputs().map(|(_, c)| c.width()).sum::<usize>());
    let input_width = widths.next().unwrap_or(0);
    if widths.any(|w| w != input_width) {
        anyhow::bail!("the reference graph needs every dataset to have the same input width");
    }

    let mut heads = Vec::new();
    for output in analysis.output_names() {
        let units = config
            .model
            .layers
            .get(&output)
            .and_then(|layer| layer.options.get("units"))
            .map_or(Some(1), serde_json::Value::as_u64)
            .with_context(|| format!("layer '{output}': options.units must be a positive integer"))?;
        heads.push((output, units as usize));
    }

    LinearGraph::new(input_width, heads, config.meta.seed()).map_err(|e| anyhow::anyhow!("cannot build graph: {e}"))
}

/// Runs the full setup and returns a trainer ready to fit.
pub fn prepare(config: TrainConfig) -> Result<Trainer> {
    let sources = build_sources(&config)?;
    let graph = build_graph(&config)?;
    let trainer = Trainer::new(Box::new(graph), config, sources, Arc::new(ReferenceFactory))?;
    Ok(trainer)
}
