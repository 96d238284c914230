//! Validation passes and full-split evaluation.

use crate::config::{LossDescription, NamedMap};
use crate::datasets::{BatchIterator, Dataset};
use crate::error::{TrainingError, TrainingResult};
use crate::objectives::{group_by_input, InputGroup, Objective};
use crate::optimizers::Meters;
use serde::Serialize;
use std::collections::BTreeMap;
use tessera_abstraction::{Batch, ComponentFactory, Graph, Tensor};
use tracing::{debug, warn};

pub const VAL_SPLIT: &str = "val";

/// Result of one validation pass for one objective.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub optimizer: String,
    pub objective: String,
    pub dataset: String,
    pub epoch: u32,
    pub batches: u64,
    pub loss: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
}

fn prediction<'a>(objective: &Objective, outputs: &'a [Tensor]) -> TrainingResult<&'a Tensor> {
    let index = objective.output_index.unwrap_or(0);
    outputs.get(index).ok_or_else(|| {
        TrainingError::config(format!(
            "objective '{}' reads output slot {index}, graph returned {}",
            objective.name,
            outputs.len()
        ))
    })
}

fn score(objective: &Objective, batch: &Batch, predicted: &Tensor, meters: &mut Meters) -> TrainingResult<()> {
    let target = batch.target(objective.target()).ok_or_else(|| {
        TrainingError::Dataset(format!(
            "batch of '{}' has no label '{}'",
            objective.dataset(),
            objective.target()
        ))
    })?;
    let losses = objective
        .loss
        .value(target, predicted)
        .map_err(|e| TrainingError::numeric("loss", e))?;
    if !losses.is_empty() {
        meters.record_loss(losses.iter().sum::<f32>() / losses.len() as f32);
    }
    for (metric, error) in meters.update_metrics(target, predicted) {
        warn!(objective = %objective.name, metric, error = %error, "Metric update failed");
    }
    Ok(())
}

/// Runs `objective` over a fresh `val` iterator, resetting `meters` first.
pub fn validation_pass(
    graph: &dyn Graph,
    objective: &Objective,
    optimizer: &str,
    epoch: u32,
    meters: &mut Meters,
    iterator: &mut BatchIterator,
) -> TrainingResult<ValidationSummary> {
    meters.reset();
    let mut batches = 0;
    while let Some(batch) = iterator.next_batch()? {
        let outputs = graph.forward(&batch.inputs).map_err(|e| TrainingError::numeric("forward", e))?;
        score(objective, &batch, prediction(objective, &outputs)?, meters)?;
        batches += 1;
    }
    debug!(objective = %objective.name, optimizer, epoch, batches, "Validation pass");
    Ok(ValidationSummary {
        optimizer: optimizer.to_string(),
        objective: objective.name.clone(),
        dataset: objective.dataset().to_string(),
        epoch,
        batches,
        loss: meters.loss_value(LossDescription::Mean),
        metrics: meters.metric_values(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectiveEvaluation {
    pub dataset: String,
    pub loss: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetEvaluation {
    pub dataset: String,
    pub batches: u64,
    pub examples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub split: String,
    pub datasets: Vec<DatasetEvaluation>,
    pub objectives: BTreeMap<String, ObjectiveEvaluation>,
    /// Objective names per structurally equal input configuration.
    pub groups: Vec<Vec<String>>,
    /// Datasets that do not serve the split.
    pub skipped: Vec<String>,
}

/// Evaluates every objective over `split`.
///
/// Each batch of a dataset is fetched and forwarded once, then scored by every
/// objective reading that dataset.
pub fn evaluate_model(
    graph: &dyn Graph,
    objectives: &NamedMap<Objective>,
    datasets: &NamedMap<Dataset>,
    split: &str,
    factory: &dyn ComponentFactory,
) -> TrainingResult<EvaluationReport> {
    let groups = group_by_input(objectives);
    let mut by_dataset: BTreeMap<&str, Vec<&InputGroup>> = BTreeMap::new();
    for group in &groups {
        by_dataset.entry(group.dataset()).or_default().push(group);
    }

    let mut report = EvaluationReport {
        split: split.to_string(),
        datasets: Vec::new(),
        objectives: BTreeMap::new(),
        groups: groups.iter().map(|g| g.objectives.clone()).collect(),
        skipped: Vec::new(),
    };

    for (name, dataset_groups) in by_dataset {
        let Some(dataset) = datasets.get(name) else {
            return Err(TrainingError::config(format!("no dataset binding for '{name}'")));
        };
        if !dataset.has_split(split) {
            debug!(dataset = name, split, "Dataset does not serve split, skipping evaluation");
            report.skipped.push(name.to_string());
            continue;
        }

        let mut scored: Vec<(&Objective, Meters)> = Vec::new();
        for group in &dataset_groups {
            for objective_name in &group.objectives {
                let Some(objective) = objectives.get(objective_name) else { continue };
                let mut metrics = Vec::with_capacity(objective.metrics.len());
                for metric in &objective.metrics {
                    let object = factory.metric(&metric.config.kind, &metric.config.options).map_err(|e| {
                        TrainingError::config(format!("objective '{objective_name}': cannot build metric: {e}"))
                    })?;
                    metrics.push((metric.name.clone(), object));
                }
                scored.push((objective, Meters::new(metrics)));
            }
        }

        let mut iterator = BatchIterator::open(dataset, split, 0)?;
        let mut batches = 0;
        let mut examples = 0;
        while let Some(batch) = iterator.next_batch()? {
            let outputs = graph.forward(&batch.inputs).map_err(|e| TrainingError::numeric("forward", e))?;
            for (objective, meters) in &mut scored {
                let objective: &Objective = objective;
                score(objective, &batch, prediction(objective, &outputs)?, meters)?;
            }
            batches += 1;
            examples += batch.size() as u64;
        }

        for (objective, meters) in scored {
            report.objectives.insert(
                objective.name.clone(),
                ObjectiveEvaluation {
                    dataset: name.to_string(),
                    loss: meters.loss_value(LossDescription::Mean),
                    metrics: meters.metric_values(),
                },
            );
        }
        report.datasets.push(DatasetEvaluation { dataset: name.to_string(), batches, examples });
    }

    Ok(report)
}
