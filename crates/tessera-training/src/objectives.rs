//! Objective registry: named loss/metric pairings bound to a dataset input.

use crate::config::{
    InConfig, LossConfig, LossDescription, MetricConfig, NamedMap, PerformanceConfig,
};
use crate::datasets::Dataset;
use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeMap;
use std::fmt;
use tessera_abstraction::{ComponentFactory, Loss};
use tracing::debug;

pub const SUPERVISED: &str = "supervised";

/// Loss configuration with tracking resolved for every target split.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLoss {
    pub kind: String,
    /// Split to tracked aggregates. Every target split has an entry, possibly empty.
    pub track: BTreeMap<String, Vec<LossDescription>>,
}

impl ResolvedLoss {
    pub fn tracked_on(&self, split: &str) -> &[LossDescription] {
        self.track.get(split).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub name: String,
    pub config: MetricConfig,
}

impl ResolvedMetric {
    pub fn tracked_on(&self, split: &str) -> bool {
        self.config.track.iter().any(|s| s == split)
    }
}

pub struct Objective {
    pub name: String,
    pub loss: Box<dyn Loss>,
    pub loss_config: ResolvedLoss,
    pub metrics: Vec<ResolvedMetric>,
    pub in_config: InConfig,
    /// Graph output slot, or `None` for a single-output graph.
    pub output_index: Option<usize>,
}

impl fmt::Debug for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Objective")
            .field("name", &self.name)
            .field("loss", &self.loss.kind())
            .field("metrics", &self.metrics)
            .field("in_config", &self.in_config)
            .field("output_index", &self.output_index)
            .finish()
    }
}

impl Objective {
    pub fn dataset(&self) -> &str {
        &self.in_config.dataset
    }

    pub fn target(&self) -> &str {
        &self.in_config.options.target
    }

    pub fn prediction(&self) -> &str {
        &self.in_config.options.prediction
    }

    /// Metric names tracked on `split`, in declaration order.
    pub fn tracked_metrics(&self, split: &str) -> Vec<String> {
        self.metrics.iter().filter(|m| m.tracked_on(split)).map(|m| m.name.clone()).collect()
    }
}

fn resolve_loss(config: &LossConfig, target_splits: &[&str]) -> ResolvedLoss {
    let track = target_splits
        .iter()
        .map(|split| ((*split).to_string(), config.track.get(*split).cloned().unwrap_or_default()))
        .collect();
    ResolvedLoss { kind: config.kind.clone(), track }
}

/// Builds one objective per declared entry.
///
/// Checks objective type, dataset reference and target label. Output slots
/// are resolved later by [`resolve_output_indices`].
pub fn build_objectives(
    performance: &PerformanceConfig,
    datasets: &NamedMap<Dataset>,
    target_splits: &[&str],
    factory: &dyn ComponentFactory,
) -> TrainingResult<NamedMap<Objective>> {
    let mut objectives = NamedMap::new();

    for (name, config) in performance.objectives.iter() {
        let in_config = &config.in_config;
        if in_config.kind != SUPERVISED {
            return Err(TrainingError::config(format!(
                "objective '{name}' has unsupported in_config type '{}' (only '{SUPERVISED}' is supported)",
                in_config.kind
            )));
        }

        let Some(dataset) = datasets.get(&in_config.dataset) else {
            return Err(TrainingError::UnknownDataset {
                objective: name.to_string(),
                dataset: in_config.dataset.clone(),
            });
        };

        let target = &in_config.options.target;
        if !dataset.config.labels().any(|(label, _)| label == target) {
            return Err(TrainingError::config(format!(
                "objective '{name}' targets '{target}', which is not a label of dataset '{}'",
                in_config.dataset
            )));
        }

        let loss = factory.loss(&config.loss.kind, &config.loss.options).map_err(|e| {
            TrainingError::config(format!("objective '{name}': cannot build loss: {e}"))
        })?;

        let mut metrics: Vec<ResolvedMetric> = Vec::with_capacity(config.metrics.len());
        for metric in &config.metrics {
            let metric_name = metric.display_name().to_string();
            if metrics.iter().any(|m| m.name == metric_name) {
                return Err(TrainingError::config(format!(
                    "objective '{name}' declares metric '{metric_name}' twice"
                )));
            }
            // Fail early on metrics the engine cannot build.
            factory.metric(&metric.kind, &metric.options).map_err(|e| {
                TrainingError::config(format!("objective '{name}': cannot build metric: {e}"))
            })?;
            metrics.push(ResolvedMetric { name: metric_name, config: metric.clone() });
        }

        debug!(objective = name, dataset = %in_config.dataset, "Built objective");
        objectives.insert(
            name,
            Objective {
                name: name.to_string(),
                loss,
                loss_config: resolve_loss(&config.loss, target_splits),
                metrics,
                in_config: in_config.clone(),
                output_index: None,
            },
        );
    }

    Ok(objectives)
}

/// Maps each objective's `prediction` onto a graph output slot.
pub fn resolve_output_indices(
    objectives: &mut NamedMap<Objective>,
    output_names: &[String],
) -> TrainingResult<()> {
    for objective in objectives.values_mut() {
        let position = output_names.iter().position(|o| o == objective.prediction());
        objective.output_index = match (output_names.len(), position) {
            (0, _) => {
                return Err(TrainingError::config("graph exposes no outputs"));
            }
            (1, _) => None,
            (_, Some(idx)) => Some(idx),
            (_, None) => {
                return Err(TrainingError::config(format!(
                    "objective '{}' predicts '{}', which is not a graph output {:?}",
                    objective.name,
                    objective.prediction(),
                    output_names
                )));
            }
        };
    }
    Ok(())
}

/// Objectives with structurally equal input configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputGroup {
    pub in_config: InConfig,
    pub objectives: Vec<String>,
}

impl InputGroup {
    pub fn dataset(&self) -> &str {
        &self.in_config.dataset
    }
}

/// Equivalence classes of objectives keyed by their `InConfig`, ordered by key.
pub fn group_by_input(objectives: &NamedMap<Objective>) -> Vec<InputGroup> {
    let mut groups: BTreeMap<&InConfig, Vec<String>> = BTreeMap::new();
    for objective in objectives.values() {
        groups.entry(&objective.in_config).or_default().push(objective.name.clone());
    }
    groups
        .into_iter()
        .map(|(in_config, objectives)| InputGroup { in_config: in_config.clone(), objectives })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::toy_datasets;
    use tessera_reference::ReferenceFactory;

    fn performance(yaml: &str) -> PerformanceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const TWO: &str = r"
objectives:
  a:
    loss: {type: mse, track: {train: [mean]}}
    metrics: [{type: mae, track: [val]}]
    in_config: {type: supervised, dataset: toy, options: {prediction: out_y, target: y}}
  b:
    loss: {type: mae}
    in_config: {type: supervised, dataset: toy, options: {prediction: out_w, target: w}}
  c:
    loss: {type: huber}
    in_config: {type: supervised, dataset: toy, options: {prediction: out_y, target: y}}
";

    #[test]
    fn test_one_objective_per_entry_with_defaulted_tracking() {
        let objectives =
            build_objectives(&performance(TWO), &toy_datasets(), &["train", "val"], &ReferenceFactory)
                .unwrap();
        assert_eq!(objectives.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        let a = objectives.get("a").unwrap();
        assert_eq!(a.loss_config.tracked_on("train"), &[LossDescription::Mean]);
        assert!(a.loss_config.tracked_on("val").is_empty());
        assert_eq!(a.tracked_metrics("val"), vec!["mae".to_string()]);
        assert!(a.tracked_metrics("train").is_empty());
        assert_eq!(objectives.get("b").unwrap().loss.kind(), "mae");
    }

    #[test]
    fn test_unknown_dataset() {
        let yaml = TWO.replace("dataset: toy, options: {prediction: out_w", "dataset: gone, options: {prediction: out_w");
        let err = build_objectives(&performance(&yaml), &toy_datasets(), &["train"], &ReferenceFactory)
            .unwrap_err();
        match err {
            TrainingError::UnknownDataset { objective, dataset } => {
                assert_eq!(objective, "b");
                assert_eq!(dataset, "gone");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_type_names_objective() {
        let yaml = TWO.replacen("type: supervised", "type: unsupervised", 1);
        let err = build_objectives(&performance(&yaml), &toy_datasets(), &["train"], &ReferenceFactory)
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_target_must_be_label() {
        let yaml = TWO.replacen("target: y}", "target: x}", 1);
        let err = build_objectives(&performance(&yaml), &toy_datasets(), &["train"], &ReferenceFactory)
            .unwrap_err();
        assert!(err.to_string().contains("not a label"));
    }

    #[test]
    fn test_unknown_loss_is_configuration_error() {
        let yaml = TWO.replace("type: huber", "type: hinge");
        let err = build_objectives(&performance(&yaml), &toy_datasets(), &["train"], &ReferenceFactory)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
    }

    #[test]
    fn test_output_indices() {
        let mut objectives =
            build_objectives(&performance(TWO), &toy_datasets(), &["train"], &ReferenceFactory)
                .unwrap();
        let outputs = vec!["out_w".to_string(), "out_y".to_string()];
        resolve_output_indices(&mut objectives, &outputs).unwrap();
        assert_eq!(objectives.get("a").unwrap().output_index, Some(1));
        assert_eq!(objectives.get("b").unwrap().output_index, Some(0));

        resolve_output_indices(&mut objectives, &["only".to_string()]).unwrap();
        assert_eq!(objectives.get("a").unwrap().output_index, None);

        let bad = vec!["out_w".to_string(), "other".to_string()];
        assert!(resolve_output_indices(&mut objectives, &bad).is_err());
    }

    #[test]
    fn test_grouping_by_structural_input() {
        let objectives =
            build_objectives(&performance(TWO), &toy_datasets(), &["train"], &ReferenceFactory)
                .unwrap();
        let groups = group_by_input(&objectives);
        assert_eq!(groups.len(), 2);
        // Ordered by key: prediction "out_w" sorts before "out_y".
        assert_eq!(groups[0].objectives, vec!["b".to_string()]);
        assert_eq!(groups[1].objectives, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(groups[1].dataset(), "toy");
    }
}
