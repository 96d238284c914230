//! Optimizer set: named update rules bound to objectives.

use crate::config::{LossDescription, NamedMap, OptimizeConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::objectives::Objective;
use std::collections::BTreeMap;
use std::fmt;
use tessera_abstraction::{
    Batch, ComponentFactory, EngineError, EngineResult, GradientStep, Graph, Loss, Metric,
    Tensor, UpdateRule,
};
use tracing::debug;

/// Incremental mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Loss aggregates and metric objects for one objective on one split.
#[derive(Default)]
pub struct Meters {
    loss_mean: RunningMean,
    last_loss: Option<f64>,
    metrics: Vec<(String, Box<dyn Metric>)>,
}

impl fmt::Debug for Meters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meters")
            .field("loss_mean", &self.loss_mean)
            .field("last_loss", &self.last_loss)
            .field("metrics", &self.metrics.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl Meters {
    #[must_use]
    pub fn new(metrics: Vec<(String, Box<dyn Metric>)>) -> Self {
        Self { loss_mean: RunningMean::default(), last_loss: None, metrics }
    }

    pub fn record_loss(&mut self, loss: f32) {
        let loss = f64::from(loss);
        self.loss_mean.update(loss);
        self.last_loss = Some(loss);
    }

    /// Updates every metric. Failing metrics are returned, the rest still update.
    pub fn update_metrics(&mut self, target: &Tensor, prediction: &Tensor) -> Vec<(String, EngineError)> {
        let mut failures = Vec::new();
        for (name, metric) in &mut self.metrics {
            if let Err(e) = metric.update(target, prediction) {
                failures.push((name.clone(), e));
            }
        }
        failures
    }

    pub fn loss_value(&self, description: LossDescription) -> Option<f64> {
        match description {
            LossDescription::Mean => self.loss_mean.mean(),
            LossDescription::Last => self.last_loss,
        }
    }

    pub fn metric_value(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|(n, _)| n == name).and_then(|(_, m)| m.result())
    }

    pub fn metric_values(&self) -> BTreeMap<String, f64> {
        self.metrics.iter().filter_map(|(n, m)| m.result().map(|v| (n.clone(), v))).collect()
    }

    pub fn loss_updates(&self) -> u64 {
        self.loss_mean.count()
    }

    pub fn reset(&mut self) {
        self.loss_mean.reset();
        self.last_loss = None;
        for (_, metric) in &mut self.metrics {
            metric.reset();
        }
    }
}

pub struct ConfiguredOptimizer {
    pub name: String,
    rule: Box<dyn UpdateRule>,
    /// Bound objective names in binding order.
    pub objectives: Vec<String>,
    /// Examples seen. Grows by the batch size after every applied update.
    pub num_train_steps: u64,
    /// Number of applied updates.
    pub applications: u64,
    meters: BTreeMap<String, BTreeMap<String, Meters>>,
}

impl fmt::Debug for ConfiguredOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredOptimizer")
            .field("name", &self.name)
            .field("rule", &self.rule.kind())
            .field("objectives", &self.objectives)
            .field("num_train_steps", &self.num_train_steps)
            .finish_non_exhaustive()
    }
}

impl ConfiguredOptimizer {
    pub fn kind(&self) -> &str {
        self.rule.kind()
    }

    pub fn learning_rate(&self) -> f64 {
        self.rule.learning_rate()
    }

    pub fn is_bound_to(&self, objective: &str) -> bool {
        self.objectives.iter().any(|o| o == objective)
    }

    /// Applies gradients to the graph's parameters through the update rule.
    pub fn apply_gradients(&mut self, graph: &mut dyn Graph, gradients: &[Tensor]) -> EngineResult<()> {
        self.rule.apply(graph.parameters_mut(), gradients)
    }

    pub fn record_examples(&mut self, count: usize) {
        self.num_train_steps += count as u64;
        self.applications += 1;
    }

    pub fn meters(&self, objective: &str, split: &str) -> Option<&Meters> {
        self.meters.get(objective).and_then(|s| s.get(split))
    }

    pub fn meters_mut(&mut self, objective: &str, split: &str) -> Option<&mut Meters> {
        self.meters.get_mut(objective).and_then(|s| s.get_mut(split))
    }
}

/// Named optimizers in declaration order.
#[derive(Debug, Default)]
pub struct Optimizers {
    inner: NamedMap<ConfiguredOptimizer>,
}

impl Optimizers {
    pub fn get(&self, name: &str) -> Option<&ConfiguredOptimizer> {
        self.inner.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ConfiguredOptimizer> {
        self.inner.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.names().map(str::to_string).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfiguredOptimizer> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Every objective bound by at least one optimizer.
    pub fn bound_objectives(&self) -> Vec<String> {
        let mut bound: Vec<String> = Vec::new();
        for optimizer in self.inner.values() {
            for objective in &optimizer.objectives {
                if !bound.contains(objective) {
                    bound.push(objective.clone());
                }
            }
        }
        bound
    }
}

fn checked_learning_rate(name: &str, options: &tessera_abstraction::Options) -> TrainingResult<f64> {
    let Some(raw) = options.get("learning_rate") else {
        return Err(TrainingError::config(format!(
            "optimizer '{name}' requires options.learning_rate"
        )));
    };
    match raw.as_f64() {
        Some(lr) if lr.is_finite() && lr > 0.0 => Ok(lr),
        _ => Err(TrainingError::config(format!(
            "optimizer '{name}' learning_rate must be a positive number, got {raw}"
        ))),
    }
}

/// Resolves optimizer bindings and builds update rules and meters.
///
/// An omitted binding binds every objective. An explicit empty binding, an
/// unknown objective name or a bad learning rate is a configuration error.
pub fn build_optimizers(
    optimize: &OptimizeConfig,
    objectives: &NamedMap<Objective>,
    target_splits: &[&str],
    factory: &dyn ComponentFactory,
) -> TrainingResult<Optimizers> {
    let mut built = NamedMap::new();

    for (name, config) in optimize.optimizers.iter() {
        let bound: Vec<String> = match &config.objectives {
            None => objectives.names().map(str::to_string).collect(),
            Some(list) if list.is_empty() => {
                return Err(TrainingError::config(format!(
                    "optimizer '{name}' is bound to zero objectives"
                )));
            }
            Some(list) => {
                for (idx, objective) in list.iter().enumerate() {
                    if !objectives.contains(objective) {
                        return Err(TrainingError::config(format!(
                            "optimizer '{name}' is bound to unknown objective '{objective}'"
                        )));
                    }
                    if list[..idx].contains(objective) {
                        return Err(TrainingError::config(format!(
                            "optimizer '{name}' binds objective '{objective}' twice"
                        )));
                    }
                }
                list.clone()
            }
        };
        if bound.is_empty() {
            return Err(TrainingError::config(format!(
                "optimizer '{name}' is bound to zero objectives"
            )));
        }

        checked_learning_rate(name, &config.options)?;
        let rule = factory.optimizer(&config.kind, &config.options).map_err(|e| {
            TrainingError::config(format!("optimizer '{name}': cannot build update rule: {e}"))
        })?;

        let mut meters = BTreeMap::new();
        for objective_name in &bound {
            let Some(objective) = objectives.get(objective_name) else { continue };
            let mut per_split = BTreeMap::new();
            for split in target_splits {
                let mut metrics = Vec::with_capacity(objective.metrics.len());
                for metric in &objective.metrics {
                    let object = factory.metric(&metric.config.kind, &metric.config.options).map_err(|e| {
                        TrainingError::config(format!(
                            "optimizer '{name}', objective '{objective_name}': cannot build metric: {e}"
                        ))
                    })?;
                    metrics.push((metric.name.clone(), object));
                }
                per_split.insert((*split).to_string(), Meters::new(metrics));
            }
            meters.insert(objective_name.clone(), per_split);
        }

        debug!(optimizer = name, kind = %config.kind, objectives = ?bound, "Built optimizer");
        built.insert(
            name,
            ConfiguredOptimizer {
                name: name.to_string(),
                rule,
                objectives: bound,
                num_train_steps: 0,
                applications: 0,
                meters,
            },
        );
    }

    Ok(Optimizers { inner: built })
}

/// Computes gradients for one objective on one batch. Pure with respect to
/// training state.
pub fn get_grads(
    graph: &dyn Graph,
    batch: &Batch,
    loss: &dyn Loss,
    output_index: Option<usize>,
    target: &str,
) -> EngineResult<GradientStep> {
    let labels = batch
        .target(target)
        .ok_or_else(|| EngineError::Data(format!("batch has no label '{target}'")))?;
    graph.compute_gradients(&batch.inputs, labels, loss, output_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceConfig;
    use crate::objectives::build_objectives;
    use tessera_reference::{LinearGraph, ReferenceFactory};

    fn objectives() -> NamedMap<Objective> {
        let perf: PerformanceConfig = serde_yaml::from_str(
            r"
objectives:
  a:
    loss: {type: mse}
    metrics: [{type: mae}, {type: rmse, name: root}]
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: y}}
  b:
    loss: {type: mae}
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: y}}
",
        )
        .unwrap();
        let datasets = crate::testing::toy_datasets();
        build_objectives(&perf, &datasets, &["train", "val"], &ReferenceFactory).unwrap()
    }

    fn optimize(yaml: &str) -> OptimizeConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_default_binding_is_all_objectives() {
        let config = optimize(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n  o2: {type: adam, options: {learning_rate: 0.01}}\n",
        );
        let opts =
            build_optimizers(&config, &objectives(), &["train", "val"], &ReferenceFactory).unwrap();
        assert_eq!(opts.names(), vec!["o1".to_string(), "o2".to_string()]);
        for opt in opts.iter() {
            assert_eq!(opt.objectives, vec!["a".to_string(), "b".to_string()]);
            assert_eq!(opt.num_train_steps, 0);
        }
        assert_eq!(opts.bound_objectives(), vec!["a".to_string(), "b".to_string()]);
        let meters = opts.get("o1").unwrap().meters("a", "val").unwrap();
        assert!(meters.metric_value("root").is_none());
    }

    #[test]
    fn test_unknown_binding_is_configuration_error() {
        let config = optimize(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [ghost]}\n",
        );
        let err = build_optimizers(&config, &objectives(), &["train"], &ReferenceFactory).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_empty_binding_is_rejected() {
        let config =
            optimize("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: []}\n");
        assert!(build_optimizers(&config, &objectives(), &["train"], &ReferenceFactory).is_err());
    }

    #[test]
    fn test_learning_rate_is_required() {
        for options in ["{}", "{learning_rate: 0}", "{learning_rate: fast}"] {
            let config = optimize(&format!("optimizers:\n  o1: {{type: sgd, options: {options}}}\n"));
            let err =
                build_optimizers(&config, &objectives(), &["train"], &ReferenceFactory).unwrap_err();
            assert!(err.is_configuration(), "{options} should be rejected");
        }
    }

    #[test]
    fn test_step_counter_grows_by_batch_size() {
        let config = optimize("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n");
        let mut opts =
            build_optimizers(&config, &objectives(), &["train"], &ReferenceFactory).unwrap();
        let opt = opts.get_mut("o1").unwrap();
        opt.record_examples(4);
        opt.record_examples(3);
        assert_eq!(opt.num_train_steps, 7);
        assert_eq!(opt.applications, 2);
    }

    #[test]
    fn test_get_grads_and_apply() {
        let objs = objectives();
        let a = objs.get("a").unwrap();
        let mut graph = LinearGraph::new(1, vec![("out".to_string(), 1)], 5).unwrap();
        let batch = Batch::from_records(&[
            tessera_abstraction::Record::new(vec![1.0]).with_target("y", vec![3.0]),
            tessera_abstraction::Record::new(vec![2.0]).with_target("y", vec![5.0]),
        ])
        .unwrap();
        let step = get_grads(&graph, &batch, a.loss.as_ref(), a.output_index, a.target()).unwrap();
        assert_eq!(step.losses.len(), 2);

        let config = optimize("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n");
        let mut opts = build_optimizers(&config, &objs, &["train"], &ReferenceFactory).unwrap();
        let before = graph.parameters().to_vec();
        opts.get_mut("o1").unwrap().apply_gradients(&mut graph, &step.gradients).unwrap();
        assert_ne!(before, graph.parameters().to_vec());

        assert!(get_grads(&graph, &batch, a.loss.as_ref(), None, "missing").is_err());
    }

    #[test]
    fn test_meters_track_mean_and_last() {
        let mut meters = Meters::new(Vec::new());
        assert_eq!(meters.loss_value(LossDescription::Mean), None);
        meters.record_loss(1.0);
        meters.record_loss(3.0);
        assert_eq!(meters.loss_value(LossDescription::Mean), Some(2.0));
        assert_eq!(meters.loss_value(LossDescription::Last), Some(3.0));
        meters.reset();
        assert_eq!(meters.loss_updates(), 0);
    }
}
