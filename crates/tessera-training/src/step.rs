//! Gradient step protocol.
//!
//! 1. compute gradients (pure)
//! 2. apply them through the active optimizer, at most once per batch
//! 3. update the optimizer's train meters for the active objective
//! 4. update trackers and emit telemetry when the cadence allows
//!
//! Failures in 1 and 2 abort the run. Failures in 3 and 4 are logged.

use crate::error::{TrainingError, TrainingResult};
use crate::objectives::Objective;
use crate::optimizers::{get_grads, ConfiguredOptimizer};
use crate::telemetry::Telemetry;
use crate::tracker::{update_loss_trackers, update_metrics_tracking, TrackerStore, TrackingContext};
use tessera_abstraction::{Batch, Graph};
use tracing::{trace, warn};

pub const TRAIN_SPLIT: &str = "train";

pub struct StepContext<'a> {
    pub graph: &'a mut dyn Graph,
    pub batch: &'a Batch,
    pub objective: &'a Objective,
    pub optimizer: &'a mut ConfiguredOptimizer,
    pub dataset: &'a str,
    pub tracker: &'a mut TrackerStore,
    pub telemetry: &'a mut Telemetry,
    /// 1-based index of this step across the run.
    pub global_step: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    pub examples: usize,
    /// Tracker values recorded by this step.
    pub tracked: usize,
}

pub fn run_gradient_step(ctx: StepContext<'_>) -> TrainingResult<StepOutcome> {
    let StepContext { graph, batch, objective, optimizer, dataset, tracker, telemetry, global_step } =
        ctx;

    let step = get_grads(&*graph, batch, objective.loss.as_ref(), objective.output_index, objective.target())
        .map_err(|e| TrainingError::numeric("compute_gradients", e))?;

    optimizer
        .apply_gradients(graph, &step.gradients)
        .map_err(|e| TrainingError::numeric("apply_gradients", e))?;
    optimizer.record_examples(batch.size());

    if let Some(meters) = optimizer.meters_mut(&objective.name, TRAIN_SPLIT) {
        meters.record_loss(step.total_loss);
        if let Some(target) = batch.target(objective.target()) {
            for (metric, error) in meters.update_metrics(target, &step.predictions) {
                warn!(objective = %objective.name, metric, error = %error, "Metric update failed");
            }
        }
    }

    let mut tracked = 0;
    if tracker.should_update(global_step) {
        if let Some(meters) = optimizer.meters(&objective.name, TRAIN_SPLIT) {
            let tracking = TrackingContext {
                optimizer: &optimizer.name,
                objective: &objective.name,
                dataset,
                split: TRAIN_SPLIT,
                step: optimizer.num_train_steps,
                global_step,
            };
            tracked += update_loss_trackers(
                tracker,
                &tracking,
                objective.loss_config.tracked_on(TRAIN_SPLIT),
                meters,
                telemetry,
            );
            tracked += update_metrics_tracking(
                tracker,
                &tracking,
                &objective.tracked_metrics(TRAIN_SPLIT),
                meters,
                telemetry,
            );
        }
    }

    trace!(
        optimizer = %optimizer.name,
        objective = %objective.name,
        global_step,
        loss = step.total_loss,
        "Step"
    );
    Ok(StepOutcome { loss: step.total_loss, examples: batch.size(), tracked })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamedMap, OptimizeConfig, PerformanceConfig};
    use crate::datasets::Dataset;
    use crate::objectives::build_objectives;
    use crate::optimizers::{build_optimizers, Optimizers};
    use crate::telemetry::MemoryTelemetrySink;
    use crate::testing::{records, toy_datasets};
    use crate::tracker::create_full_dict;
    use tessera_abstraction::{
        ComponentFactory, EngineError, EngineResult, GradientStep, Loss, Metric, Options, Parameter,
        Tensor, UpdateRule,
    };
    use tessera_reference::{LinearGraph, ReferenceFactory};

    const SPLITS: [&str; 2] = ["train", "val"];

    fn setup() -> (NamedMap<Objective>, Optimizers, NamedMap<Dataset>) {
        let perf: PerformanceConfig = serde_yaml::from_str(
            r"
objectives:
  a:
    loss: {type: mse, track: {train: [mean]}}
    metrics: [{type: mae, track: [train]}]
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: y}}
",
        )
        .unwrap();
        let datasets = toy_datasets();
        let objectives = build_objectives(&perf, &datasets, &SPLITS, &ReferenceFactory).unwrap();
        let config: OptimizeConfig =
            serde_yaml::from_str("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n").unwrap();
        let optimizers = build_optimizers(&config, &objectives, &SPLITS, &ReferenceFactory).unwrap();
        (objectives, optimizers, datasets)
    }

    fn batch(n: usize) -> Batch {
        Batch::from_records(&records(n)).unwrap()
    }

    #[test]
    fn test_step_updates_counters_meters_and_trackers() {
        let (objectives, mut optimizers, datasets) = setup();
        let mut tracker = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 1);
        let sink = MemoryTelemetrySink::new();
        let handle = sink.clone();
        let mut telemetry = Telemetry::new(Box::new(sink));
        let mut graph = LinearGraph::new(1, vec![("out".to_string(), 1)], 1).unwrap();
        let before = graph.parameters().to_vec();
        let batch = batch(3);

        let outcome = run_gradient_step(StepContext {
            graph: &mut graph,
            batch: &batch,
            objective: objectives.get("a").unwrap(),
            optimizer: optimizers.get_mut("o1").unwrap(),
            dataset: "toy",
            tracker: &mut tracker,
            telemetry: &mut telemetry,
            global_step: 1,
        })
        .unwrap();

        assert_eq!(outcome.examples, 3);
        assert_eq!(outcome.tracked, 2);
        assert_ne!(before, graph.parameters().to_vec());
        let optimizer = optimizers.get("o1").unwrap();
        assert_eq!(optimizer.num_train_steps, 3);
        let meters = optimizer.meters("a", "train").unwrap();
        assert_eq!(meters.loss_updates(), 1);
        assert!(meters.metric_value("mae").is_some());
        assert_eq!(handle.scalar_count("train/toy/a/o1/"), 2);
    }

    #[test]
    fn test_cadence_gates_tracking_only() {
        let (objectives, mut optimizers, datasets) = setup();
        let mut tracker = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 2);
        let mut telemetry = Telemetry::disabled();
        let mut graph = LinearGraph::new(1, vec![("out".to_string(), 1)], 1).unwrap();
        let batch = batch(2);

        let outcome = run_gradient_step(StepContext {
            graph: &mut graph,
            batch: &batch,
            objective: objectives.get("a").unwrap(),
            optimizer: optimizers.get_mut("o1").unwrap(),
            dataset: "toy",
            tracker: &mut tracker,
            telemetry: &mut telemetry,
            global_step: 1,
        })
        .unwrap();
        assert_eq!(outcome.tracked, 0);
        assert_eq!(optimizers.get("o1").unwrap().num_train_steps, 2);
    }

    /// Fails gradient computation and counts parameter writes.
    struct BrokenGraph {
        params: Vec<Parameter>,
    }

    impl Graph for BrokenGraph {
        fn output_names(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn forward(&self, inputs: &Tensor) -> EngineResult<Vec<Tensor>> {
            Ok(vec![Tensor::zeros(vec![inputs.rows(), 1])])
        }

        fn compute_gradients(
            &self,
            _inputs: &Tensor,
            _target: &Tensor,
            _loss: &dyn Loss,
            _output: Option<usize>,
        ) -> EngineResult<GradientStep> {
            Err(EngineError::Numeric("gradient is NaN".to_string()))
        }

        fn parameters(&self) -> &[Parameter] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.params
        }
    }

    #[test]
    fn test_gradient_failure_is_fatal_and_applies_nothing() {
        let (objectives, mut optimizers, datasets) = setup();
        let mut tracker = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 1);
        let mut telemetry = Telemetry::disabled();
        let mut graph = BrokenGraph { params: Vec::new() };
        let batch = batch(2);

        let err = run_gradient_step(StepContext {
            graph: &mut graph,
            batch: &batch,
            objective: objectives.get("a").unwrap(),
            optimizer: optimizers.get_mut("o1").unwrap(),
            dataset: "toy",
            tracker: &mut tracker,
            telemetry: &mut telemetry,
            global_step: 1,
        })
        .unwrap_err();
        assert!(matches!(err, TrainingError::Numeric { stage: "compute_gradients", .. }));
        assert_eq!(optimizers.get("o1").unwrap().num_train_steps, 0);
    }

    /// Rejects every update.
    struct RejectingRule;

    impl UpdateRule for RejectingRule {
        fn kind(&self) -> &str {
            "rejecting"
        }

        fn learning_rate(&self) -> f64 {
            0.1
        }

        fn apply(&mut self, _parameters: &mut [Parameter], _gradients: &[Tensor]) -> EngineResult<()> {
            Err(EngineError::Numeric("update produced NaN".to_string()))
        }
    }

    struct RejectingFactory;

    impl ComponentFactory for RejectingFactory {
        fn loss(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Loss>> {
            ReferenceFactory.loss(kind, options)
        }

        fn metric(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Metric>> {
            ReferenceFactory.metric(kind, options)
        }

        fn optimizer(&self, _kind: &str, _options: &Options) -> EngineResult<Box<dyn UpdateRule>> {
            Ok(Box::new(RejectingRule))
        }
    }

    #[test]
    fn test_update_failure_is_fatal_and_counts_nothing() {
        let (objectives, _, datasets) = setup();
        let config: OptimizeConfig =
            serde_yaml::from_str("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n").unwrap();
        let mut optimizers = build_optimizers(&config, &objectives, &SPLITS, &RejectingFactory).unwrap();
        let mut tracker = create_full_dict(&optimizers, &objectives, &datasets, &SPLITS, 1);
        let sink = MemoryTelemetrySink::new();
        let handle = sink.clone();
        let mut telemetry = Telemetry::new(Box::new(sink));
        let mut graph = LinearGraph::new(1, vec![("out".to_string(), 1)], 1).unwrap();
        let batch = batch(2);

        let err = run_gradient_step(StepContext {
            graph: &mut graph,
            batch: &batch,
            objective: objectives.get("a").unwrap(),
            optimizer: optimizers.get_mut("o1").unwrap(),
            dataset: "toy",
            tracker: &mut tracker,
            telemetry: &mut telemetry,
            global_step: 1,
        })
        .unwrap_err();

        assert!(matches!(err, TrainingError::Numeric { stage: "apply_gradients", .. }));
        let optimizer = optimizers.get("o1").unwrap();
        assert_eq!(optimizer.num_train_steps, 0);
        assert_eq!(optimizer.meters("a", "train").unwrap().loss_updates(), 0);
        assert!(handle.events().is_empty());
    }
}
