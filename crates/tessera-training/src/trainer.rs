//! Run driver: setup, the training loop, and the final report.

use crate::artifacts::{RunArtifact, RunManifest, StepCounts};
use crate::config::{NamedMap, TrainConfig};
use crate::controller::{Controller, EpochEvent, IncompleteObjective, Selection};
use crate::datasets::{get_datasets, get_next_batch, re_init_iter, Dataset, SplitIterators};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluate::{evaluate_model, validation_pass, EvaluationReport, ValidationSummary, VAL_SPLIT};
use crate::graph::DependencyGraph;
use crate::layout::RunId;
use crate::logger::{Phase, RunLogger};
use crate::objectives::{build_objectives, resolve_output_indices, Objective};
use crate::optimizers::{build_optimizers, Optimizers};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::step::{run_gradient_step, StepContext, TRAIN_SPLIT};
use crate::telemetry::Telemetry;
use crate::tracker::{
    create_full_dict, update_loss_trackers, update_metrics_tracking, TrackerStore, TrackingContext,
};
use crate::TARGET_SPLITS;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_abstraction::{Batch, ComponentFactory, Graph, RecordSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerStatus {
    Idle,
    Running,
    Finished,
    /// Stopped with objectives below the epoch budget.
    Incomplete,
    Cancelled,
    Failed(String),
}

impl TrainerStatus {
    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Incomplete => "incomplete",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Requests cancellation. The loop honours it between fetching a batch and
/// stepping on it, never inside a step.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub run_id: RunId,
    pub status: TrainerStatus,
    pub train_steps: u64,
    /// Examples seen per optimizer.
    pub optimizer_steps: BTreeMap<String, u64>,
    pub epoch_events: Vec<EpochEvent>,
    pub validations: Vec<ValidationSummary>,
    pub incomplete: Vec<IncompleteObjective>,
}

pub struct Trainer {
    run_id: RunId,
    config: TrainConfig,
    graph: Box<dyn Graph>,
    factory: Arc<dyn ComponentFactory>,
    analysis: DependencyGraph,
    datasets: NamedMap<Dataset>,
    objectives: NamedMap<Objective>,
    optimizers: Optimizers,
    tracker: TrackerStore,
    controller: Controller,
    /// Train and val iterators per `(optimizer, objective)` binding, so every
    /// optimizer makes its own full pass before an epoch is credited to it.
    iterators: BTreeMap<(String, String), SplitIterators>,
    telemetry: Telemetry,
    progress: Option<Arc<dyn ProgressSink>>,
    logger: RunLogger,
    cancel: CancelHandle,
    status: TrainerStatus,
    train_steps: u64,
    epoch_events: Vec<EpochEvent>,
    validations: Vec<ValidationSummary>,
    started_at: Option<DateTime<Utc>>,
}

fn binding_key(selection: &Selection) -> (String, String) {
    (selection.optimizer.clone(), selection.objective.clone())
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .field("train_steps", &self.train_steps)
            .field("optimizers", &self.optimizers.names())
            .field("objectives", &self.objectives.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Validates the configuration and builds every run component.
    ///
    /// Nothing is trained here; any error is reported before a step runs.
    pub fn new(
        graph: Box<dyn Graph>,
        config: TrainConfig,
        sources: BTreeMap<String, Arc<dyn RecordSource>>,
        factory: Arc<dyn ComponentFactory>,
    ) -> TrainingResult<Self> {
        config.validate()?;
        let run_id = RunId::new();
        let logger = RunLogger::new(run_id.0.clone());
        let seed = config.meta.seed();

        let analysis = DependencyGraph::analyze(&config.data, &config.model)?;
        let outputs = graph.output_names();
        if outputs != analysis.output_names() {
            return Err(TrainingError::config(format!(
                "graph outputs {outputs:?} do not match model endpoints {:?}",
                analysis.output_names()
            )));
        }
        logger.debug(Phase::Graph, &format!("model outputs {outputs:?}"));

        let datasets = get_datasets(&sources, &config.data, &config.hyper_parameters, seed)?;
        let mut objectives =
            build_objectives(&config.performance, &datasets, &TARGET_SPLITS, factory.as_ref())?;
        resolve_output_indices(&mut objectives, &outputs)?;
        for objective in objectives.values() {
            let has_train = datasets.get(objective.dataset()).is_some_and(|d| d.has_split(TRAIN_SPLIT));
            if !has_train {
                return Err(TrainingError::config(format!(
                    "objective '{}' reads dataset '{}', which has no '{TRAIN_SPLIT}' split",
                    objective.name,
                    objective.dataset()
                )));
            }
        }

        let optimizers =
            build_optimizers(&config.optimize, &objectives, &TARGET_SPLITS, factory.as_ref())?;
        let tracker = create_full_dict(
            &optimizers,
            &objectives,
            &datasets,
            &TARGET_SPLITS,
            config.logging.track.tracker_steps,
        );
        let controller = Controller::new(
            &optimizers,
            &objectives,
            &config.optimize.policy,
            config.hyper_parameters.epochs,
            seed,
        )?;

        let mut iterators = BTreeMap::new();
        for optimizer in optimizers.iter() {
            for name in &optimizer.objectives {
                let Some(objective) = objectives.get(name) else { continue };
                let Some(dataset) = datasets.get(objective.dataset()) else { continue };
                iterators.insert((optimizer.name.clone(), name.clone()), SplitIterators::open(dataset)?);
            }
        }

        logger.info(
            Phase::Setup,
            &format!(
                "{} optimizers, {} objectives, {} datasets, {} tracker entries",
                optimizers.len(),
                objectives.len(),
                datasets.len(),
                tracker.len()
            ),
        );

        Ok(Self {
            run_id,
            config,
            graph,
            factory,
            analysis,
            datasets,
            objectives,
            optimizers,
            tracker,
            controller,
            iterators,
            telemetry: Telemetry::disabled(),
            progress: None,
            logger,
            cancel: CancelHandle::default(),
            status: TrainerStatus::Idle,
            train_steps: 0,
            epoch_events: Vec::new(),
            validations: Vec::new(),
            started_at: None,
        })
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.logger = RunLogger::new(run_id.0.clone());
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn status(&self) -> &TrainerStatus {
        &self.status
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn analysis(&self) -> &DependencyGraph {
        &self.analysis
    }

    pub fn datasets(&self) -> &NamedMap<Dataset> {
        &self.datasets
    }

    pub fn objectives(&self) -> &NamedMap<Objective> {
        &self.objectives
    }

    pub fn optimizers(&self) -> &Optimizers {
        &self.optimizers
    }

    pub fn tracker(&self) -> &TrackerStore {
        &self.tracker
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn graph(&self) -> &dyn Graph {
        self.graph.as_ref()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.on_event(event);
        }
    }

    /// Trains until every objective reaches the epoch budget or the run is
    /// cancelled. Configuration, numeric and dataset errors abort the run.
    pub fn fit(&mut self) -> TrainingResult<FitReport> {
        let span = self.logger.span(Phase::Train);
        let _guard = span.enter();
        self.status = TrainerStatus::Running;
        self.started_at = Some(Utc::now());
        self.emit(ProgressEvent::Started {
            run_id: self.run_id.0.clone(),
            optimizers: self.optimizers.len(),
            objectives: self.objectives.len(),
            budget: self.controller.budget(),
        });

        if let Err(e) = self.train_loop() {
            self.status = TrainerStatus::Failed(e.to_string());
            self.telemetry.flush();
            self.logger.warn(Phase::Train, &format!("run aborted: {e}"));
            self.emit(ProgressEvent::Finished {
                run_id: self.run_id.0.clone(),
                status: self.status.label().to_string(),
                global_step: self.train_steps,
            });
            return Err(e);
        }

        let incomplete = self.controller.incomplete();
        if self.status != TrainerStatus::Cancelled {
            self.status = if incomplete.is_empty() {
                TrainerStatus::Finished
            } else {
                TrainerStatus::Incomplete
            };
        }
        for missing in &incomplete {
            self.logger.warn(
                Phase::Train,
                &format!(
                    "{}/{} stopped at {} of {} epochs",
                    missing.optimizer, missing.objective, missing.epochs, missing.budget
                ),
            );
        }
        self.telemetry.flush();
        self.logger.info(
            Phase::Train,
            &format!("{} after {} steps", self.status.label(), self.train_steps),
        );
        self.emit(ProgressEvent::Finished {
            run_id: self.run_id.0.clone(),
            status: self.status.label().to_string(),
            global_step: self.train_steps,
        });

        Ok(FitReport {
            run_id: self.run_id.clone(),
            status: self.status.clone(),
            train_steps: self.train_steps,
            optimizer_steps: self.optimizer_steps(),
            epoch_events: self.epoch_events.clone(),
            validations: self.validations.clone(),
            incomplete,
        })
    }

    fn optimizer_steps(&self) -> BTreeMap<String, u64> {
        self.optimizers.iter().map(|o| (o.name.clone(), o.num_train_steps)).collect()
    }

    fn train_loop(&mut self) -> TrainingResult<()> {
        let mut announced: Option<Selection> = None;

        while self.controller.is_training() {
            let Some(selection) = self.controller.current() else { break };
            if announced.as_ref() != Some(&selection) {
                self.emit(ProgressEvent::SelectionSwitched {
                    run_id: self.run_id.0.clone(),
                    optimizer: selection.optimizer.clone(),
                    objective: selection.objective.clone(),
                });
                announced = Some(selection.clone());
            }

            let iterator = self
                .iterators
                .get_mut(&binding_key(&selection))
                .and_then(|its| its.get_mut(TRAIN_SPLIT))
                .ok_or_else(|| {
                    TrainingError::Dataset(format!(
                        "no train iterator for {}/{}",
                        selection.optimizer, selection.objective
                    ))
                })?;

            match get_next_batch(iterator)? {
                Some(batch) => {
                    if self.cancel.is_cancelled() {
                        self.logger.info(Phase::Train, "cancellation requested");
                        self.status = TrainerStatus::Cancelled;
                        return Ok(());
                    }
                    self.controller.begin_step();
                    self.step(&selection, &batch)?;
                    self.controller.record_step();
                }
                None => self.finish_epoch(&selection)?,
            }
        }
        Ok(())
    }

    fn step(&mut self, selection: &Selection, batch: &Batch) -> TrainingResult<()> {
        let global_step = self.train_steps + 1;
        let objective = self.objectives.get(&selection.objective).ok_or_else(|| {
            TrainingError::config(format!("unknown objective '{}'", selection.objective))
        })?;
        let optimizer = self.optimizers.get_mut(&selection.optimizer).ok_or_else(|| {
            TrainingError::config(format!("unknown optimizer '{}'", selection.optimizer))
        })?;

        run_gradient_step(StepContext {
            graph: self.graph.as_mut(),
            batch,
            objective,
            optimizer,
            dataset: &selection.dataset,
            tracker: &mut self.tracker,
            telemetry: &mut self.telemetry,
            global_step,
        })?;
        self.train_steps = global_step;

        let param_steps = self.config.logging.track.params.param_steps;
        if param_steps > 0 && global_step % param_steps == 0 {
            for parameter in self.graph.parameters() {
                self.telemetry.histogram(
                    &format!("params/{}", parameter.name),
                    parameter.value.data(),
                    global_step,
                );
            }
        }
        Ok(())
    }

    /// ADVANCE_EPOCH: count the epoch, validate the same objective, reset its
    /// train meters, restart its train split, then let the controller move on.
    fn finish_epoch(&mut self, selection: &Selection) -> TrainingResult<()> {
        let Some(event) = self.controller.advance_epoch() else { return Ok(()) };
        self.logger.debug(
            Phase::Train,
            &format!("{}/{} finished epoch {}", event.optimizer, event.objective, event.epoch),
        );
        self.emit(ProgressEvent::EpochCompleted {
            run_id: self.run_id.0.clone(),
            optimizer: event.optimizer.clone(),
            objective: event.objective.clone(),
            epoch: event.epoch,
            global_step: self.train_steps,
        });
        let epoch = event.epoch;
        self.epoch_events.push(event);

        self.validate(selection, epoch)?;

        if let Some(meters) = self
            .optimizers
            .get_mut(&selection.optimizer)
            .and_then(|o| o.meters_mut(&selection.objective, TRAIN_SPLIT))
        {
            meters.reset();
        }

        let dataset = self.datasets.get(&selection.dataset).ok_or_else(|| {
            TrainingError::config(format!("unknown dataset '{}'", selection.dataset))
        })?;
        if let Some(iterators) = self.iterators.get_mut(&binding_key(selection)) {
            re_init_iter(dataset, iterators, TRAIN_SPLIT)?;
        }

        self.controller.maybe_advance_objective();
        Ok(())
    }

    fn validate(&mut self, selection: &Selection, epoch: u32) -> TrainingResult<()> {
        let Some(dataset) = self.datasets.get(&selection.dataset) else { return Ok(()) };
        if !dataset.has_split(VAL_SPLIT) {
            return Ok(());
        }
        let (Some(objective), Some(optimizer), Some(iterators)) = (
            self.objectives.get(&selection.objective),
            self.optimizers.get_mut(&selection.optimizer),
            self.iterators.get_mut(&binding_key(selection)),
        ) else {
            return Ok(());
        };
        let (Some(meters), Some(iterator)) =
            (optimizer.meters_mut(&objective.name, VAL_SPLIT), iterators.get_mut(VAL_SPLIT))
        else {
            return Ok(());
        };

        let eval_span = self.logger.span(Phase::Eval);
        let _guard = eval_span.enter();
        let summary = validation_pass(self.graph.as_ref(), objective, &selection.optimizer, epoch, meters, iterator)?;
        re_init_iter(dataset, iterators, VAL_SPLIT)?;

        if self.tracker.cadence() > 0 {
            if let Some(optimizer) = self.optimizers.get(&selection.optimizer) {
                if let Some(meters) = optimizer.meters(&objective.name, VAL_SPLIT) {
                    let ctx = TrackingContext {
                        optimizer: &optimizer.name,
                        objective: &objective.name,
                        dataset: &selection.dataset,
                        split: VAL_SPLIT,
                        step: optimizer.num_train_steps,
                        global_step: self.train_steps,
                    };
                    update_loss_trackers(
                        &mut self.tracker,
                        &ctx,
                        objective.loss_config.tracked_on(VAL_SPLIT),
                        meters,
                        &mut self.telemetry,
                    );
                    update_metrics_tracking(
                        &mut self.tracker,
                        &ctx,
                        &objective.tracked_metrics(VAL_SPLIT),
                        meters,
                        &mut self.telemetry,
                    );
                }
            }
        }

        self.emit(ProgressEvent::ValidationCompleted {
            run_id: self.run_id.0.clone(),
            objective: summary.objective.clone(),
            epoch,
            loss: summary.loss,
        });
        self.validations.push(summary);
        Ok(())
    }

    /// Evaluates every objective over `split`, sharing forwarded batches
    /// between objectives of the same dataset.
    pub fn evaluate(&self, split: &str) -> TrainingResult<EvaluationReport> {
        let span = self.logger.span(Phase::Eval);
        let _guard = span.enter();
        evaluate_model(self.graph.as_ref(), &self.objectives, &self.datasets, split, self.factory.as_ref())
    }

    pub fn manifest(
        &self,
        report: &FitReport,
        evaluation: Option<EvaluationReport>,
        artifacts: Vec<RunArtifact>,
    ) -> TrainingResult<RunManifest> {
        Ok(RunManifest {
            run_id: self.run_id.clone(),
            started_at: self.started_at.unwrap_or_else(Utc::now),
            finished_at: Utc::now(),
            config_fingerprint: self.config.fingerprint()?,
            status: report.status.label().to_string(),
            steps: StepCounts {
                train_steps: report.train_steps,
                optimizer_steps: report.optimizer_steps.clone(),
            },
            epoch_events: report.epoch_events.clone(),
            validations: report.validations.clone(),
            incomplete: report.incomplete.clone(),
            trackers: self.tracker.snapshot(),
            evaluation,
            artifacts,
        })
    }
}
