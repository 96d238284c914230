//! Scheduling controller.
//!
//! Decides which optimizer is active, which of its objectives is active, and
//! therefore which dataset feeds the next step. Completion is tracked per
//! (optimizer, objective) pair against the epoch budget; the run is done when
//! every pair has reached it.

use crate::config::{NamedMap, PolicyConfig, SelectionPolicy};
use crate::error::{TrainingError, TrainingResult};
use crate::objectives::Objective;
use crate::optimizers::Optimizers;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    SelectOptimizer,
    SelectObjective,
    FetchBatch,
    Step,
    AdvanceEpoch,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub optimizer: String,
    pub objective: String,
    pub dataset: String,
}

/// Emitted once per exhausted train split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochEvent {
    pub optimizer: String,
    pub objective: String,
    pub dataset: String,
    /// Train epochs completed by the objective on its dataset.
    pub epoch: u32,
    /// Epochs the optimizer has completed on the objective.
    pub optimizer_epochs: u32,
}

/// An (optimizer, objective) pair that stopped below the epoch budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompleteObjective {
    pub optimizer: String,
    pub objective: String,
    pub epochs: u32,
    pub budget: u32,
}

#[derive(Debug, Clone)]
struct Binding {
    optimizer: String,
    /// `(objective, dataset)` in binding order.
    objectives: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct Controller {
    bindings: Vec<Binding>,
    objective_policy: SelectionPolicy,
    optimizer_policy: SelectionPolicy,
    turn_steps: Option<u64>,
    budget: u32,
    state: ControllerState,
    current_optimizer: usize,
    /// Objective cursor per optimizer, kept across turns.
    cursors: Vec<usize>,
    /// Train epochs keyed by (objective, dataset, split).
    epochs: BTreeMap<(String, String, String), u32>,
    /// Completed epochs keyed by (optimizer, objective).
    completed: BTreeMap<(String, String), u32>,
    steps_in_turn: u64,
    rng: StdRng,
    history: Vec<Selection>,
}

/// Smallest candidate after `current`, wrapping to the first.
fn next_in_order(candidates: &[usize], current: usize) -> usize {
    candidates.iter().copied().find(|c| *c > current).unwrap_or(candidates[0])
}

fn draw(
    policy: &SelectionPolicy,
    rng: &mut StdRng,
    candidates: &[usize],
    name_of: impl Fn(usize) -> String,
) -> usize {
    match policy {
        SelectionPolicy::Sequential => candidates[0],
        SelectionPolicy::Random => candidates[rng.gen_range(0..candidates.len())],
        SelectionPolicy::Weighted(weights) => {
            let w: Vec<f64> = candidates
                .iter()
                .map(|c| weights.get(&name_of(*c)).copied().unwrap_or(1.0))
                .collect();
            let total: f64 = w.iter().sum();
            if total <= 0.0 {
                return candidates[rng.gen_range(0..candidates.len())];
            }
            let mut point = rng.gen_range(0.0..total);
            for (candidate, weight) in candidates.iter().zip(&w) {
                if point < *weight {
                    return *candidate;
                }
                point -= weight;
            }
            candidates[candidates.len() - 1]
        }
    }
}

impl Controller {
    /// Builds the controller and makes the initial selection.
    pub fn new(
        optimizers: &Optimizers,
        objectives: &NamedMap<Objective>,
        policy: &PolicyConfig,
        budget: u32,
        seed: u64,
    ) -> TrainingResult<Self> {
        if budget == 0 {
            return Err(TrainingError::config("epoch budget must be >= 1"));
        }
        if optimizers.is_empty() {
            return Err(TrainingError::config("no optimizers configured"));
        }

        let mut bindings = Vec::with_capacity(optimizers.len());
        for optimizer in optimizers.iter() {
            if optimizer.objectives.is_empty() {
                return Err(TrainingError::config(format!(
                    "optimizer '{}' is bound to zero objectives",
                    optimizer.name
                )));
            }
            let mut bound = Vec::with_capacity(optimizer.objectives.len());
            for name in &optimizer.objectives {
                let objective = objectives.get(name).ok_or_else(|| {
                    TrainingError::config(format!(
                        "optimizer '{}' is bound to unknown objective '{name}'",
                        optimizer.name
                    ))
                })?;
                bound.push((name.clone(), objective.dataset().to_string()));
            }
            bindings.push(Binding { optimizer: optimizer.name.clone(), objectives: bound });
        }

        let cursors = vec![0; bindings.len()];
        let mut controller = Self {
            bindings,
            objective_policy: policy.objective.clone(),
            optimizer_policy: policy.optimizer.clone(),
            turn_steps: policy.turn_steps,
            budget,
            state: ControllerState::SelectOptimizer,
            current_optimizer: 0,
            cursors,
            epochs: BTreeMap::new(),
            completed: BTreeMap::new(),
            steps_in_turn: 0,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
        };

        let all: Vec<usize> = (0..controller.bindings.len()).collect();
        let first = controller.pick_optimizer(&all);
        controller.current_optimizer = first;
        controller.state = ControllerState::SelectObjective;
        controller.cursors[first] = 0;
        controller.enter_fetch();
        Ok(controller)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_training(&self) -> bool {
        self.state != ControllerState::Done
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// The active selection, or `None` once done.
    pub fn current(&self) -> Option<Selection> {
        if !self.is_training() {
            return None;
        }
        let binding = &self.bindings[self.current_optimizer];
        let (objective, dataset) = &binding.objectives[self.cursors[self.current_optimizer]];
        Some(Selection {
            optimizer: binding.optimizer.clone(),
            objective: objective.clone(),
            dataset: dataset.clone(),
        })
    }

    /// Every selection made, in order. The first entry is the initial selection.
    pub fn selections(&self) -> &[Selection] {
        &self.history
    }

    /// Train epochs completed by `objective` on `dataset`.
    pub fn epochs(&self, objective: &str, dataset: &str) -> u32 {
        self.epochs
            .get(&(objective.to_string(), dataset.to_string(), "train".to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Epochs `optimizer` has completed on `objective`.
    pub fn completed(&self, optimizer: &str, objective: &str) -> u32 {
        self.completed
            .get(&(optimizer.to_string(), objective.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn remaining_objectives(&self, optimizer: usize) -> Vec<usize> {
        let binding = &self.bindings[optimizer];
        binding
            .objectives
            .iter()
            .enumerate()
            .filter(|(_, (objective, _))| self.completed(&binding.optimizer, objective) < self.budget)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn optimizers_with_work(&self) -> Vec<usize> {
        (0..self.bindings.len()).filter(|o| !self.remaining_objectives(*o).is_empty()).collect()
    }

    fn pick_optimizer(&mut self, candidates: &[usize]) -> usize {
        let names: Vec<String> = self.bindings.iter().map(|b| b.optimizer.clone()).collect();
        match self.optimizer_policy {
            SelectionPolicy::Sequential if self.history.is_empty() => candidates[0],
            SelectionPolicy::Sequential => next_in_order(candidates, self.current_optimizer),
            _ => draw(&self.optimizer_policy, &mut self.rng, candidates, |i| names[i].clone()),
        }
    }

    fn enter_fetch(&mut self) {
        let selection = self.current();
        if let Some(selection) = selection {
            if self.history.last() != Some(&selection) {
                debug!(
                    optimizer = %selection.optimizer,
                    objective = %selection.objective,
                    dataset = %selection.dataset,
                    "Selected"
                );
                self.history.push(selection);
            }
        }
        self.state = ControllerState::FetchBatch;
    }

    /// FETCH_BATCH -> STEP: a batch is available for the current selection.
    pub fn begin_step(&mut self) {
        if self.state == ControllerState::FetchBatch {
            self.state = ControllerState::Step;
        }
    }

    /// Completes a step. With a turn length configured, rotates to another
    /// optimizer that still has work. Returns whether the selection changed.
    pub fn record_step(&mut self) -> bool {
        if !self.is_training() {
            return false;
        }
        self.steps_in_turn += 1;
        let mut switched = false;
        if let Some(turn) = self.turn_steps {
            if self.steps_in_turn >= turn {
                self.steps_in_turn = 0;
                let others: Vec<usize> = self
                    .optimizers_with_work()
                    .into_iter()
                    .filter(|o| *o != self.current_optimizer)
                    .collect();
                if !others.is_empty() {
                    self.state = ControllerState::SelectOptimizer;
                    let next = self.pick_optimizer(&others);
                    self.activate_optimizer(next);
                    switched = true;
                }
            }
        }
        self.enter_fetch();
        switched
    }

    fn activate_optimizer(&mut self, optimizer: usize) {
        self.current_optimizer = optimizer;
        self.state = ControllerState::SelectObjective;
        let remaining = self.remaining_objectives(optimizer);
        if !remaining.contains(&self.cursors[optimizer]) {
            if let Some(first) = remaining.first() {
                self.cursors[optimizer] = *first;
            }
        }
    }

    /// FETCH_BATCH -> ADVANCE_EPOCH: the current train split is exhausted.
    pub fn advance_epoch(&mut self) -> Option<EpochEvent> {
        let selection = self.current()?;
        self.state = ControllerState::AdvanceEpoch;

        let epoch = self
            .epochs
            .entry((selection.objective.clone(), selection.dataset.clone(), "train".to_string()))
            .or_insert(0);
        *epoch += 1;
        let epoch = *epoch;

        let completed = self
            .completed
            .entry((selection.optimizer.clone(), selection.objective.clone()))
            .or_insert(0);
        *completed += 1;

        Some(EpochEvent {
            optimizer: selection.optimizer,
            objective: selection.objective,
            dataset: selection.dataset,
            epoch,
            optimizer_epochs: *completed,
        })
    }

    /// Moves the objective cursor per the objective policy. When the current
    /// optimizer has no work left, moves to the next optimizer that does, or
    /// finishes.
    pub fn maybe_advance_objective(&mut self) {
        if !self.is_training() {
            return;
        }
        self.state = ControllerState::SelectObjective;
        let current = self.current_optimizer;
        let remaining = self.remaining_objectives(current);

        if !remaining.is_empty() {
            let cursor = self.cursors[current];
            let names: Vec<String> =
                self.bindings[current].objectives.iter().map(|(o, _)| o.clone()).collect();
            let next = match &self.objective_policy {
                SelectionPolicy::Sequential if remaining.contains(&cursor) => cursor,
                SelectionPolicy::Sequential => next_in_order(&remaining, cursor),
                policy => draw(policy, &mut self.rng, &remaining, |i| names[i].clone()),
            };
            self.cursors[current] = next;
            self.enter_fetch();
            return;
        }

        let candidates = self.optimizers_with_work();
        if candidates.is_empty() {
            debug!("Every objective reached the epoch budget");
            self.state = ControllerState::Done;
            return;
        }
        self.state = ControllerState::SelectOptimizer;
        let next = self.pick_optimizer(&candidates);
        self.steps_in_turn = 0;
        self.activate_optimizer(next);
        self.enter_fetch();
    }

    /// Every (optimizer, objective) pair below the budget.
    pub fn incomplete(&self) -> Vec<IncompleteObjective> {
        let mut out = Vec::new();
        for binding in &self.bindings {
            for (objective, _) in &binding.objectives {
                let epochs = self.completed(&binding.optimizer, objective);
                if epochs < self.budget {
                    out.push(IncompleteObjective {
                        optimizer: binding.optimizer.clone(),
                        objective: objective.clone(),
                        epochs,
                        budget: self.budget,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizeConfig, PerformanceConfig};
    use crate::objectives::build_objectives;
    use crate::optimizers::build_optimizers;
    use crate::testing::toy_datasets;
    use tessera_reference::ReferenceFactory;

    const PERF: &str = r"
objectives:
  a:
    loss: {type: mse}
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: y}}
  b:
    loss: {type: mae}
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: w}}
  c:
    loss: {type: mse}
    in_config: {type: supervised, dataset: toy, options: {prediction: out, target: w}}
";

    fn controller(optimize: &str, budget: u32, seed: u64) -> Controller {
        let perf: PerformanceConfig = serde_yaml::from_str(PERF).unwrap();
        let datasets = toy_datasets();
        let objectives = build_objectives(&perf, &datasets, &["train"], &ReferenceFactory).unwrap();
        let config: OptimizeConfig = serde_yaml::from_str(optimize).unwrap();
        let optimizers = build_optimizers(&config, &objectives, &["train"], &ReferenceFactory).unwrap();
        Controller::new(&optimizers, &objectives, &config.policy, budget, seed).unwrap()
    }

    /// Drives the controller as if every epoch had `steps` batches.
    fn drive(c: &mut Controller, steps: usize) -> usize {
        let mut epochs = 0;
        while c.is_training() {
            for _ in 0..steps {
                c.begin_step();
                c.record_step();
            }
            c.advance_epoch();
            c.maybe_advance_objective();
            epochs += 1;
            assert!(epochs < 1000, "controller did not terminate");
        }
        epochs
    }

    #[test]
    fn test_initial_selection() {
        let c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [b, a]}\n",
            1,
            0,
        );
        assert_eq!(c.state(), ControllerState::FetchBatch);
        let s = c.current().unwrap();
        assert_eq!((s.optimizer.as_str(), s.objective.as_str(), s.dataset.as_str()), ("o1", "b", "toy"));
        assert_eq!(c.selections().len(), 1);
    }

    #[test]
    fn test_sequential_objectives_complete_in_order() {
        let mut c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\npolicy: {objective: sequential}\n",
            2,
            0,
        );
        let epochs = drive(&mut c, 3);
        assert_eq!(epochs, 6);
        let order: Vec<&str> = c.selections().iter().map(|s| s.objective.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(c.incomplete().is_empty());
        assert_eq!(c.state(), ControllerState::Done);
        assert!(c.current().is_none());
    }

    #[test]
    fn test_random_policy_is_reproducible() {
        let yaml = "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n";
        let mut first = controller(yaml, 3, 42);
        let mut second = controller(yaml, 3, 42);
        drive(&mut first, 1);
        drive(&mut second, 1);
        assert_eq!(first.selections(), second.selections());
        for objective in ["a", "b", "c"] {
            assert_eq!(first.completed("o1", objective), 3);
            assert_eq!(first.epochs(objective, "toy"), 3);
        }
    }

    #[test]
    fn test_optimizers_run_in_declaration_order() {
        let mut c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [a]}\n  o2: {type: sgd, options: {learning_rate: 0.1}, objectives: [b]}\n",
            2,
            1,
        );
        assert_eq!(drive(&mut c, 2), 4);
        let order: Vec<(&str, &str)> =
            c.selections().iter().map(|s| (s.optimizer.as_str(), s.objective.as_str())).collect();
        assert_eq!(order, vec![("o1", "a"), ("o2", "b")]);
    }

    #[test]
    fn test_shared_objective_counts_per_optimizer() {
        let mut c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [a]}\n  o2: {type: sgd, options: {learning_rate: 0.1}, objectives: [a]}\n",
            2,
            0,
        );
        assert_eq!(drive(&mut c, 1), 4);
        assert_eq!(c.epochs("a", "toy"), 4);
        assert_eq!(c.completed("o1", "a"), 2);
        assert_eq!(c.completed("o2", "a"), 2);
    }

    #[test]
    fn test_turn_steps_rotate_optimizers() {
        let mut c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [a]}\n  o2: {type: sgd, options: {learning_rate: 0.1}, objectives: [b]}\npolicy: {turn_steps: 2}\n",
            1,
            0,
        );
        assert!(!c.record_step());
        assert!(c.record_step());
        assert_eq!(c.current().unwrap().optimizer, "o2");
        c.record_step();
        assert!(c.record_step());
        assert_eq!(c.current().unwrap().optimizer, "o1");
    }

    #[test]
    fn test_incomplete_reports_pairs_below_budget() {
        let mut c = controller(
            "optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}, objectives: [a, b]}\npolicy: {objective: sequential}\n",
            1,
            0,
        );
        c.advance_epoch();
        c.maybe_advance_objective();
        let missing = c.incomplete();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].objective, "b");
        assert_eq!(missing[0].epochs, 0);
    }

    #[test]
    fn test_zero_budget_is_configuration_error() {
        let perf: PerformanceConfig = serde_yaml::from_str(PERF).unwrap();
        let datasets = toy_datasets();
        let objectives = build_objectives(&perf, &datasets, &["train"], &ReferenceFactory).unwrap();
        let config: OptimizeConfig =
            serde_yaml::from_str("optimizers:\n  o1: {type: sgd, options: {learning_rate: 0.1}}\n").unwrap();
        let optimizers = build_optimizers(&config, &objectives, &["train"], &ReferenceFactory).unwrap();
        let err = Controller::new(&optimizers, &objectives, &config.policy, 0, 0).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_weighted_draw_skips_zero_weights() {
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), 0.0);
        weights.insert("b".to_string(), 5.0);
        let policy = SelectionPolicy::Weighted(weights);
        let mut rng = StdRng::seed_from_u64(7);
        let names = ["a", "b"];
        for _ in 0..50 {
            assert_eq!(draw(&policy, &mut rng, &[0, 1], |i| names[i].to_string()), 1);
        }
    }
}
