//! Tessera Training
//!
//! Configuration-driven training orchestration:
//! - Loading and validating run configuration (`TrainConfig`)
//! - Static analysis of the declared model graph
//! - Objectives, optimizers and dataset bindings
//! - The scheduling controller and the gradient step protocol
//! - Tracking, telemetry, run layout and manifests (`Trainer`)

pub mod artifacts;
pub mod config;
pub mod controller;
pub mod datasets;
pub mod error;
pub mod evaluate;
pub mod graph;
pub mod layout;
pub mod logger;
pub mod objectives;
pub mod optimizers;
pub mod progress;
pub mod step;
pub mod telemetry;
pub mod tracker;
pub mod trainer;

#[cfg(test)]
mod testing;

/// Splits that carry meters and tracker entries.
pub const TARGET_SPLITS: [&str; 2] = ["train", "val"];

pub use artifacts::{make_artifact, sha256_file, write_manifest, ArtifactKind, RunArtifact, RunManifest};
pub use config::{NamedMap, TrainConfig};
pub use controller::{Controller, ControllerState, EpochEvent, IncompleteObjective, Selection};
pub use datasets::{
    convert_to_single_pass_iterator, get_datasets, get_next_batch, re_init_iter, BatchIterator, Dataset,
    SplitIterators,
};
pub use error::{TrainingError, TrainingResult};
pub use evaluate::{evaluate_model, validation_pass, EvaluationReport, ValidationSummary};
pub use graph::{DependencyGraph, GraphNode, NodeRole};
pub use layout::{RunId, RunLayout};
pub use logger::{Phase, RunLogger};
pub use objectives::{build_objectives, group_by_input, resolve_output_indices, InputGroup, Objective};
pub use optimizers::{build_optimizers, get_grads, ConfiguredOptimizer, Meters, Optimizers};
pub use progress::{ProgressEvent, ProgressSink, StdoutProgressSink};
pub use step::{run_gradient_step, StepContext, StepOutcome};
pub use telemetry::{JsonlTelemetrySink, MemoryTelemetrySink, Telemetry, TelemetryEvent};
pub use tracker::{create_full_dict, TrackerKey, TrackerKind, TrackerStore};
pub use trainer::{CancelHandle, FitReport, Trainer, TrainerStatus};
