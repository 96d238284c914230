//! Engine abstraction layer for Tessera.
//!
//! The training core never touches numerics directly. It drives a [`Graph`]
//! and the components produced by a [`ComponentFactory`] through the traits
//! in this crate, so any numerical backend can be plugged in.

mod tensor;

pub use tensor::{Batch, Record, Tensor};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Free-form component options as they appear in the run configuration.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Errors raised by an engine or one of its components.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// Tensor shapes did not line up.
    #[error("Shape Error: {0}")]
    Shape(String),

    /// A computation produced a non-finite or otherwise invalid value.
    #[error("Numeric Error: {0}")]
    Numeric(String),

    /// The engine has no implementation for the requested component.
    #[error("Unsupported {kind} '{name}'")]
    UnsupportedComponent {
        /// Component family, e.g. "loss" or "optimizer".
        kind: String,
        /// Requested implementation name.
        name: String,
    },

    /// Component options were missing or malformed.
    #[error("Invalid Options: {0}")]
    InvalidOptions(String),

    /// A record source failed to produce data.
    #[error("Data Error: {0}")]
    Data(String),

    /// Other unexpected errors.
    #[error("Other Engine Error: {0}")]
    Other(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A named trainable tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
}

/// Outcome of one differentiation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientStep {
    /// One gradient per trainable parameter, aligned with [`Graph::parameters`].
    pub gradients: Vec<Tensor>,
    /// Predictions of the output the loss was computed against.
    pub predictions: Tensor,
    /// Per-example loss values.
    pub losses: Vec<f32>,
    /// Mean of the per-example losses.
    pub total_loss: f32,
}

/// A differentiable loss function.
pub trait Loss: Send + Sync {
    /// Registry name of the loss, e.g. "mse".
    fn kind(&self) -> &str;

    /// Per-example loss values.
    fn value(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Vec<f32>>;

    /// Gradient of the batch-mean loss with respect to `prediction`.
    fn gradient(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Tensor>;
}

/// A streaming metric that accumulates state across batches.
pub trait Metric: Send {
    fn name(&self) -> &str;

    fn update(&mut self, target: &Tensor, prediction: &Tensor) -> EngineResult<()>;

    /// Current value, or `None` before any update.
    fn result(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// A stateful parameter update rule (SGD, Adam, ...).
pub trait UpdateRule: Send {
    fn kind(&self) -> &str;

    fn learning_rate(&self) -> f64;

    /// Applies one update. `gradients` is aligned with `parameters`.
    fn apply(&mut self, parameters: &mut [Parameter], gradients: &[Tensor]) -> EngineResult<()>;
}

/// A trainable model with one or more named outputs.
pub trait Graph: Send {
    /// Output names in declaration order. Output indices refer to this order.
    fn output_names(&self) -> Vec<String>;

    /// Runs the model forward, returning one tensor per output.
    fn forward(&self, inputs: &Tensor) -> EngineResult<Vec<Tensor>>;

    /// Computes loss gradients for every parameter.
    ///
    /// `output_index` selects which output the loss applies to. `None` is only
    /// valid for single-output graphs.
    fn compute_gradients(
        &self,
        inputs: &Tensor,
        target: &Tensor,
        loss: &dyn Loss,
        output_index: Option<usize>,
    ) -> EngineResult<GradientStep>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];
}

/// Builds concrete components from configuration names and options.
pub trait ComponentFactory: Send + Sync {
    fn loss(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Loss>>;

    fn metric(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Metric>>;

    fn optimizer(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn UpdateRule>>;
}

/// A finite stream of records for one split.
pub type RecordStream = Box<dyn Iterator<Item = EngineResult<Record>> + Send>;

/// A named dataset that can be reopened per split any number of times.
pub trait RecordSource: Send + Sync {
    /// Splits this source can serve, e.g. "train" and "val".
    fn split_names(&self) -> Vec<String>;

    /// Opens a fresh pass over `split`.
    fn open(&self, split: &str) -> EngineResult<RecordStream>;
}

/// Error returned by a telemetry sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Telemetry write failed: {0}")]
    Write(String),
}

/// Destination for scalar and histogram telemetry.
pub trait TelemetrySink: Send {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TelemetryError>;

    /// Records a distribution of values. Sinks that cannot plot histograms ignore it.
    fn histogram(&mut self, _tag: &str, _values: &[f32], _step: u64) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }
}
