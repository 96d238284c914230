//! Builds reference components from configuration names and options.

use crate::losses::{Huber, MeanAbsoluteError, MeanSquaredError};
use crate::metrics::ErrorMetric;
use crate::optimizers::{Adam, Sgd};
use tessera_abstraction::{
    ComponentFactory, EngineError, EngineResult, Loss, Metric, Options, UpdateRule,
};
use tracing::debug;

fn unsupported(kind: &str, name: &str) -> EngineError {
    EngineError::UnsupportedComponent { kind: kind.to_string(), name: name.to_string() }
}

/// Reads an optional numeric option.
pub fn option_f64(options: &Options, key: &str) -> EngineResult<Option<f64>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| EngineError::InvalidOptions(format!("'{key}' must be a number"))),
    }
}

fn learning_rate(options: &Options) -> EngineResult<f64> {
    let lr = option_f64(options, "learning_rate")?
        .ok_or_else(|| EngineError::InvalidOptions("'learning_rate' is required".to_string()))?;
    if !lr.is_finite() || lr <= 0.0 {
        return Err(EngineError::InvalidOptions(format!("learning_rate must be > 0, got {lr}")));
    }
    Ok(lr)
}

/// Factory for the losses, metrics and update rules in this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceFactory;

impl ComponentFactory for ReferenceFactory {
    fn loss(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Loss>> {
        match kind.to_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(Box::new(MeanSquaredError)),
            "mae" | "mean_absolute_error" => Ok(Box::new(MeanAbsoluteError)),
            "huber" => {
                let delta = option_f64(options, "delta")?.unwrap_or(1.0);
                Ok(Box::new(Huber::new(delta as f32)?))
            }
            _ => Err(unsupported("loss", kind)),
        }
    }

    fn metric(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn Metric>> {
        let name = options.get("name").and_then(|v| v.as_str()).unwrap_or(kind).to_string();
        match kind.to_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(Box::new(ErrorMetric::mse(name))),
            "mae" | "mean_absolute_error" => Ok(Box::new(ErrorMetric::mae(name))),
            "rmse" => Ok(Box::new(ErrorMetric::rmse(name))),
            _ => Err(unsupported("metric", kind)),
        }
    }

    fn optimizer(&self, kind: &str, options: &Options) -> EngineResult<Box<dyn UpdateRule>> {
        let lr = learning_rate(options)?;
        debug!(kind, learning_rate = lr, "Building update rule");
        match kind.to_lowercase().as_str() {
            "sgd" => {
                let momentum = option_f64(options, "momentum")?.unwrap_or(0.0);
                Ok(Box::new(Sgd::new(lr, momentum)))
            }
            "adam" => {
                let beta_1 = option_f64(options, "beta_1")?.unwrap_or(0.9);
                let beta_2 = option_f64(options, "beta_2")?.unwrap_or(0.999);
                let epsilon = option_f64(options, "epsilon")?.unwrap_or(1e-7);
                Ok(Box::new(Adam::new(lr, beta_1, beta_2, epsilon)))
            }
            _ => Err(unsupported("optimizer", kind)),
        }
    }
}
