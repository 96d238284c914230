//! Streaming regression metrics.

use crate::losses::check_same_shape;
use tessera_abstraction::{EngineResult, Metric, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduction {
    SquaredError,
    AbsoluteError,
    RootSquaredError,
}

/// Running mean of an elementwise error, with an optional square root on read.
#[derive(Debug, Clone)]
pub struct ErrorMetric {
    name: String,
    reduction: Reduction,
    sum: f64,
    count: u64,
}

impl ErrorMetric {
    fn new(name: impl Into<String>, reduction: Reduction) -> Self {
        Self { name: name.into(), reduction, sum: 0.0, count: 0 }
    }

    #[must_use]
    pub fn mse(name: impl Into<String>) -> Self {
        Self::new(name, Reduction::SquaredError)
    }

    #[must_use]
    pub fn mae(name: impl Into<String>) -> Self {
        Self::new(name, Reduction::AbsoluteError)
    }

    #[must_use]
    pub fn rmse(name: impl Into<String>) -> Self {
        Self::new(name, Reduction::RootSquaredError)
    }
}

impl Metric for ErrorMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self, target: &Tensor, prediction: &Tensor) -> EngineResult<()> {
        check_same_shape(target, prediction)?;
        for (t, p) in target.data().iter().zip(prediction.data()) {
            let d = f64::from(p - t);
            self.sum += match self.reduction {
                Reduction::AbsoluteError => d.abs(),
                Reduction::SquaredError | Reduction::RootSquaredError => d * d,
            };
        }
        self.count += target.len() as u64;
        Ok(())
    }

    fn result(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let mean = self.sum / self.count as f64;
        Some(match self.reduction {
            Reduction::RootSquaredError => mean.sqrt(),
            _ => mean,
        })
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}
