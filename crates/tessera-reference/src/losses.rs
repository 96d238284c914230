//! Elementwise regression losses.

use tessera_abstraction::{EngineError, EngineResult, Loss, Tensor};

pub(crate) fn check_same_shape(target: &Tensor, prediction: &Tensor) -> EngineResult<()> {
    if target.shape() != prediction.shape() {
        return Err(EngineError::Shape(format!(
            "target shape {:?} does not match prediction shape {:?}",
            target.shape(),
            prediction.shape()
        )));
    }
    if target.rows() == 0 {
        return Err(EngineError::Shape("empty batch".to_string()));
    }
    Ok(())
}

/// Reduces an elementwise term to per-example means.
fn per_example(target: &Tensor, prediction: &Tensor, term: impl Fn(f32) -> f32) -> Vec<f32> {
    let width = target.row_width().max(1) as f32;
    (0..target.rows())
        .map(|row| {
            let sum: f32 = target
                .row(row)
                .iter()
                .zip(prediction.row(row))
                .map(|(t, p)| term(p - t))
                .sum();
            sum / width
        })
        .collect()
}

/// Gradient of the batch mean of per-example means.
fn mean_gradient(
    target: &Tensor,
    prediction: &Tensor,
    derivative: impl Fn(f32) -> f32,
) -> EngineResult<Tensor> {
    let scale = (target.rows() * target.row_width().max(1)) as f32;
    let data = target
        .data()
        .iter()
        .zip(prediction.data())
        .map(|(t, p)| derivative(p - t) / scale)
        .collect();
    Tensor::new(prediction.shape().to_vec(), data)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn kind(&self) -> &str {
        "mse"
    }

    fn value(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Vec<f32>> {
        check_same_shape(target, prediction)?;
        Ok(per_example(target, prediction, |d| d * d))
    }

    fn gradient(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Tensor> {
        check_same_shape(target, prediction)?;
        mean_gradient(target, prediction, |d| 2.0 * d)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MeanAbsoluteError;

impl Loss for MeanAbsoluteError {
    fn kind(&self) -> &str {
        "mae"
    }

    fn value(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Vec<f32>> {
        check_same_shape(target, prediction)?;
        Ok(per_example(target, prediction, f32::abs))
    }

    fn gradient(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Tensor> {
        check_same_shape(target, prediction)?;
        mean_gradient(target, prediction, |d| if d == 0.0 { 0.0 } else { d.signum() })
    }
}

/// Quadratic inside `delta`, linear outside.
#[derive(Debug, Clone, Copy)]
pub struct Huber {
    delta: f32,
}

impl Huber {
    pub fn new(delta: f32) -> EngineResult<Self> {
        if !delta.is_finite() || delta <= 0.0 {
            return Err(EngineError::InvalidOptions(format!(
                "huber delta must be > 0, got {delta}"
            )));
        }
        Ok(Self { delta })
    }
}

impl Default for Huber {
    fn default() -> Self {
        Self { delta: 1.0 }
    }
}

impl Loss for Huber {
    fn kind(&self) -> &str {
        "huber"
    }

    fn value(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Vec<f32>> {
        check_same_shape(target, prediction)?;
        let delta = self.delta;
        Ok(per_example(target, prediction, |d| {
            let a = d.abs();
            if a <= delta { 0.5 * d * d } else { delta * (a - 0.5 * delta) }
        }))
    }

    fn gradient(&self, target: &Tensor, prediction: &Tensor) -> EngineResult<Tensor> {
        check_same_shape(target, prediction)?;
        let delta = self.delta;
        mean_gradient(target, prediction, |d| d.clamp(-delta, delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[f32]) -> Tensor {
        Tensor::new(vec![values.len(), 1], values.to_vec()).unwrap()
    }

    #[test]
    fn test_mse_value_and_gradient() {
        let target = column(&[1.0, 2.0]);
        let pred = column(&[2.0, 2.0]);
        let loss = MeanSquaredError;
        assert_eq!(loss.value(&target, &pred).unwrap(), vec![1.0, 0.0]);
        // d/dp mean((p - t)^2) = 2 (p - t) / n
        assert_eq!(loss.gradient(&target, &pred).unwrap().data(), &[1.0, 0.0]);
    }

    #[test]
    fn test_mae_value() {
        let loss = MeanAbsoluteError;
        let v = loss.value(&column(&[0.0, 0.0]), &column(&[-3.0, 1.0])).unwrap();
        assert_eq!(v, vec![3.0, 1.0]);
    }

    #[test]
    fn test_huber_is_linear_outside_delta() {
        let loss = Huber::new(1.0).unwrap();
        let v = loss.value(&column(&[0.0]), &column(&[3.0])).unwrap();
        assert!((v[0] - 2.5).abs() < 1e-6);
        let g = loss.gradient(&column(&[0.0]), &column(&[3.0])).unwrap();
        assert!((g.data()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_huber_rejects_bad_delta() {
        assert!(Huber::new(0.0).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let err = MeanSquaredError.value(&column(&[1.0]), &column(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, EngineError::Shape(_)));
    }
}
