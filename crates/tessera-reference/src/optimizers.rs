//! Update rules.

use tessera_abstraction::{EngineError, EngineResult, Parameter, Tensor, UpdateRule};

fn check_aligned(parameters: &[Parameter], gradients: &[Tensor]) -> EngineResult<()> {
    if parameters.len() != gradients.len() {
        return Err(EngineError::Shape(format!(
            "{} gradients for {} parameters",
            gradients.len(),
            parameters.len()
        )));
    }
    for (param, grad) in parameters.iter().zip(gradients) {
        if param.value.shape() != grad.shape() {
            return Err(EngineError::Shape(format!(
                "gradient shape {:?} does not match parameter '{}' {:?}",
                grad.shape(),
                param.name,
                param.value.shape()
            )));
        }
        if grad.data().iter().any(|g| !g.is_finite()) {
            return Err(EngineError::Numeric(format!(
                "non-finite gradient for parameter '{}'",
                param.name
            )));
        }
    }
    Ok(())
}

/// Stochastic gradient descent with optional classical momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    velocity: Vec<Vec<f32>>,
}

impl Sgd {
    #[must_use]
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self { learning_rate, momentum, velocity: Vec::new() }
    }
}

impl UpdateRule for Sgd {
    fn kind(&self) -> &str {
        "sgd"
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn apply(&mut self, parameters: &mut [Parameter], gradients: &[Tensor]) -> EngineResult<()> {
        check_aligned(parameters, gradients)?;
        if self.velocity.len() != parameters.len() {
            self.velocity = parameters.iter().map(|p| vec![0.0; p.value.len()]).collect();
        }

        let lr = self.learning_rate as f32;
        let momentum = self.momentum as f32;
        for ((param, grad), velocity) in
            parameters.iter_mut().zip(gradients).zip(self.velocity.iter_mut())
        {
            for ((w, g), v) in param.value.data_mut().iter_mut().zip(grad.data()).zip(velocity) {
                *v = momentum * *v - lr * g;
                *w += *v;
            }
        }
        Ok(())
    }
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    step: i32,
    first: Vec<Vec<f32>>,
    second: Vec<Vec<f32>>,
}

impl Adam {
    #[must_use]
    pub fn new(learning_rate: f64, beta_1: f64, beta_2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
            step: 0,
            first: Vec::new(),
            second: Vec::new(),
        }
    }
}

impl UpdateRule for Adam {
    fn kind(&self) -> &str {
        "adam"
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn apply(&mut self, parameters: &mut [Parameter], gradients: &[Tensor]) -> EngineResult<()> {
        check_aligned(parameters, gradients)?;
        if self.first.len() != parameters.len() {
            self.first = parameters.iter().map(|p| vec![0.0; p.value.len()]).collect();
            self.second = self.first.clone();
            self.step = 0;
        }

        self.step = self.step.saturating_add(1);
        let correction_1 = 1.0 - self.beta_1.powi(self.step);
        let correction_2 = 1.0 - self.beta_2.powi(self.step);
        let (b1, b2) = (self.beta_1 as f32, self.beta_2 as f32);
        let lr = self.learning_rate as f32;
        let eps = self.epsilon as f32;
        let (c1, c2) = (correction_1 as f32, correction_2 as f32);

        for (idx, (param, grad)) in parameters.iter_mut().zip(gradients).enumerate() {
            let m = &mut self.first[idx];
            let v = &mut self.second[idx];
            for (i, (w, g)) in param.value.data_mut().iter_mut().zip(grad.data()).enumerate() {
                m[i] = b1 * m[i] + (1.0 - b1) * g;
                v[i] = b2 * v[i] + (1.0 - b2) * g * g;
                let m_hat = m[i] / c1;
                let v_hat = v[i] / c2;
                *w -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(values: &[f32]) -> Parameter {
        Parameter {
            name: "w".to_string(),
            value: Tensor::new(vec![values.len()], values.to_vec()).unwrap(),
        }
    }

    #[test]
    fn test_sgd_moves_against_gradient() {
        let mut params = vec![param(&[1.0, 1.0])];
        let grads = vec![Tensor::new(vec![2], vec![1.0, -1.0]).unwrap()];
        let mut sgd = Sgd::new(0.5, 0.0);
        sgd.apply(&mut params, &grads).unwrap();
        assert_eq!(params[0].value.data(), &[0.5, 1.5]);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut params = vec![param(&[0.0])];
        let grads = vec![Tensor::new(vec![1], vec![1.0]).unwrap()];
        let mut sgd = Sgd::new(1.0, 0.5);
        sgd.apply(&mut params, &grads).unwrap();
        sgd.apply(&mut params, &grads).unwrap();
        // -1, then -1 + 0.5 * -1
        assert!((params[0].value.data()[0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_learning_rate_sized() {
        let mut params = vec![param(&[0.0])];
        let grads = vec![Tensor::new(vec![1], vec![4.0]).unwrap()];
        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8);
        adam.apply(&mut params, &grads).unwrap();
        assert!((params[0].value.data()[0] + 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_misaligned_gradients_are_rejected() {
        let mut params = vec![param(&[0.0, 0.0])];
        let grads = vec![Tensor::new(vec![1], vec![1.0]).unwrap()];
        assert!(Sgd::new(0.1, 0.0).apply(&mut params, &grads).is_err());
    }

    #[test]
    fn test_non_finite_gradient_is_numeric_error() {
        let mut params = vec![param(&[0.0])];
        let grads = vec![Tensor::new(vec![1], vec![f32::NAN]).unwrap()];
        let err = Sgd::new(0.1, 0.0).apply(&mut params, &grads).unwrap_err();
        assert!(matches!(err, EngineError::Numeric(_)));
    }
}
