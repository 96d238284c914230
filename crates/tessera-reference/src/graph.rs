//! A multi-head linear model: one dense head per named output.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_abstraction::{EngineError, EngineResult, GradientStep, Graph, Loss, Parameter, Tensor};
use tracing::debug;

#[derive(Debug, Clone)]
struct Head {
    name: String,
    units: usize,
}

/// Each head computes `inputs · kernel + bias` over the full batch input.
///
/// Parameters are laid out as `[h0/kernel, h0/bias, h1/kernel, h1/bias, ...]`.
#[derive(Debug, Clone)]
pub struct LinearGraph {
    input_width: usize,
    heads: Vec<Head>,
    parameters: Vec<Parameter>,
}

impl LinearGraph {
    /// Builds the graph with Glorot-uniform kernels and zero biases.
    pub fn new(input_width: usize, heads: Vec<(String, usize)>, seed: u64) -> EngineResult<Self> {
        if input_width == 0 {
            return Err(EngineError::Shape("input width must be > 0".to_string()));
        }
        if heads.is_empty() {
            return Err(EngineError::Other("a graph needs at least one output".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut parameters = Vec::with_capacity(heads.len() * 2);
        let mut built = Vec::with_capacity(heads.len());
        for (name, units) in heads {
            if units == 0 {
                return Err(EngineError::Shape(format!("output '{name}' has zero units")));
            }
            let limit = (6.0 / (input_width + units) as f32).sqrt();
            let kernel: Vec<f32> =
                (0..input_width * units).map(|_| rng.gen_range(-limit..limit)).collect();
            parameters.push(Parameter {
                name: format!("{name}/kernel"),
                value: Tensor::new(vec![input_width, units], kernel)?,
            });
            parameters.push(Parameter {
                name: format!("{name}/bias"),
                value: Tensor::zeros(vec![units]),
            });
            built.push(Head { name, units });
        }

        debug!(input_width, outputs = built.len(), "Built linear graph");
        Ok(Self { input_width, heads: built, parameters })
    }

    fn head_output(&self, index: usize, inputs: &Tensor) -> EngineResult<Tensor> {
        if inputs.row_width() != self.input_width {
            return Err(EngineError::Shape(format!(
                "graph expects input width {}, got {}",
                self.input_width,
                inputs.row_width()
            )));
        }
        let units = self.heads[index].units;
        let kernel = self.parameters[index * 2].value.data();
        let bias = self.parameters[index * 2 + 1].value.data();

        let rows = inputs.rows();
        let mut out = Vec::with_capacity(rows * units);
        for r in 0..rows {
            let x = inputs.row(r);
            for u in 0..units {
                let dot: f32 = x.iter().enumerate().map(|(i, xi)| xi * kernel[i * units + u]).sum();
                out.push(dot + bias[u]);
            }
        }
        Tensor::new(vec![rows, units], out)
    }

    fn resolve_head(&self, output_index: Option<usize>) -> EngineResult<usize> {
        match output_index {
            Some(idx) if idx < self.heads.len() => Ok(idx),
            Some(idx) => Err(EngineError::Shape(format!(
                "output index {idx} out of range for {} outputs",
                self.heads.len()
            ))),
            None if self.heads.len() == 1 => Ok(0),
            None => Err(EngineError::Shape(
                "an output index is required for a multi-output graph".to_string(),
            )),
        }
    }
}

impl Graph for LinearGraph {
    fn output_names(&self) -> Vec<String> {
        self.heads.iter().map(|h| h.name.clone()).collect()
    }

    fn forward(&self, inputs: &Tensor) -> EngineResult<Vec<Tensor>> {
        (0..self.heads.len()).map(|idx| self.head_output(idx, inputs)).collect()
    }

    fn compute_gradients(
        &self,
        inputs: &Tensor,
        target: &Tensor,
        loss: &dyn Loss,
        output_index: Option<usize>,
    ) -> EngineResult<GradientStep> {
        let head = self.resolve_head(output_index)?;
        let predictions = self.head_output(head, inputs)?;
        let losses = loss.value(target, &predictions)?;
        let total_loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
        if !total_loss.is_finite() {
            return Err(EngineError::Numeric(format!("non-finite {} loss", loss.kind())));
        }
        let d_pred = loss.gradient(target, &predictions)?;

        let units = self.heads[head].units;
        let mut d_kernel = vec![0.0f32; self.input_width * units];
        let mut d_bias = vec![0.0f32; units];
        for r in 0..inputs.rows() {
            let x = inputs.row(r);
            let g = d_pred.row(r);
            for (i, xi) in x.iter().enumerate() {
                for (u, gu) in g.iter().enumerate() {
                    d_kernel[i * units + u] += xi * gu;
                }
            }
            for (u, gu) in g.iter().enumerate() {
                d_bias[u] += gu;
            }
        }

        let mut gradients: Vec<Tensor> =
            self.parameters.iter().map(|p| Tensor::zeros(p.value.shape().to_vec())).collect();
        gradients[head * 2] = Tensor::new(vec![self.input_width, units], d_kernel)?;
        gradients[head * 2 + 1] = Tensor::new(vec![units], d_bias)?;

        Ok(GradientStep { gradients, predictions, losses, total_loss })
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }
}
