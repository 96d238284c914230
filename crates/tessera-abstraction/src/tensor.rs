//! Minimal dense tensor, record, and batch types exchanged with engines.

use crate::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row-major dense `f32` tensor. The first dimension is the batch dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> EngineResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::Shape(format!(
                "shape {:?} expects {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    /// Stacks equally sized rows into a `[rows, width]` tensor.
    pub fn from_rows(rows: &[Vec<f32>]) -> EngineResult<Self> {
        let Some(first) = rows.first() else {
            return Err(EngineError::Shape("cannot stack zero rows".to_string()));
        };
        let width = first.len();
        let mut data = Vec::with_capacity(rows.len() * width);
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(EngineError::Shape(format!(
                    "row {idx} has width {}, expected {width}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { shape: vec![rows.len(), width], data })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows along the batch dimension.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of values per row.
    #[must_use]
    pub fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    #[must_use]
    pub fn row(&self, index: usize) -> &[f32] {
        let width = self.row_width();
        &self.data[index * width..(index + 1) * width]
    }
}

/// A single example read from a record source, before batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub features: Vec<f32>,
    /// Label values keyed by label name.
    pub targets: BTreeMap<String, Vec<f32>>,
}

impl Record {
    #[must_use]
    pub fn new(features: Vec<f32>) -> Self {
        Self { features, targets: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>, values: Vec<f32>) -> Self {
        self.targets.insert(name.into(), values);
        self
    }
}

/// A batch of stacked inputs and named targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: BTreeMap<String, Tensor>,
}

impl Batch {
    /// Stacks records into a batch. Every record must carry the same labels.
    pub fn from_records(records: &[Record]) -> EngineResult<Self> {
        let Some(first) = records.first() else {
            return Err(EngineError::Data("cannot build a batch from zero records".to_string()));
        };

        let features: Vec<Vec<f32>> = records.iter().map(|r| r.features.clone()).collect();
        let inputs = Tensor::from_rows(&features)?;

        let mut targets = BTreeMap::new();
        for name in first.targets.keys() {
            let mut rows = Vec::with_capacity(records.len());
            for (idx, record) in records.iter().enumerate() {
                let values = record.targets.get(name).ok_or_else(|| {
                    EngineError::Data(format!("record {idx} is missing label '{name}'"))
                })?;
                rows.push(values.clone());
            }
            targets.insert(name.clone(), Tensor::from_rows(&rows)?);
        }

        Ok(Self { inputs, targets })
    }

    /// Number of examples in the batch.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inputs.rows()
    }

    #[must_use]
    pub fn target(&self, name: &str) -> Option<&Tensor> {
        self.targets.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_new_rejects_mismatched_shape() {
        let err = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, EngineError::Shape(_)));
    }

    #[test]
    fn test_from_rows_builds_matrix() {
        let t = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.rows(), 3);
        assert_eq!(t.row_width(), 2);
        assert_eq!(t.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_from_rows_rejects_ragged_rows() {
        assert!(Tensor::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_batch_from_records() {
        let records = vec![
            Record::new(vec![1.0, 2.0]).with_target("y", vec![0.5]),
            Record::new(vec![3.0, 4.0]).with_target("y", vec![1.5]),
        ];
        let batch = Batch::from_records(&records).unwrap();
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.target("y").unwrap().data(), &[0.5, 1.5]);
        assert!(batch.target("z").is_none());
    }

    #[test]
    fn test_batch_requires_consistent_labels() {
        let records = vec![
            Record::new(vec![1.0]).with_target("y", vec![0.5]),
            Record::new(vec![3.0]),
        ];
        assert!(matches!(Batch::from_records(&records), Err(EngineError::Data(_))));
    }
}
