//! Tessera Reference Engine
//!
//! A small CPU implementation of the engine contracts:
//! - `LinearGraph`: one dense head per named output
//! - `mse` / `mae` / `huber` losses and `mse` / `mae` / `rmse` metrics
//! - `sgd` and `adam` update rules
//! - In-memory and CSV record sources

pub mod factory;
pub mod graph;
pub mod losses;
pub mod metrics;
pub mod optimizers;
pub mod sources;

pub use factory::{option_f64, ReferenceFactory};
pub use graph::LinearGraph;
pub use losses::{Huber, MeanAbsoluteError, MeanSquaredError};
pub use metrics::ErrorMetric;
pub use optimizers::{Adam, Sgd};
pub use sources::{CsvColumn, CsvSource, InMemorySource};
