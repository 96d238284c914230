use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub batch: usize,
    /// Shuffle buffer size in records. Absent or 0 keeps source order.
    #[serde(default)]
    pub shuffle_buffer: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperParameters {
    pub dataset: BatchingConfig,
    /// Epoch budget every bound objective must reach.
    pub epochs: u32,
}
