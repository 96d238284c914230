use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_root_dir() -> PathBuf {
    PathBuf::from("runs")
}

/// Run identity and output location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaConfig {
    pub data_name: String,
    pub experiment_name: String,
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Seed for selection policies and shuffle buffers. Defaults to 0.
    #[serde(default, alias = "random_seed")]
    pub rand_seed: Option<u64>,
}

impl MetaConfig {
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.rand_seed.unwrap_or(0)
    }
}
