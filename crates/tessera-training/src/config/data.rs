use super::NamedMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_dtype() -> String {
    "float32".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Labels are targets, not graph inputs.
    #[serde(default)]
    pub label: bool,
}

impl FeatureConfig {
    /// Number of scalar values per example.
    #[must_use]
    pub fn width(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(rename = "in")]
    pub features: NamedMap<FeatureConfig>,
    #[serde(default)]
    pub splits: NamedMap<SplitConfig>,
}

impl DatasetConfig {
    pub fn labels(&self) -> impl Iterator<Item = (&str, &FeatureConfig)> {
        self.features.iter().filter(|(_, f)| f.label)
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &FeatureConfig)> {
        self.features.iter().filter(|(_, f)| !f.label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub datasets: NamedMap<DatasetConfig>,
}
