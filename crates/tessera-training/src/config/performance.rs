use super::NamedMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_abstraction::Options;

/// Rolling aggregates a loss tracker can keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossDescription {
    Mean,
    Last,
}

impl LossDescription {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Last => "last",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Options,
    /// Split name to the aggregates tracked on it.
    #[serde(default)]
    pub track: BTreeMap<String, Vec<LossDescription>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name. Defaults to the metric type.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Options,
    /// Splits the metric is tracked on.
    #[serde(default)]
    pub track: Vec<String>,
}

impl MetricConfig {
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InOptions {
    /// Graph output the objective reads.
    pub prediction: String,
    /// Dataset label the prediction is compared against.
    pub target: String,
}

/// Where an objective gets its data. Structurally comparable so objectives
/// with equal inputs can be grouped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub dataset: String,
    pub options: InOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    pub loss: LossConfig,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    pub in_config: InConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub objectives: NamedMap<ObjectiveConfig>,
}
