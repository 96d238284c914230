use super::NamedMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_abstraction::Options;

/// How the controller picks among candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Declaration order; stay on a candidate until it completes.
    Sequential,
    /// Uniform over the remaining candidates.
    Random,
    /// Proportional to the given weights. Unlisted candidates weigh 1.0.
    Weighted(BTreeMap<String, f64>),
}

impl SelectionPolicy {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
            Self::Weighted(_) => "weighted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_objective_policy")]
    pub objective: SelectionPolicy,
    #[serde(default = "default_optimizer_policy")]
    pub optimizer: SelectionPolicy,
    /// Rotate optimizers after this many consecutive steps.
    #[serde(default)]
    pub turn_steps: Option<u64>,
}

fn default_objective_policy() -> SelectionPolicy {
    SelectionPolicy::Random
}

fn default_optimizer_policy() -> SelectionPolicy {
    SelectionPolicy::Sequential
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            objective: default_objective_policy(),
            optimizer: default_optimizer_policy(),
            turn_steps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Options,
    /// Bound objective names. `None` binds every objective.
    #[serde(default)]
    pub objectives: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeConfig {
    pub optimizers: NamedMap<OptimizerConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
}
