use super::NamedMap;
use serde::{Deserialize, Serialize};
use tessera_abstraction::Options;

/// A layer's declared parent(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InName {
    One(String),
    Many(Vec<String>),
}

impl InName {
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub in_name: Option<InName>,
    /// Marks the layer as a named graph output.
    #[serde(default)]
    pub endpoint: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub layers: NamedMap<LayerConfig>,
}
