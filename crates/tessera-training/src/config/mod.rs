//! Typed run configuration.
//!
//! A run is described by one YAML document with the sections `meta`,
//! `logging`, `performance`, `hyper_parameters`, `optimize`, `data` and
//! `model`. Any section may instead be written as `{path: other.yaml}`, in
//! which case the referenced file (relative to the main document) supplies it.

mod data;
mod hyper;
mod logging;
mod meta;
mod model;
mod optimize;
mod ordered;
mod performance;

pub use data::{DataConfig, DatasetConfig, FeatureConfig, SplitConfig};
pub use hyper::{BatchingConfig, HyperParameters};
pub use logging::{LevelConfig, LogLevel, LoggingConfig, ParamTrackConfig, TrackConfig};
pub use meta::MetaConfig;
pub use model::{InName, LayerConfig, ModelConfig};
pub use optimize::{OptimizeConfig, OptimizerConfig, PolicyConfig, SelectionPolicy};
pub use ordered::NamedMap;
pub use performance::{
    InConfig, InOptions, LossConfig, LossDescription, MetricConfig, ObjectiveConfig,
    PerformanceConfig,
};

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level sections a configuration document may contain.
pub const CONFIG_KEYS: [&str; 7] =
    ["meta", "logging", "performance", "hyper_parameters", "optimize", "data", "model"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub meta: MetaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub performance: PerformanceConfig,
    pub hyper_parameters: HyperParameters,
    pub optimize: OptimizeConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
}

fn read_yaml(path: &Path) -> TrainingResult<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| TrainingError::ConfigLoad { path: path.to_path_buf(), source })?;
    serde_yaml::from_str(&raw)
        .map_err(|source| TrainingError::ConfigParse { path: Some(path.to_path_buf()), source })
}

/// Replaces `{path: file}` sections with the referenced document.
fn resolve_sections(root: &mut Value, base_dir: &Path) -> TrainingResult<()> {
    let Value::Mapping(sections) = root else {
        return Err(TrainingError::config("configuration root must be a mapping"));
    };

    for (key, section) in sections.iter_mut() {
        let name = key.as_str().unwrap_or_default().to_string();
        if !CONFIG_KEYS.contains(&name.as_str()) {
            return Err(TrainingError::config(format!(
                "unknown section '{name}', expected one of {CONFIG_KEYS:?}"
            )));
        }

        let Value::Mapping(body) = section else { continue };
        let Some(target) = body.get("path") else { continue };
        if body.len() > 1 {
            return Err(TrainingError::config(format!(
                "section '{name}' sets 'path' alongside other keys"
            )));
        }
        let Some(target) = target.as_str() else {
            return Err(TrainingError::config(format!("section '{name}' path must be a string")));
        };

        let file = base_dir.join(target);
        debug!(section = %name, path = %file.display(), "Loading config section");
        let mut loaded = read_yaml(&file)?;
        // A section file may repeat the section name as its only key.
        if let Value::Mapping(inner) = &loaded {
            if inner.len() == 1 {
                if let Some(body) = inner.get(name.as_str()) {
                    loaded = body.clone();
                }
            }
        }
        *section = loaded;
    }
    Ok(())
}

impl TrainConfig {
    /// Loads and validates a configuration file.
    pub fn from_path(path: &Path) -> TrainingResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| TrainingError::ConfigLoad { path: path.to_path_buf(), source })?;
        let base = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_yaml_str(&raw, &base).map_err(|err| match err {
            TrainingError::ConfigParse { path: None, source } => {
                TrainingError::ConfigParse { path: Some(path.to_path_buf()), source }
            }
            other => other,
        })
    }

    /// Parses a configuration document. Section files and relative split
    /// paths resolve against `base_dir`.
    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> TrainingResult<Self> {
        let mut root: Value = serde_yaml::from_str(raw)
            .map_err(|source| TrainingError::ConfigParse { path: None, source })?;
        resolve_sections(&mut root, base_dir)?;

        let mut config: Self = serde_yaml::from_value(root)
            .map_err(|source| TrainingError::ConfigParse { path: None, source })?;
        for dataset in config.data.datasets.values_mut() {
            for split in dataset.splits.values_mut() {
                if let Some(path) = split.path.as_mut() {
                    if path.is_relative() {
                        *path = base_dir.join(&*path);
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Section-local checks. Cross references are resolved when the run is built.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.meta.data_name.trim().is_empty() {
            return Err(TrainingError::config("meta.data_name is required"));
        }
        if self.meta.experiment_name.trim().is_empty() {
            return Err(TrainingError::config("meta.experiment_name is required"));
        }
        if self.hyper_parameters.epochs == 0 {
            return Err(TrainingError::config("hyper_parameters.epochs must be >= 1"));
        }
        if self.hyper_parameters.dataset.batch == 0 {
            return Err(TrainingError::config("hyper_parameters.dataset.batch must be >= 1"));
        }
        if self.performance.objectives.is_empty() {
            return Err(TrainingError::config("performance.objectives is empty"));
        }
        if self.optimize.optimizers.is_empty() {
            return Err(TrainingError::config("optimize.optimizers is empty"));
        }
        if self.optimize.policy.turn_steps == Some(0) {
            return Err(TrainingError::config("optimize.policy.turn_steps must be >= 1"));
        }
        for policy in [&self.optimize.policy.objective, &self.optimize.policy.optimizer] {
            if let SelectionPolicy::Weighted(weights) = policy {
                if let Some((name, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0)
                {
                    return Err(TrainingError::config(format!(
                        "weight for '{name}' must be a non-negative number, got {w}"
                    )));
                }
            }
        }
        if self.data.datasets.is_empty() {
            return Err(TrainingError::config("data.datasets is empty"));
        }
        for (name, dataset) in self.data.datasets.iter() {
            if dataset.inputs().next().is_none() {
                return Err(TrainingError::config(format!(
                    "dataset '{name}' declares no input features"
                )));
            }
        }
        if self.model.layers.is_empty() {
            return Err(TrainingError::config("model.layers is empty"));
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form.
    pub fn fingerprint(&self) -> TrainingResult<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}
