use crate::config::TrainConfig;
use crate::error::TrainingResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for a training run: UTC start time plus a short random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8]))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Filesystem layout for one run.
///
/// `<root_dir>/<data_name>/<experiment_name>/<model>/<run_id>/`
#[derive(Debug, Clone)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    #[must_use]
    pub fn for_config(config: &TrainConfig, run_id: &RunId) -> Self {
        Self::new(
            config
                .meta
                .root_dir
                .join(&config.meta.data_name)
                .join(&config.meta.experiment_name)
                .join(&config.model.name)
                .join(run_id.0.as_str()),
        )
    }

    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.logs_dir().join("train.log")
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.run_dir.join("checkpoints")
    }

    #[must_use]
    pub fn telemetry_path(&self) -> PathBuf {
        self.run_dir.join("telemetry.jsonl")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("run_manifest.json")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.checkpoints_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let mut config = TrainConfig::from_yaml_str(MINIMAL, temp.path()).unwrap();
        config.meta.root_dir = temp.path().join("runs");
        let id = RunId("20260101-000000-abcd1234".to_string());
        let layout = RunLayout::for_config(&config, &id);

        let expected = temp
            .path()
            .join("runs")
            .join(&config.meta.data_name)
            .join(&config.meta.experiment_name)
            .join(&config.model.name)
            .join("20260101-000000-abcd1234");
        assert_eq!(layout.run_dir(), expected.as_path());
        assert!(layout.manifest_path().ends_with("run_manifest.json"));

        layout.ensure_dirs().unwrap();
        assert!(layout.logs_dir().is_dir());
        assert!(layout.checkpoints_dir().is_dir());
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), "20260101-000000-".len() + 8);
    }
}
