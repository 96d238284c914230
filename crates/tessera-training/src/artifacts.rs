use crate::controller::{EpochEvent, IncompleteObjective};
use crate::error::{TrainingError, TrainingResult};
use crate::evaluate::{EvaluationReport, ValidationSummary};
use crate::layout::RunId;
use crate::tracker::TrackerRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Config,
    Telemetry,
    Log,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub train_steps: u64,
    /// Examples seen per optimizer.
    pub optimizer_steps: BTreeMap<String, u64>,
}

/// Everything recorded about a finished (or aborted) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config_fingerprint: String,
    pub status: String,
    pub steps: StepCounts,
    pub epoch_events: Vec<EpochEvent>,
    pub validations: Vec<ValidationSummary>,
    pub incomplete: Vec<IncompleteObjective>,
    pub trackers: Vec<TrackerRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationReport>,
    pub artifacts: Vec<RunArtifact>,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<RunArtifact> {
    if !path.exists() {
        return Err(TrainingError::Other(anyhow::anyhow!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(RunArtifact { kind, path, sha256: hash })
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> RunManifest {
        RunManifest {
            run_id: RunId("run-1".to_string()),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            config_fingerprint: "abc".to_string(),
            status: "finished".to_string(),
            steps: StepCounts::default(),
            epoch_events: Vec::new(),
            validations: Vec::new(),
            incomplete: vec![IncompleteObjective {
                optimizer: "o1".to_string(),
                objective: "a".to_string(),
                epochs: 1,
                budget: 2,
            }],
            trackers: Vec::new(),
            evaluation: None,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let artifact = make_artifact(ArtifactKind::Config, path).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Config);
    }

    #[test]
    fn test_missing_artifact_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(make_artifact(ArtifactKind::Log, temp.path().join("nope")).is_err());
    }

    #[test]
    fn test_write_manifest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run").join("run_manifest.json");
        write_manifest(&path, &manifest()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["incomplete"][0]["objective"], "a");
        assert!(value.get("evaluation").is_none());
    }
}
