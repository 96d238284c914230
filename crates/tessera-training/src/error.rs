use std::path::PathBuf;
use tessera_abstraction::EngineError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("objective '{objective}' references unknown dataset '{dataset}'")]
    UnknownDataset { objective: String, dataset: String },

    #[error("failed to load config file at {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config{}: {source}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    ConfigParse {
        path: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("numeric failure during {stage}: {source}")]
    Numeric {
        stage: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("training incomplete: {0}")]
    Incomplete(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn numeric(stage: &'static str, source: EngineError) -> Self {
        Self::Numeric { stage, source }
    }

    /// Whether the error belongs to the pre-run configuration class.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownDataset { .. }
                | Self::ConfigLoad { .. }
                | Self::ConfigParse { .. }
        )
    }
}
