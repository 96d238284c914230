use serde::{Deserialize, Serialize};

/// Log verbosity as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[serde(alias = "DEBUG")]
    Debug,
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "warning", alias = "WARNING", alias = "WARN")]
    Warn,
    #[serde(alias = "critical", alias = "CRITICAL", alias = "ERROR")]
    Error,
    Off,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub level: LogLevel,
}

fn console_default() -> LevelConfig {
    LevelConfig { level: LogLevel::Info }
}

fn file_default() -> LevelConfig {
    LevelConfig { level: LogLevel::Error }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParamTrackConfig {
    /// Parameter histogram cadence in global steps. 0 disables.
    #[serde(default)]
    pub param_steps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Tracker cadence in global steps. 0 means never log.
    #[serde(default)]
    pub tracker_steps: u64,
    #[serde(default, alias = "tensorboard")]
    pub params: ParamTrackConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "console_default")]
    pub console: LevelConfig,
    #[serde(default = "file_default")]
    pub file: LevelConfig,
    #[serde(default)]
    pub track: TrackConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { console: console_default(), file: file_default(), track: TrackConfig::default() }
    }
}
