//! Per-run logger handle.
//!
//! Every record carries the run id and the phase it was emitted from, so a
//! single subscriber can route or filter by either.

use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Graph,
    Train,
    Eval,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Graph => "graph",
            Self::Train => "train",
            Self::Eval => "eval",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
}

impl RunLogger {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into() }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn debug(&self, phase: Phase, message: &str) {
        debug!(run = %self.run_id, phase = phase.as_str(), "{message}");
    }

    pub fn info(&self, phase: Phase, message: &str) {
        info!(run = %self.run_id, phase = phase.as_str(), "{message}");
    }

    pub fn warn(&self, phase: Phase, message: &str) {
        warn!(run = %self.run_id, phase = phase.as_str(), "{message}");
    }

    /// A span that tags nested records with this run and phase.
    pub fn span(&self, phase: Phase) -> tracing::Span {
        tracing::info_span!("run", run = %self.run_id, phase = phase.as_str())
    }
}
