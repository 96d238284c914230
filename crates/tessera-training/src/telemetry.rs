//! Best-effort telemetry.
//!
//! Sink failures are logged and counted, never returned to the training loop.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tessera_abstraction::{TelemetryError, TelemetrySink};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Scalar { tag: String, value: f64, step: u64 },
    Histogram { tag: String, step: u64, count: usize, min: f32, max: f32, mean: f32 },
}

impl TelemetryEvent {
    pub fn tag(&self) -> &str {
        match self {
            Self::Scalar { tag, .. } | Self::Histogram { tag, .. } => tag,
        }
    }

    fn histogram(tag: &str, values: &[f32], step: u64) -> Self {
        let (min, max, sum) = values.iter().fold((f32::INFINITY, f32::NEG_INFINITY, 0.0), |acc, v| {
            (acc.0.min(*v), acc.1.max(*v), acc.2 + v)
        });
        let mean = if values.is_empty() { 0.0 } else { sum / values.len() as f32 };
        Self::Histogram { tag: tag.to_string(), step, count: values.len(), min, max, mean }
    }
}

/// Optional sink wrapper owned by the trainer.
#[derive(Default)]
pub struct Telemetry {
    sink: Option<Box<dyn TelemetrySink>>,
    emitted: u64,
    failures: u64,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.sink.is_some())
            .field("emitted", &self.emitted)
            .field("failures", &self.failures)
            .finish()
    }
}

impl Telemetry {
    /// No sink attached. Every call is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(sink: Box<dyn TelemetrySink>) -> Self {
        Self { sink: Some(sink), emitted: 0, failures: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn absorb(&mut self, tag: &str, result: Result<(), TelemetryError>) {
        match result {
            Ok(()) => self.emitted += 1,
            Err(e) => {
                self.failures += 1;
                warn!(tag, error = %e, "Telemetry write failed");
            }
        }
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: u64) {
        let Some(sink) = self.sink.as_mut() else { return };
        let result = sink.scalar(tag, value, step);
        self.absorb(tag, result);
    }

    pub fn histogram(&mut self, tag: &str, values: &[f32], step: u64) {
        let Some(sink) = self.sink.as_mut() else { return };
        let result = sink.histogram(tag, values, step);
        self.absorb(tag, result);
    }

    pub fn flush(&mut self) {
        let Some(sink) = self.sink.as_mut() else { return };
        if let Err(e) = sink.flush() {
            self.failures += 1;
            warn!(error = %e, "Telemetry flush failed");
        }
    }
}

/// Writes one JSON event per line.
pub struct JsonlTelemetrySink {
    writer: BufWriter<File>,
}

impl JsonlTelemetrySink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self { writer: BufWriter::new(File::create(path)?) })
    }

    fn write(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        serde_json::to_writer(&mut self.writer, event)
            .map_err(|e| TelemetryError::Write(e.to_string()))?;
        self.writer.write_all(b"\n").map_err(|e| TelemetryError::Write(e.to_string()))
    }
}

impl TelemetrySink for JsonlTelemetrySink {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TelemetryError> {
        self.write(&TelemetryEvent::Scalar { tag: tag.to_string(), value, step })
    }

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<(), TelemetryError> {
        self.write(&TelemetryEvent::histogram(tag, values, step))
    }

    fn flush(&mut self) -> Result<(), TelemetryError> {
        self.writer.flush().map_err(|e| TelemetryError::Write(e.to_string()))
    }
}

/// Keeps events in memory. Clone the handle before boxing the sink to read them back.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetrySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl MemoryTelemetrySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of scalar events whose tag starts with `prefix`.
    pub fn scalar_count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::Scalar { .. }) && e.tag().starts_with(prefix))
            .count()
    }

    fn push(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .map_err(|_| TelemetryError::Write("event buffer poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TelemetryError> {
        self.push(TelemetryEvent::Scalar { tag: tag.to_string(), value, step })
    }

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<(), TelemetryError> {
        self.push(TelemetryEvent::histogram(tag, values, step))
    }
}
