use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: String, optimizers: usize, objectives: usize, budget: u32 },
    SelectionSwitched { run_id: String, optimizer: String, objective: String },
    EpochCompleted { run_id: String, optimizer: String, objective: String, epoch: u32, global_step: u64 },
    ValidationCompleted { run_id: String, objective: String, epoch: u32, loss: Option<f64> },
    Finished { run_id: String, status: String, global_step: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, optimizers, objectives, budget } => println!(
                "[train:{run_id}] started ({optimizers} optimizers, {objectives} objectives, {budget} epochs)"
            ),
            ProgressEvent::SelectionSwitched { run_id, optimizer, objective } => {
                println!("[train:{run_id}] now training {objective} with {optimizer}");
            }
            ProgressEvent::EpochCompleted { run_id, optimizer, objective, epoch, global_step } => {
                println!("[train:{run_id}] {optimizer}/{objective} epoch {epoch} (step {global_step})");
            }
            ProgressEvent::ValidationCompleted { run_id, objective, epoch, loss } => match loss {
                Some(loss) => println!("[train:{run_id}] val {objective} epoch {epoch}: loss {loss:.6}"),
                None => println!("[train:{run_id}] val {objective} epoch {epoch}: no batches"),
            },
            ProgressEvent::Finished { run_id, status, global_step } => {
                println!("[train:{run_id}] {status} after {global_step} steps");
            }
        }
    }
}
