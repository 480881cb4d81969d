pub mod checkpoint;
pub mod config;
pub mod container;
pub mod evaluate;
pub mod orchestrator;
pub mod state;

pub use checkpoint::{CheckpointManager, FreshStart, LoadOutcome};
pub use config::{DataSettings, RunConfig, TrainSettings};
pub use container::{Container, HostTensor};
pub use evaluate::{EvalHistory, EvalRecord, Evaluator, Progress, calc_loss_loader, eta_hours};
pub use orchestrator::{Orchestrator, RunSummary, build_loaders};
pub use state::{CHECKPOINT_VERSION, ResumePoint, TrainingState};
