pub mod adamw;
pub mod grad_accumulator;
pub mod grad_clip;
pub mod lr_schedule;
pub mod traits;

pub use adamw::{AdamW, AdamWConfig, Moments};
pub use grad_accumulator::{AccumulationSchedule, GradSyncController, StepReport};
pub use grad_clip::clip_grad_norm;
pub use lr_schedule::LrSchedule;
pub use traits::Optimizer;
