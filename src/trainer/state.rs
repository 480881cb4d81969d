//! Explicit training progress, threaded through the loop and checkpoints.

use crate::data::LoaderCursor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Everything besides tensors needed to continue a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    #[serde(default = "default_version")]
    pub format_version: u32,
    /// Optimizer steps taken.
    pub global_step: u64,
    /// Wall-clock training time accumulated over all sessions.
    pub elapsed_seconds: f64,
    /// Dropout RNG state.
    pub rng_state: u64,
    #[serde(default)]
    pub optimizer_timestep: u64,
}

impl TrainingState {
    pub fn new(rng_state: u64) -> Self {
        Self {
            format_version: CHECKPOINT_VERSION,
            rng_state,
            ..Self::default()
        }
    }
}

/// Where a resumed run picks up: an epoch and a micro-batch offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub epoch: u64,
    /// Micro-batches of `epoch` already consumed. Always a multiple of the
    /// accumulation group size.
    pub micro_batch: usize,
}

impl ResumePoint {
    /// Map optimizer steps back to a data position. Deterministic, so every
    /// rank resumes at the same place.
    pub fn from_global_step(global_step: u64, per_epoch_steps: u64, grad_accum_steps: usize) -> Result<Self> {
        if per_epoch_steps == 0 {
            return Err(Error::TrainingError {
                reason: "per_epoch_steps must be > 0 to resume".into(),
            });
        }
        Ok(Self {
            epoch: global_step / per_epoch_steps,
            micro_batch: (global_step % per_epoch_steps) as usize * grad_accum_steps,
        })
    }

    pub fn cursor(&self) -> LoaderCursor {
        LoaderCursor {
            epoch: self.epoch,
            batch: self.micro_batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_mid_epoch() {
        let p = ResumePoint::from_global_step(13, 5, 4).unwrap();
        assert_eq!(p.epoch, 2);
        assert_eq!(p.micro_batch, 12);
        assert_eq!(p.cursor(), LoaderCursor { epoch: 2, batch: 12 });
    }

    #[test]
    fn test_resume_at_epoch_boundary() {
        let p = ResumePoint::from_global_step(10, 5, 16).unwrap();
        assert_eq!((p.epoch, p.micro_batch), (2, 0));
    }

    #[test]
    fn test_resume_from_zero() {
        let p = ResumePoint::from_global_step(0, 7, 2).unwrap();
        assert_eq!((p.epoch, p.micro_batch), (0, 0));
    }

    #[test]
    fn test_zero_steps_per_epoch_rejected() {
        assert!(ResumePoint::from_global_step(3, 0, 2).is_err());
    }

    #[test]
    fn test_state_json_defaults() {
        let s: TrainingState =
            serde_json::from_str(r#"{"global_step":4,"elapsed_seconds":1.5,"rng_state":9}"#).unwrap();
        assert_eq!(s.format_version, CHECKPOINT_VERSION);
        assert_eq!(s.optimizer_timestep, 0);
    }
}
