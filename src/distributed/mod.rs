//! Data-parallel process groups
//!
//! Every worker runs the same training loop; a [`ProcessGroup`] is the only
//! channel between them. Collectives must be called by all ranks in the same
//! order. Workers are threads of one launcher joined by numr's
//! [`Communicator`](numr::runtime::Communicator).

pub mod comm;
pub mod grad_sync;
pub mod group;

pub use comm::{all_reduce_slice, barrier};
pub use grad_sync::all_reduce_grads;
pub use group::CommProcessGroup;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Collective operations over a fixed set of workers.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Rank 0 owns checkpoint writes and progress reporting.
    fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Replace `buf` on every rank with the element-wise mean over ranks.
    /// Every rank receives bit-identical values.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()>;

    /// Mean of `value` over ranks, delivered to the leader only.
    fn reduce_mean_to_leader(&self, value: f64) -> Result<Option<f64>>;

    fn barrier(&self) -> Result<()>;
}

impl<P: ProcessGroup + ?Sized> ProcessGroup for Box<P> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        (**self).all_reduce_mean(buf)
    }

    fn reduce_mean_to_leader(&self, value: f64) -> Result<Option<f64>> {
        (**self).reduce_mean_to_leader(value)
    }

    fn barrier(&self) -> Result<()> {
        (**self).barrier()
    }
}

/// Process-group settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistSettings {
    pub world_size: usize,
}

impl Default for DistSettings {
    fn default() -> Self {
        Self { world_size: 1 }
    }
}

impl DistSettings {
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(Error::ConfigError {
                reason: "world_size must be > 0".into(),
            });
        }
        Ok(())
    }
}

/// Build every member of the group described by `settings`.
///
/// Member `i` has rank `i`; each belongs on its own worker thread.
pub fn init_process_groups(settings: &DistSettings) -> Result<Vec<CommProcessGroup>> {
    settings.validate()?;
    let groups = CommProcessGroup::bootstrap_local(settings.world_size)?;
    tracing::info!(world_size = settings.world_size, "process group ready");
    Ok(groups)
}
