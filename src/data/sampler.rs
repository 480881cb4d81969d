//! Per-worker index partitioning for data-parallel training.
//!
//! Every worker builds the same epoch permutation from a shared seed, then
//! keeps the positions congruent to its rank. Shards are disjoint and equally
//! sized, so all workers iterate the same number of batches and their
//! collective calls stay aligned.

use crate::data::collate::shuffled_indices;
use crate::error::{Error, Result};

/// Deterministic, epoch-aware partition of `0..dataset_len` across ranks.
///
/// Rank `r` of `W` takes positions `r, r + W, r + 2W, ...` of the epoch
/// permutation.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    drop_last: bool,
}

impl DistributedSampler {
    /// Create a sampler for one rank.
    ///
    /// With `drop_last`, the trailing `dataset_len % world_size` indices of
    /// each permutation are dropped. Without it, the permutation wraps around
    /// to pad every shard to the same length.
    pub fn new(
        dataset_len: usize,
        rank: usize,
        world_size: usize,
        shuffle: bool,
        seed: u64,
        drop_last: bool,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "must be > 0".into(),
            });
        }
        if rank >= world_size {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: format!("rank {rank} >= world_size {world_size}"),
            });
        }
        Ok(Self {
            dataset_len,
            rank,
            world_size,
            shuffle,
            seed,
            drop_last,
        })
    }

    /// Samples this rank sees per epoch.
    pub fn num_samples(&self) -> usize {
        if self.drop_last {
            self.dataset_len / self.world_size
        } else {
            self.dataset_len.div_ceil(self.world_size)
        }
    }

    /// Samples across all ranks per epoch, after truncation or padding.
    pub fn total_size(&self) -> usize {
        self.num_samples() * self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    /// This rank's dataset indices for `epoch`, in iteration order.
    pub fn indices(&self, epoch: u64) -> Vec<usize> {
        let mut order = if self.shuffle {
            shuffled_indices(self.dataset_len, self.seed.wrapping_add(epoch))
        } else {
            (0..self.dataset_len).collect()
        };

        let total = self.total_size();
        if order.len() >= total {
            order.truncate(total);
        } else if !order.is_empty() {
            let mut pad = 0;
            while order.len() < total {
                order.push(order[pad]);
                pad += 1;
            }
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
