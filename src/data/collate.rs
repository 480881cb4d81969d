//! Batch collation, deterministic shuffling and the crate's PRNG.

use crate::data::dataset::{Batch, Dataset};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use rayon::prelude::*;

/// splitmix64 generator.
///
/// The whole state is one `u64`, so it is trivially checkpointed and restored.
/// Every worker that starts from the same seed and makes the same sequence of
/// calls observes the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Raw generator state, for checkpointing.
    pub fn state(&self) -> u64 {
        self.state
    }

    /// Restore a state previously returned by [`SplitMix64::state`].
    pub fn set_state(&mut self, state: u64) {
        self.state = state;
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform sample in `[0, 1)` with 53 bits of precision.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_normal(&mut self) -> f64 {
        // 1 - u keeps the log argument in (0, 1]
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

/// Generate shuffled indices `[0..len)` deterministically from a seed.
///
/// splitmix64 + Fisher-Yates, reproducible across platforms.
pub(crate) fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    if len <= 1 {
        return indices;
    }

    let mut rng = SplitMix64::new(seed);
    for i in (1..len).rev() {
        let j = (rng.next_u64() as usize) % (i + 1);
        indices.swap(i, j);
    }
    indices
}

/// Collate examples into `[batch, seq_len]` i64 token tensors.
///
/// Examples are fetched in parallel; order follows `indices`.
pub(crate) fn collate_batch<R, D>(
    dataset: &D,
    indices: &[usize],
    device: &R::Device,
) -> Result<Batch<R>>
where
    R: Runtime<DType = DType>,
    D: Dataset,
{
    if indices.is_empty() {
        return Err(Error::DataError {
            reason: "empty batch indices".to_string(),
        });
    }

    let examples = indices
        .par_iter()
        .map(|&idx| dataset.get(idx))
        .collect::<Result<Vec<_>>>()?;

    let seq_len = examples[0].inputs.len();
    let mut inputs: Vec<i64> = Vec::with_capacity(indices.len() * seq_len);
    let mut targets: Vec<i64> = Vec::with_capacity(indices.len() * seq_len);
    for example in &examples {
        if example.inputs.len() != seq_len || example.targets.len() != seq_len {
            return Err(Error::DataError {
                reason: format!(
                    "inconsistent example lengths: expected {seq_len}, got {}/{}",
                    example.inputs.len(),
                    example.targets.len()
                ),
            });
        }
        inputs.extend(example.inputs.iter().map(|&t| t as i64));
        targets.extend(example.targets.iter().map(|&t| t as i64));
    }

    let shape = [indices.len(), seq_len];
    Ok(Batch {
        inputs: Tensor::<R>::from_slice(&inputs, &shape, device),
        targets: Tensor::<R>::from_slice(&targets, &shape, device),
    })
}
