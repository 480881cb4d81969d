//! Per-worker micro-batch loader with an O(1) resumable cursor.
//!
//! Iterates one rank's shard (from [`DistributedSampler`]) in fixed-size
//! batches of `[batch, seq_len]` token tensors. Resuming mid-epoch slices the
//! shard's index list at the cursor instead of replaying skipped batches.

use crate::data::collate::collate_batch;
use crate::data::dataset::{Batch, Dataset};
use crate::data::sampler::DistributedSampler;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// Position inside the loader's stream: batch `batch` of epoch `epoch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderCursor {
    pub epoch: u64,
    pub batch: usize,
}

/// Loader over one rank's shard.
///
/// ```ignore
/// let sampler = DistributedSampler::new(dataset.len(), rank, world, true, seed, true)?;
/// let loader = DataLoader::new(dataset, sampler, micro_batch_size, device)?;
/// for batch in loader.iter(epoch) {
///     let batch = batch?;
///     // batch.inputs / batch.targets: [micro_batch_size, seq_len]
/// }
/// ```
pub struct DataLoader<R: Runtime, D> {
    dataset: D,
    sampler: DistributedSampler,
    batch_size: usize,
    device: R::Device,
}

impl<R, D> DataLoader<R, D>
where
    R: Runtime<DType = DType>,
    D: Dataset,
{
    pub fn new(
        dataset: D,
        sampler: DistributedSampler,
        batch_size: usize,
        device: R::Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be > 0".into(),
            });
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            device,
        })
    }

    /// Batches per epoch on this rank.
    ///
    /// A trailing partial batch is dropped when the sampler drops remainders.
    pub fn num_batches(&self) -> usize {
        let samples = self.sampler.num_samples();
        if self.sampler.drop_last() {
            samples / self.batch_size
        } else {
            samples.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_batches() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }

    /// Iterate one full epoch.
    pub fn iter(&self, epoch: u64) -> DataLoaderIter<'_, R, D> {
        self.iter_from(LoaderCursor { epoch, batch: 0 })
    }

    /// Iterate the rest of an epoch starting at `cursor.batch`.
    ///
    /// A cursor past the end yields nothing.
    pub fn iter_from(&self, cursor: LoaderCursor) -> DataLoaderIter<'_, R, D> {
        let mut indices = self.sampler.indices(cursor.epoch);
        let num_batches = self.num_batches();
        indices.truncate((num_batches * self.batch_size).min(indices.len()));
        let batch_idx = cursor.batch.min(num_batches);
        DataLoaderIter {
            loader: self,
            indices,
            batch_idx,
            num_batches,
        }
    }
}

/// Iterator over the batches of one epoch.
pub struct DataLoaderIter<'a, R: Runtime, D> {
    loader: &'a DataLoader<R, D>,
    indices: Vec<usize>,
    batch_idx: usize,
    num_batches: usize,
}

impl<R, D> DataLoaderIter<'_, R, D>
where
    R: Runtime<DType = DType>,
    D: Dataset,
{
    /// Number of batches remaining in this epoch.
    pub fn remaining(&self) -> usize {
        self.num_batches - self.batch_idx
    }

    /// Index of the next batch within the epoch.
    pub fn position(&self) -> usize {
        self.batch_idx
    }

    fn advance(&mut self) -> Result<Option<Batch<R>>> {
        if self.batch_idx >= self.num_batches {
            return Ok(None);
        }
        let start = self.batch_idx * self.loader.batch_size;
        let end = (start + self.loader.batch_size).min(self.indices.len());
        let batch = collate_batch(&self.loader.dataset, &self.indices[start..end], &self.loader.device)?;
        self.batch_idx += 1;
        Ok(Some(batch))
    }
}

impl<R, D> Iterator for DataLoaderIter<'_, R, D>
where
    R: Runtime<DType = DType>,
    D: Dataset,
{
    type Item = Result<Batch<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<R, D> ExactSizeIterator for DataLoaderIter<'_, R, D>
where
    R: Runtime<DType = DType>,
    D: Dataset,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::SequenceDataset;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn loader(
        n_tokens: u32,
        rank: usize,
        world: usize,
        drop_last: bool,
    ) -> DataLoader<CpuRuntime, SequenceDataset> {
        let ds = SequenceDataset::new((0..n_tokens).collect::<Vec<u32>>().into(), 4, 4).unwrap();
        let sampler = DistributedSampler::new(ds.len(), rank, world, true, 5, drop_last).unwrap();
        DataLoader::new(ds, sampler, 2, CpuDevice::new()).unwrap()
    }

    #[test]
    fn test_batch_count_drop_last() {
        // 101 tokens -> 24 examples -> 12 per rank -> 6 batches of 2
        let l = loader(101, 0, 2, true);
        assert_eq!(l.dataset().len(), 24);
        assert_eq!(l.num_batches(), 6);
        let batches: Vec<_> = l.iter(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 6);
        assert!(batches.iter().all(|b| b.inputs.shape() == [2, 4]));
    }

    #[test]
    fn test_partial_batch_kept_without_drop_last() {
        // 25 examples over 2 ranks -> 13 each (padded) -> 7 batches, last of 1
        let l = loader(104, 1, 2, false);
        assert_eq!(l.dataset().len(), 25);
        assert_eq!(l.num_batches(), 7);
        let batches: Vec<_> = l.iter(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.last().unwrap().inputs.shape(), &[1, 4]);
    }

    #[test]
    fn test_iter_from_matches_skipping() {
        let l = loader(101, 1, 2, true);
        let full: Vec<Vec<i64>> = l
            .iter(3)
            .map(|b| b.unwrap().inputs.to_vec::<i64>())
            .collect();
        let resumed: Vec<Vec<i64>> = l
            .iter_from(LoaderCursor { epoch: 3, batch: 4 })
            .map(|b| b.unwrap().inputs.to_vec::<i64>())
            .collect();
        assert_eq!(resumed.as_slice(), &full[4..]);
    }

    /// Batch shapes of `epoch`, written against the runtime-generic API.
    fn shapes<R: Runtime<DType = DType>, D: Dataset>(l: &DataLoader<R, D>, epoch: u64) -> Result<Vec<Vec<usize>>> {
        l.iter(epoch).map(|b| Ok(b?.targets.shape().to_vec())).collect()
    }

    #[test]
    fn test_generic_runtime_iteration() {
        let l = loader(101, 0, 2, true);
        let shapes = shapes(&l, 1).unwrap();
        assert_eq!(shapes.len(), 6);
        assert!(shapes.iter().all(|s| s == &[2, 4]));
    }

    #[test]
    fn test_cursor_past_end() {
        let l = loader(101, 0, 2, true);
        let it = l.iter_from(LoaderCursor { epoch: 0, batch: 99 });
        assert_eq!(it.len(), 0);
    }

    #[test]
    fn test_remaining_counts_down() {
        let l = loader(101, 0, 2, true);
        let mut it = l.iter(0);
        assert_eq!(it.remaining(), 6);
        it.next().unwrap().unwrap();
        assert_eq!(it.remaining(), 5);
        assert_eq!(it.position(), 1);
    }
}
