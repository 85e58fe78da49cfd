//! Fixed-size batching over in-memory tensor datasets
//!
//! A batch is a contiguous, non-overlapping slice of a split. What happens to
//! the trailing partial slice is an explicit [`RemainderPolicy`] rather than an
//! incidental truncation: training drops it, evaluation keeps it.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DataError, TensorDataset};

/// What to do with the samples left over after the last full batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Exclude the trailing partial batch
    Drop,
    /// Emit the trailing partial batch as a shorter final batch
    Keep,
}

impl Default for RemainderPolicy {
    fn default() -> Self {
        Self::Drop
    }
}

/// Number of full batches of `batch_size` in `len` samples.
pub fn num_full_batches(len: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        len / batch_size
    }
}

impl RemainderPolicy {
    /// Number of batches produced for `len` samples under this policy
    pub fn num_batches(&self, len: usize, batch_size: usize) -> usize {
        match self {
            RemainderPolicy::Drop => num_full_batches(len, batch_size),
            RemainderPolicy::Keep if batch_size == 0 => 0,
            RemainderPolicy::Keep => len.div_ceil(batch_size),
        }
    }

    /// Number of samples excluded from an epoch under this policy
    pub fn dropped_samples(&self, len: usize, batch_size: usize) -> usize {
        match self {
            RemainderPolicy::Drop if batch_size > 0 => len % batch_size,
            RemainderPolicy::Drop => len,
            RemainderPolicy::Keep => 0,
        }
    }
}

/// A contiguous slice of a dataset
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based batch index within the epoch
    pub index: usize,
    /// Offset of the first sample in the split
    pub offset: usize,
    /// Inputs, first dimension is the batch dimension
    pub inputs: Tensor,
    /// Targets `[batch]`
    pub targets: Tensor,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.targets.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator yielding batches of a [`TensorDataset`] in split order
pub struct BatchIter<'a> {
    dataset: &'a TensorDataset,
    batch_size: usize,
    num_batches: usize,
    next: usize,
}

impl<'a> BatchIter<'a> {
    pub(crate) fn new(dataset: &'a TensorDataset, batch_size: usize, policy: RemainderPolicy) -> Self {
        let num_batches = policy.num_batches(dataset.len(), batch_size);
        debug!(
            "Batching {} samples into {} batches of {} ({:?}, {} dropped)",
            dataset.len(),
            num_batches,
            batch_size,
            policy,
            policy.dropped_samples(dataset.len(), batch_size)
        );
        Self {
            dataset,
            batch_size,
            num_batches,
            next: 0,
        }
    }

    /// Total number of batches this iterator yields
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.num_batches {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let offset = index * self.batch_size;
        let len = self.batch_size.min(self.dataset.len() - offset);
        let batch = self
            .dataset
            .slice(offset, len)
            .map(|(inputs, targets)| Batch {
                index,
                offset,
                inputs,
                targets,
            });
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use test_case::test_case;

    fn dataset(len: usize) -> TensorDataset {
        let device = Device::Cpu;
        let inputs: Vec<f32> = (0..len * 2).map(|v| v as f32).collect();
        let targets: Vec<f32> = (0..len).map(|v| v as f32).collect();
        TensorDataset::new(
            Tensor::from_vec(inputs, (len, 2), &device).unwrap(),
            Tensor::from_vec(targets, len, &device).unwrap(),
        )
        .unwrap()
    }

    #[test_case(53, 8, 6, 5 ; "fifty three by eight")]
    #[test_case(48, 8, 6, 0 ; "exact multiple")]
    #[test_case(7, 8, 0, 7 ; "smaller than one batch")]
    #[test_case(0, 8, 0, 0 ; "empty split")]
    fn test_drop_policy_counts(len: usize, batch: usize, batches: usize, dropped: usize) {
        assert_eq!(num_full_batches(len, batch), batches);
        assert_eq!(RemainderPolicy::Drop.num_batches(len, batch), batches);
        assert_eq!(RemainderPolicy::Drop.dropped_samples(len, batch), dropped);
    }

    #[test]
    fn test_keep_policy_counts() {
        assert_eq!(RemainderPolicy::Keep.num_batches(53, 8), 7);
        assert_eq!(RemainderPolicy::Keep.dropped_samples(53, 8), 0);
        assert_eq!(RemainderPolicy::Keep.num_batches(0, 8), 0);
    }

    #[test]
    fn test_drop_excludes_trailing_samples() {
        let data = dataset(53);
        let batches: Vec<Batch> = data
            .batches(8, RemainderPolicy::Drop)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(batches.len(), 6);
        assert!(batches.iter().all(|b| b.len() == 8));

        let last = batches.last().unwrap();
        assert_eq!(last.offset, 40);
        let targets = last.targets.to_vec1::<f32>().unwrap();
        assert_eq!(targets, (40..48).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_keep_emits_short_final_batch() {
        let data = dataset(53);
        let batches: Vec<Batch> = data
            .batches(8, RemainderPolicy::Keep)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(batches.len(), 7);
        assert_eq!(batches[6].len(), 5);
        assert_eq!(batches[6].inputs.dims(), &[5, 2]);
    }

    #[test]
    fn test_batches_are_contiguous_and_ordered() {
        let data = dataset(24);
        let mut expected = 0.0f32;
        for batch in data.batches(8, RemainderPolicy::Drop) {
            let batch = batch.unwrap();
            for value in batch.targets.to_vec1::<f32>().unwrap() {
                assert_eq!(value, expected);
                expected += 1.0;
            }
        }
        assert_eq!(expected, 24.0);
    }
}
