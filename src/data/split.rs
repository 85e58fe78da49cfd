//! Seeded train/validation/test partitioning

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use super::{DataError, ManifestRecord};

/// Split `items` into `(train, test)` parts.
///
/// The items are permuted with a generator seeded by `seed`; the first
/// `ceil(test_fraction * n)` permuted items form the test part and the rest,
/// still in permuted order, form the train part.
pub fn train_test_split<T: Clone>(items: &[T], test_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let n = items.len();
    let n_test = ((test_fraction * n as f64).ceil() as usize).min(n);

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test = indices[..n_test].iter().map(|&i| items[i].clone()).collect();
    let train = indices[n_test..].iter().map(|&i| items[i].clone()).collect();
    (train, test)
}

/// The three disjoint partitions of a manifest
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training records; their order determines mini-batch membership
    pub train: Vec<ManifestRecord>,
    /// Validation records
    pub validation: Vec<ManifestRecord>,
    /// Held-out test records
    pub test: Vec<ManifestRecord>,
}

impl DatasetSplits {
    /// Partition records with two sequential splits.
    ///
    /// The first split holds out `holdout_fraction` of the records; the second
    /// divides the holdout into validation and test using `test_fraction`.
    /// Both splits use the same seed.
    pub fn partition(
        records: &[ManifestRecord],
        holdout_fraction: f64,
        test_fraction: f64,
        seed: u64,
    ) -> Result<Self, DataError> {
        let (train, holdout) = train_test_split(records, holdout_fraction, seed);
        let (validation, test) = train_test_split(&holdout, test_fraction, seed);

        let splits = Self {
            train,
            validation,
            test,
        };
        splits.ensure_non_empty()?;

        info!(
            "Split {} records into train={}, validation={}, test={}",
            records.len(),
            splits.train.len(),
            splits.validation.len(),
            splits.test.len()
        );
        Ok(splits)
    }

    fn ensure_non_empty(&self) -> Result<(), DataError> {
        for (split, records) in [
            ("train", &self.train),
            ("validation", &self.validation),
            ("test", &self.test),
        ] {
            if records.is_empty() {
                return Err(DataError::EmptySplit { split });
            }
        }
        Ok(())
    }

    /// Total number of records across all splits
    pub fn total(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }
}
