//! In-memory tensor datasets built from manifest splits

use std::path::Path;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use super::batching::{BatchIter, RemainderPolicy};
use super::transforms::{to_tensor, ImageTransform};
use super::{DataError, ManifestRecord};

/// Paired input and target tensors sharing a leading sample dimension
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Tensor,
    targets: Tensor,
}

impl TensorDataset {
    /// Pair `inputs` (`[N, ...]`) with `targets` (`[N]`)
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self, DataError> {
        let n_inputs = inputs.dims().first().copied().unwrap_or(0);
        let n_targets = targets.dims().first().copied().unwrap_or(0);
        if n_inputs != n_targets || targets.rank() != 1 {
            return Err(DataError::LengthMismatch {
                inputs: n_inputs,
                targets: n_targets,
            });
        }
        Ok(Self { inputs, targets })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    /// Whether the dataset holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All inputs, `[N, ...]`
    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    /// All targets, `[N]`
    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    /// Device the tensors live on
    pub fn device(&self) -> &Device {
        self.inputs.device()
    }

    /// Contiguous `len` samples starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> Result<(Tensor, Tensor), DataError> {
        Ok((
            self.inputs.narrow(0, offset, len)?,
            self.targets.narrow(0, offset, len)?,
        ))
    }

    /// Iterate over consecutive batches in sample order
    pub fn batches(&self, batch_size: usize, policy: RemainderPolicy) -> BatchIter<'_> {
        BatchIter::new(self, batch_size, policy)
    }

    /// Move both tensors to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self, DataError> {
        Ok(Self {
            inputs: self.inputs.to_device(device)?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// A materialized split: its manifest records and the matching tensors
#[derive(Debug, Clone)]
pub struct ImageSplit {
    /// Split name used in logs
    pub name: &'static str,
    /// Records in tensor order
    pub records: Vec<ManifestRecord>,
    /// Images `[N, 3, S, S]` and labels `[N]`
    pub data: TensorDataset,
}

impl ImageSplit {
    /// Decode, transform, and stack every image referenced by `records`.
    ///
    /// Sample `i` draws its augmentation randomness from a generator seeded by
    /// `seed` and `i`, so the result does not depend on decode order.
    #[instrument(skip(records, image_dir, transform, device), fields(samples = records.len()))]
    pub fn materialize(
        name: &'static str,
        records: Vec<ManifestRecord>,
        image_dir: &Path,
        transform: &dyn ImageTransform,
        seed: u64,
        device: &Device,
    ) -> Result<Self, DataError> {
        info!(
            "Materializing {} split: {} images at {}x{}",
            name,
            records.len(),
            transform.output_size(),
            transform.output_size()
        );

        let progress = ProgressBar::new(records.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_message(format!("Loading {name}"));

        let images = records
            .par_iter()
            .enumerate()
            .map(|(index, record)| -> Result<Tensor, DataError> {
                let path = record.image_path(image_dir);
                let decoded = image::open(&path)
                    .map_err(|source| DataError::ImageDecode {
                        path: path.display().to_string(),
                        source,
                    })?
                    .to_rgb8();
                let mut rng = StdRng::seed_from_u64(sample_seed(seed, index));
                let transformed = transform.apply(decoded, &mut rng);
                let tensor = to_tensor(&transformed, &Device::Cpu)?;
                progress.inc(1);
                Ok(tensor)
            })
            .collect::<Result<Vec<_>, _>>()?;
        progress.finish_and_clear();

        let inputs = Tensor::stack(&images, 0)?.to_device(device)?;
        let labels: Vec<f32> = records.iter().map(|r| r.label as f32).collect();
        let targets = Tensor::from_vec(labels, records.len(), device)?;
        debug!("{} split tensors: inputs {:?}, targets {:?}", name, inputs.dims(), targets.dims());

        Ok(Self {
            name,
            records,
            data: TensorDataset::new(inputs, targets)?,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the split holds no samples
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn sample_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
