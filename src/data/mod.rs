//! Dataset materialization for the age regression experiment
//!
//! This module reads the CSV manifest, partitions its records into the
//! train/validation/test splits, decodes and transforms every referenced
//! image, and stacks the results into fixed in-memory tensors that the
//! training loop slices into batches.

pub mod batching;
pub mod dataset;
pub mod manifest;
pub mod split;
pub mod transforms;

// Re-exports
pub use batching::{num_full_batches, Batch, BatchIter, RemainderPolicy};
pub use dataset::{ImageSplit, TensorDataset};
pub use manifest::{Manifest, ManifestRecord};
pub use split::{train_test_split, DatasetSplits};
pub use transforms::{EvalTransform, ImageTransform, TrainTransform};

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Manifest not found: {path}")]
    ManifestNotFound { path: String },

    #[error("Manifest is missing column '{column}'")]
    MissingColumn { column: String },

    #[error("Malformed manifest row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("Manifest contains no records")]
    EmptyManifest,

    #[error("Split '{split}' is empty")]
    EmptySplit { split: &'static str },

    #[error("Failed to decode image {path}: {source}")]
    ImageDecode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Inputs and targets disagree on sample count: {inputs} vs {targets}")]
    LengthMismatch { inputs: usize, targets: usize },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
