//! Age regressor - fine-tunes a pretrained ResNet to predict age from images
//!
//! The experiment reads a CSV manifest, splits it into train, validation and
//! test partitions, materializes every split as in-memory tensors, trains a
//! single-output regressor with early stopping and plateau learning-rate
//! reduction, and evaluates and reports the test-split errors.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod report;
pub mod training;

// Re-exports
pub use config::{DeviceConfig, ExperimentConfig};
pub use data::{DatasetSplits, ImageSplit, Manifest, ManifestRecord, TensorDataset};
pub use error::{Error, Result};
pub use evaluation::{Evaluation, Evaluator, Predictions, RegressionMetrics};
pub use model::AgeRegressor;
pub use report::{ErrorSubsets, Report, Reporter};
pub use training::{Trainer, TrainingEvent, TrainingResult};

use candle_core::Device;
use tracing::{debug, info, instrument};

use crate::data::{EvalTransform, TrainTransform};
use crate::training::create_optimizer;

/// The three materialized splits
#[derive(Debug, Clone)]
pub struct MaterializedSplits {
    pub train: ImageSplit,
    pub validation: ImageSplit,
    pub test: ImageSplit,
}

/// Results of a full experiment run
#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub training: TrainingResult,
    pub evaluation: Evaluation,
    pub report: Report,
}

/// One age regression experiment
pub struct AgeRegression {
    config: ExperimentConfig,
    device: Device,
}

impl AgeRegression {
    /// Validate the configuration and select the compute device
    #[instrument(skip(config))]
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let device = config.runtime.device.resolve()?;
        info!("Using device {:?}", device);
        Ok(Self { config, device })
    }

    /// Run every stage: materialize, build, train, evaluate, report
    pub fn run(&self, on_event: impl FnMut(&TrainingEvent) + Send + 'static) -> Result<ExperimentOutcome> {
        let splits = self.load_splits()?;
        let model = self.build_model()?;
        let training = self.train(&model, &splits, on_event)?;
        let evaluation = self.evaluate(&model, &splits.test)?;
        let report = self.report(&splits.test, &evaluation)?;

        Ok(ExperimentOutcome {
            training,
            evaluation,
            report,
        })
    }

    /// Read the manifest, partition it, and materialize each split
    #[instrument(skip(self))]
    pub fn load_splits(&self) -> Result<MaterializedSplits> {
        let data = &self.config.data;
        let manifest = Manifest::from_csv(&data.manifest_path, &data.filename_column, &data.label_column)?;
        let splits = DatasetSplits::partition(
            manifest.records(),
            data.split.holdout_fraction,
            data.split.test_fraction,
            data.split.seed,
        )?;

        let materialize = || -> Result<MaterializedSplits> {
            let train_transform = TrainTransform::new(data.image_size, data.augmentation.clone());
            let eval_transform = EvalTransform::new(data.image_size);
            let seed = data.split.seed;

            Ok(MaterializedSplits {
                train: ImageSplit::materialize(
                    "train",
                    splits.train.clone(),
                    &data.image_dir,
                    &train_transform,
                    seed,
                    &self.device,
                )?,
                validation: ImageSplit::materialize(
                    "validation",
                    splits.validation.clone(),
                    &data.image_dir,
                    &eval_transform,
                    seed,
                    &self.device,
                )?,
                test: ImageSplit::materialize(
                    "test",
                    splits.test.clone(),
                    &data.image_dir,
                    &eval_transform,
                    seed,
                    &self.device,
                )?,
            })
        };

        match self.config.runtime.num_threads {
            Some(threads) => {
                debug!("Decoding images on {} threads", threads);
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| Error::internal(format!("Failed to build decoder pool: {e}")))?;
                pool.install(materialize)
            }
            None => materialize(),
        }
    }

    /// Build the regressor with the configured backbone and weights
    pub fn build_model(&self) -> Result<AgeRegressor> {
        AgeRegressor::new(&self.config.model, &self.device)
    }

    /// Train `model` on the train split, validating on the validation split
    pub fn train(
        &self,
        model: &AgeRegressor,
        splits: &MaterializedSplits,
        on_event: impl FnMut(&TrainingEvent) + Send + 'static,
    ) -> Result<TrainingResult> {
        let mut optimizer = create_optimizer(&self.config.optimizer, model.trainable_vars()?)?;
        let mut trainer = Trainer::new(self.config.training.clone())?.with_event_monitoring(on_event);
        trainer.fit(model, &mut optimizer, &splits.train.data, &splits.validation.data)
    }

    /// Evaluate `model` on a split
    pub fn evaluate(&self, model: &AgeRegressor, split: &ImageSplit) -> Result<Evaluation> {
        Evaluator::new(&self.config.evaluation)?.evaluate(model, &split.data)
    }

    /// Select error subsets and render panels for an evaluated split.
    ///
    /// Records that fell into a dropped evaluation batch are excluded.
    pub fn report(&self, split: &ImageSplit, evaluation: &Evaluation) -> Result<Report> {
        let records = &split.records[..evaluation.predictions.len().min(split.records.len())];
        Reporter::new(self.config.report.clone(), &self.config.data.image_dir)
            .report(records, &evaluation.predictions)
    }

    /// Get the current configuration
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Compute device in use
    pub fn device(&self) -> &Device {
        &self.device
    }
}
