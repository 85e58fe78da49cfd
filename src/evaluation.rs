//! Test-split evaluation and regression metrics

use std::fmt;

use candle_core::{DType, Module};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::EvaluationConfig;
use crate::data::{RemainderPolicy, TensorDataset};
use crate::error::{Error, Result};

/// Predicted and true values in sample order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    /// Model outputs
    pub predicted: Vec<f64>,
    /// Ground-truth labels
    pub actual: Vec<f64>,
}

impl Predictions {
    /// Pair predicted with true values
    pub fn new(predicted: Vec<f64>, actual: Vec<f64>) -> Result<Self> {
        if predicted.len() != actual.len() {
            return Err(Error::invalid_input(format!(
                "{} predictions for {} labels",
                predicted.len(),
                actual.len()
            )));
        }
        Ok(Self { predicted, actual })
    }

    /// Absolute error per sample
    pub fn absolute_errors(&self) -> Vec<f64> {
        self.actual
            .iter()
            .zip(&self.predicted)
            .map(|(t, p)| (t - p).abs())
            .collect()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.actual.len()
    }

    /// Whether there are no samples
    pub fn is_empty(&self) -> bool {
        self.actual.is_empty()
    }
}

/// Regression quality metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Mean squared error
    pub mse: f64,
    /// Root mean squared error
    pub rmse: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Coefficient of determination
    pub r2: f64,
}

impl RegressionMetrics {
    /// Compute metrics over paired predictions.
    ///
    /// R² is kept finite when the labels are constant: 1.0 for a perfect
    /// fit, 0.0 otherwise.
    pub fn compute(predictions: &Predictions) -> Result<Self> {
        if predictions.is_empty() {
            return Err(Error::invalid_input("Cannot compute metrics without samples"));
        }
        let n = predictions.len() as f64;

        let (ss_res, abs_sum) = predictions
            .actual
            .iter()
            .zip(&predictions.predicted)
            .fold((0.0, 0.0), |(sq, abs), (t, p)| {
                let diff = t - p;
                (sq + diff * diff, abs + diff.abs())
            });

        let mean = predictions.actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = predictions.actual.iter().map(|t| (t - mean).powi(2)).sum();

        let r2 = if ss_tot == 0.0 {
            if ss_res == 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            1.0 - ss_res / ss_tot
        };

        let mse = ss_res / n;
        Ok(Self {
            mse,
            rmse: mse.sqrt(),
            mae: abs_sum / n,
            r2,
        })
    }
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "R^2 Score: {:.4}", self.r2)?;
        writeln!(f, "MSE: {:.4}", self.mse)?;
        writeln!(f, "RMSE: {:.4}", self.rmse)?;
        write!(f, "MAE: {:.4}", self.mae)
    }
}

/// Predictions and metrics for one split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub predictions: Predictions,
    pub metrics: RegressionMetrics,
}

/// Runs a trained model over a split without gradient tracking
#[derive(Debug, Clone)]
pub struct Evaluator {
    batch_size: usize,
    remainder: RemainderPolicy,
}

impl Evaluator {
    /// Create an evaluator
    pub fn new(config: &EvaluationConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("Evaluation batch size must be greater than 0"));
        }
        Ok(Self {
            batch_size: config.batch_size,
            remainder: config.remainder,
        })
    }

    /// Predict every batch of `data` and compute metrics
    #[instrument(skip_all, fields(samples = data.len()))]
    pub fn evaluate<M: Module + ?Sized>(&self, model: &M, data: &TensorDataset) -> Result<Evaluation> {
        let mut predicted = Vec::with_capacity(data.len());
        let mut actual = Vec::with_capacity(data.len());

        for batch in data.batches(self.batch_size, self.remainder) {
            let batch = batch?;
            let outputs = model.forward(&batch.inputs)?.detach();
            predicted.extend(outputs.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?);
            actual.extend(batch.targets.to_dtype(DType::F64)?.to_vec1::<f64>()?);
        }

        let predictions = Predictions::new(predicted, actual)?;
        let metrics = RegressionMetrics::compute(&predictions)?;
        info!(
            "Evaluated {} samples: R^2 {:.4}, MSE {:.4}, RMSE {:.4}, MAE {:.4}",
            predictions.len(),
            metrics.r2,
            metrics.mse,
            metrics.rmse,
            metrics.mae
        );

        Ok(Evaluation {
            predictions,
            metrics,
        })
    }
}
