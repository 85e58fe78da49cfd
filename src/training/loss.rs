//! Regression loss functions

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Loss between model outputs and targets
pub trait LossFunction: Send + Sync {
    /// Loss name used in logs
    fn name(&self) -> &str;

    /// Scalar loss for `predictions` (`[B, 1]`) against `targets` (`[B]`)
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;
}

/// Mean squared error, averaged over the batch
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl LossFunction for MseLoss {
    fn name(&self) -> &str {
        "mse"
    }

    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let targets = targets.unsqueeze(1)?.to_dtype(predictions.dtype())?;
        if predictions.dims() != targets.dims() {
            return Err(Error::invalid_input(format!(
                "Prediction shape {:?} does not match target shape {:?}",
                predictions.dims(),
                targets.dims()
            )));
        }
        Ok(candle_nn::loss::mse(predictions, &targets)?)
    }
}

/// Read a scalar loss tensor as `f64`
pub fn loss_value(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
