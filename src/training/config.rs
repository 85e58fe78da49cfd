//! Training configuration: loop parameters, stopping and LR policies, optimizer

use serde::{Deserialize, Serialize};

use crate::data::RemainderPolicy;
use crate::error::{Error, Result};

/// Core training loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Epoch budget
    pub max_epochs: usize,

    /// Mini-batch size
    pub batch_size: usize,

    /// Handling of the trailing partial training batch
    pub remainder: RemainderPolicy,

    /// Validation chunk size; the whole split goes through one forward pass when unset
    pub validation_batch_size: Option<usize>,

    /// Early stopping policy
    pub early_stopping: EarlyStoppingConfig,

    /// Learning-rate adaptation policy
    pub scheduler: SchedulerConfig,
}

/// Early stopping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Enable early stopping
    pub enabled: bool,

    /// Number of consecutive non-improving epochs that stops training
    pub patience: usize,

    /// Minimum decrease below the best loss that counts as improvement
    pub min_delta: f64,
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Reduce the learning rate when validation loss plateaus
    ReduceOnPlateau(PlateauConfig),
    /// Keep the learning rate fixed
    Constant,
}

/// Parameters of the reduce-on-plateau policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// Non-improving epochs tolerated before a reduction
    pub patience: usize,

    /// Multiplicative reduction factor
    pub factor: f64,

    /// Improvement tolerance
    pub threshold: f64,

    /// How `threshold` is applied to the best loss
    pub threshold_mode: ThresholdMode,

    /// Epochs to wait after a reduction before counting again
    pub cooldown: usize,

    /// Lower bound on the learning rate
    pub min_lr: f64,

    /// Reductions smaller than this are skipped
    pub eps: f64,
}

/// Threshold interpretation for plateau detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// Improvement means `loss < best * (1 - threshold)`
    Rel,
    /// Improvement means `loss < best - threshold`
    Abs,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Beta1 parameter for Adam-based optimizers
    pub beta1: f64,

    /// Beta2 parameter for Adam-based optimizers
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,

    /// Weight decay coefficient (AdamW and SGD)
    pub weight_decay: f64,

    /// Momentum coefficient (SGD only)
    pub momentum: f64,
}

/// Optimizer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    Adam,
    AdamW,
    Sgd,
}

impl TrainingParams {
    /// Validate the loop parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        if self.validation_batch_size == Some(0) {
            return Err(Error::config("Validation batch size must be greater than 0"));
        }

        if self.early_stopping.enabled && self.early_stopping.patience == 0 {
            return Err(Error::config("Early stopping patience must be greater than 0"));
        }

        if self.early_stopping.min_delta < 0.0 {
            return Err(Error::config("Early stopping min_delta must be non-negative"));
        }

        if let SchedulerConfig::ReduceOnPlateau(plateau) = &self.scheduler {
            if !(plateau.factor > 0.0 && plateau.factor < 1.0) {
                return Err(Error::config("Plateau factor must be in (0.0, 1.0)"));
            }
            if plateau.threshold < 0.0 || plateau.min_lr < 0.0 || plateau.eps < 0.0 {
                return Err(Error::config(
                    "Plateau threshold, min_lr and eps must be non-negative",
                ));
            }
        }

        Ok(())
    }
}

impl OptimizerConfig {
    /// Validate the optimizer hyperparameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }

        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::config("SGD momentum must be in [0.0, 1.0)"));
        }

        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }

        Ok(())
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            max_epochs: 50,
            batch_size: 8,
            remainder: RemainderPolicy::Drop,
            validation_batch_size: None,
            early_stopping: EarlyStoppingConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patience: 10,
            min_delta: 0.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::ReduceOnPlateau(PlateauConfig::default())
    }
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            patience: 3,
            factor: 0.1,
            threshold: 1e-4,
            threshold_mode: ThresholdMode::Rel,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::Adam,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            momentum: 0.0,
        }
    }
}
