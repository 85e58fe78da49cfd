//! Training infrastructure for the age regressor
//!
//! # Main Components
//!
//! - **Configuration**: loop parameters, early stopping, LR schedule, optimizer
//! - **Trainer**: the epoch loop over fixed in-memory splits
//! - **Early stopping**: best-loss tracking with a patience counter
//! - **Optimizers**: Adam/AdamW and SGD, plus plateau and constant schedulers
//! - **Loss**: mean squared error
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use age_regressor::training::{create_optimizer, Trainer, TrainingParams, OptimizerConfig};
//!
//! let mut optimizer = create_optimizer(&OptimizerConfig::default(), model.trainable_vars()?)?;
//! let mut trainer = Trainer::new(TrainingParams::default())?;
//! let result = trainer.fit(&model, &mut optimizer, &train.data, &validation.data)?;
//! ```

pub mod config;
pub mod early_stopping;
pub mod loss;
pub mod optimizers;
pub mod trainer;

// Configuration re-exports
pub use config::{
    EarlyStoppingConfig, OptimizerConfig, OptimizerType, PlateauConfig, SchedulerConfig,
    ThresholdMode, TrainingParams,
};

// Trainer re-exports
pub use trainer::{
    EpochRecord, StopReason, Trainer, TrainingEvent, TrainingResult, TrainingState,
    TrainingStatus,
};

pub use early_stopping::{EarlyStopping, StopDecision};
pub use loss::{LossFunction, MseLoss};
pub use optimizers::{
    create_optimizer, create_scheduler, Optimizer, OptimizerState, Scheduler, SchedulerState,
};
