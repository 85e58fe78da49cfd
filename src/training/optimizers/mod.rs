//! Optimizers and learning rate schedulers
//!
//! Optimizers update the trainable variables of the regressor from a
//! gradient store; schedulers decide the learning rate from one epoch to the
//! next. The training loop owns one of each and copies the scheduler's rate
//! into the optimizer after every epoch.

pub mod adam;
pub mod schedulers;
pub mod sgd;

pub use adam::AdamOptimizer;
pub use schedulers::{ConstantScheduler, ReduceOnPlateauScheduler};
pub use sgd::SgdOptimizer;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use crate::error::Result;
use crate::training::config::{OptimizerConfig, OptimizerType, SchedulerConfig};

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from precomputed gradients
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Backpropagate `loss` and apply one update
    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let gradients = loss.backward()?;
        self.step(&gradients)
    }

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of scalar parameters being optimized
    fn parameter_count(&self) -> usize;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one epoch, observing the monitored metric if the policy uses one
    fn step(&mut self, metric: Option<f64>);

    /// Get current learning rate
    fn get_lr(&self) -> f64;

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Boxed optimizer built from configuration
pub struct OptimizerState {
    optimizer: Box<dyn Optimizer + Send>,
}

/// Boxed scheduler built from configuration
pub struct SchedulerState {
    scheduler: Box<dyn Scheduler + Send>,
}

impl OptimizerState {
    /// Wrap an optimizer
    pub fn new(optimizer: Box<dyn Optimizer + Send>) -> Self {
        Self { optimizer }
    }
}

impl Optimizer for OptimizerState {
    fn name(&self) -> &str {
        self.optimizer.name()
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.optimizer.step(gradients)
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    fn parameter_count(&self) -> usize {
        self.optimizer.parameter_count()
    }

    fn step_count(&self) -> usize {
        self.optimizer.step_count()
    }
}

impl SchedulerState {
    /// Wrap a scheduler
    pub fn new(scheduler: Box<dyn Scheduler + Send>) -> Self {
        Self { scheduler }
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// Step the scheduler
    pub fn step(&mut self, metric: Option<f64>) {
        self.scheduler.step(metric);
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }

    /// Reset scheduler
    pub fn reset(&mut self) {
        self.scheduler.reset();
    }
}

/// Create optimizer from configuration over the given trainable variables
pub fn create_optimizer(config: &OptimizerConfig, vars: Vec<Var>) -> Result<OptimizerState> {
    let optimizer: Box<dyn Optimizer + Send> = match config.optimizer_type {
        OptimizerType::Adam => Box::new(AdamOptimizer::new(
            vars,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            0.0,
        )?),
        OptimizerType::AdamW => Box::new(AdamOptimizer::new(
            vars,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )?),
        OptimizerType::Sgd => Box::new(SgdOptimizer::new(
            vars,
            config.learning_rate,
            config.momentum,
            config.weight_decay,
        )?),
    };

    debug!(
        "Created {} optimizer over {} parameters",
        optimizer.name(),
        optimizer.parameter_count()
    );
    Ok(OptimizerState::new(optimizer))
}

/// Create scheduler from configuration
pub fn create_scheduler(config: &SchedulerConfig, base_lr: f64) -> SchedulerState {
    let scheduler: Box<dyn Scheduler + Send> = match config {
        SchedulerConfig::ReduceOnPlateau(plateau) => {
            Box::new(ReduceOnPlateauScheduler::new(base_lr, plateau.clone()))
        }
        SchedulerConfig::Constant => Box::new(ConstantScheduler::new(base_lr)),
    };
    SchedulerState::new(scheduler)
}

fn count_parameters(vars: &[Var]) -> usize {
    vars.iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::config::PlateauConfig;
    use candle_core::{DType, Device};

    fn vars() -> Vec<Var> {
        vec![
            Var::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            Var::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        ]
    }

    #[test]
    fn test_create_optimizer_by_type() {
        for (optimizer_type, name) in [
            (OptimizerType::Adam, "adam"),
            (OptimizerType::AdamW, "adamw"),
            (OptimizerType::Sgd, "sgd"),
        ] {
            let config = OptimizerConfig {
                optimizer_type,
                weight_decay: if optimizer_type == OptimizerType::AdamW { 0.01 } else { 0.0 },
                ..OptimizerConfig::default()
            };
            let optimizer = create_optimizer(&config, vars()).unwrap();
            assert_eq!(optimizer.name(), name);
            assert_eq!(optimizer.parameter_count(), 9);
            assert_eq!(optimizer.learning_rate(), 1e-3);
        }
    }

    #[test]
    fn test_create_scheduler_by_type() {
        let plateau = create_scheduler(
            &SchedulerConfig::ReduceOnPlateau(PlateauConfig::default()),
            0.01,
        );
        assert_eq!(plateau.name(), "reduce_on_plateau");
        assert_eq!(plateau.get_lr(), 0.01);

        let mut constant = create_scheduler(&SchedulerConfig::Constant, 0.01);
        constant.step(Some(5.0));
        assert_eq!(constant.name(), "constant");
        assert_eq!(constant.get_lr(), 0.01);
    }
}
