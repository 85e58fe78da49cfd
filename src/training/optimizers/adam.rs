//! Adam optimizer with optional decoupled weight decay
//!
//! With a zero weight decay this is plain Adam; otherwise it is AdamW. The
//! moment estimates and bias correction are delegated to candle's AdamW.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::optim::{AdamW, ParamsAdamW};
use candle_nn::Optimizer as CandleOptimizer;

use super::{count_parameters, Optimizer};
use crate::error::Result;

/// Adam / AdamW optimizer
pub struct AdamOptimizer {
    inner: AdamW,
    weight_decay: f64,
    step_count: usize,
    parameter_count: usize,
}

impl AdamOptimizer {
    /// Create a new Adam optimizer over `vars`
    pub fn new(
        vars: Vec<Var>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        let parameter_count = count_parameters(&vars);
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1,
            beta2,
            eps: epsilon,
            weight_decay,
        };

        Ok(Self {
            inner: AdamW::new(vars, params)?,
            weight_decay,
            step_count: 0,
            parameter_count,
        })
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        if self.weight_decay > 0.0 {
            "adamw"
        } else {
            "adam"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.inner.step(gradients)?;
        self.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
