//! SGD optimizer with optional momentum and weight decay

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use super::{count_parameters, Optimizer};
use crate::error::Result;

/// Stochastic gradient descent
pub struct SgdOptimizer {
    vars: Vec<Var>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    step_count: usize,
    /// One buffer per variable, created on its first update
    momentum_buffers: Vec<Option<Tensor>>,
    parameter_count: usize,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer over `vars`
    pub fn new(vars: Vec<Var>, learning_rate: f64, momentum: f64, weight_decay: f64) -> Result<Self> {
        let parameter_count = count_parameters(&vars);
        let momentum_buffers = vec![None; vars.len()];

        Ok(Self {
            vars,
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers,
            parameter_count,
        })
    }

    fn update_parameter(&mut self, index: usize, grad: &Tensor) -> Result<()> {
        let var = &self.vars[index];

        // g + λθ
        let effective_grad = if self.weight_decay > 0.0 {
            (grad + (var.as_tensor() * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        // v_t = μ v_{t-1} + g
        let update = if self.momentum > 0.0 {
            let next = match &self.momentum_buffers[index] {
                Some(buffer) => ((buffer * self.momentum)? + &effective_grad)?,
                None => effective_grad,
            };
            self.momentum_buffers[index] = Some(next.clone());
            next
        } else {
            effective_grad
        };

        var.set(&var.as_tensor().sub(&(update * self.learning_rate)?)?)?;
        Ok(())
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        for index in 0..self.vars.len() {
            if let Some(grad) = gradients.get(self.vars[index].as_tensor()) {
                let grad = grad.clone();
                self.update_parameter(index, &grad)?;
            }
        }
        self.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
