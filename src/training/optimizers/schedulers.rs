//! Learning rate schedulers driven once per epoch
//!
//! [`ReduceOnPlateauScheduler`] watches the validation loss and multiplies the
//! learning rate by a fixed factor once the loss has stopped improving for
//! longer than its patience. [`ConstantScheduler`] never changes the rate.

use std::collections::VecDeque;

use tracing::{debug, info};

use super::Scheduler;
use crate::training::config::{PlateauConfig, ThresholdMode};

/// Reduce the learning rate when a minimized metric stops improving
#[derive(Debug, Clone)]
pub struct ReduceOnPlateauScheduler {
    base_lr: f64,
    current_lr: f64,
    config: PlateauConfig,

    /// Best metric seen so far
    best: f64,

    /// Consecutive epochs without improvement since the last reset
    num_bad_epochs: usize,

    /// Epochs left before bad epochs are counted again
    cooldown_counter: usize,

    /// Most recent metrics, oldest first
    recent: VecDeque<f64>,

    /// Number of reductions applied
    reductions: usize,

    /// Epochs observed
    current_step: usize,
}

impl ReduceOnPlateauScheduler {
    /// Create a new plateau scheduler starting at `base_lr`
    pub fn new(base_lr: f64, config: PlateauConfig) -> Self {
        let window = config.patience + 1;
        Self {
            base_lr,
            current_lr: base_lr,
            config,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
            recent: VecDeque::with_capacity(window),
            reductions: 0,
            current_step: 0,
        }
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.config.threshold_mode {
            ThresholdMode::Rel => metric < self.best * (1.0 - self.config.threshold),
            ThresholdMode::Abs => metric < self.best - self.config.threshold,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    fn reduce_lr(&mut self) {
        let old_lr = self.current_lr;
        let new_lr = (old_lr * self.config.factor).max(self.config.min_lr);
        if old_lr - new_lr > self.config.eps {
            self.current_lr = new_lr;
            self.reductions += 1;
            info!(
                "Epoch {}: reducing learning rate from {:.4e} to {:.4e}",
                self.current_step, old_lr, new_lr
            );
        }
    }

    /// Best metric seen so far (`+inf` before the first step)
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Consecutive non-improving epochs counted towards the next reduction
    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    /// Number of reductions applied so far
    pub fn reductions(&self) -> usize {
        self.reductions
    }

    /// The last `patience + 1` observed metrics, oldest first
    pub fn recent_metrics(&self) -> impl Iterator<Item = f64> + '_ {
        self.recent.iter().copied()
    }
}

impl Scheduler for ReduceOnPlateauScheduler {
    fn name(&self) -> &str {
        "reduce_on_plateau"
    }

    fn step(&mut self, metric: Option<f64>) {
        let Some(metric) = metric else {
            debug!("Plateau scheduler stepped without a metric; ignoring");
            return;
        };
        self.current_step += 1;

        if self.recent.len() > self.config.patience {
            self.recent.pop_front();
        }
        self.recent.push_back(metric);

        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.config.patience {
            self.reduce_lr();
            self.cooldown_counter = self.config.cooldown;
            self.num_bad_epochs = 0;
        }
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn reset(&mut self) {
        *self = Self::new(self.base_lr, self.config.clone());
    }
}

/// Constant learning rate
#[derive(Debug, Clone)]
pub struct ConstantScheduler {
    base_lr: f64,
    current_step: usize,
}

impl ConstantScheduler {
    /// Create a new constant scheduler
    pub fn new(base_lr: f64) -> Self {
        Self {
            base_lr,
            current_step: 0,
        }
    }
}

impl Scheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn step(&mut self, _metric: Option<f64>) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.base_lr
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}
