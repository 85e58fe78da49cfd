//! Early stopping on the validation loss

use serde::{Deserialize, Serialize};

use crate::training::config::EarlyStoppingConfig;

/// Outcome of observing one epoch's validation loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopDecision {
    /// Keep training
    Continue,
    /// Patience exhausted
    Stop,
}

/// Tracks the best validation loss and the epochs elapsed since it.
///
/// A loss improves only if it is strictly below `best - min_delta`; a loss
/// equal to the best counts as non-improving.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    enabled: bool,
    best_loss: f64,
    best_epoch: Option<usize>,
    counter: usize,
    observed: usize,
}

impl EarlyStopping {
    /// Create a fresh tracker (`best = +inf`, counter 0)
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            min_delta: config.min_delta,
            enabled: config.enabled,
            best_loss: f64::INFINITY,
            best_epoch: None,
            counter: 0,
            observed: 0,
        }
    }

    /// Observe the validation loss of the next epoch
    pub fn observe(&mut self, val_loss: f64) -> StopDecision {
        self.observed += 1;

        if val_loss < self.best_loss - self.min_delta {
            self.best_loss = val_loss;
            self.best_epoch = Some(self.observed);
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        if self.enabled && self.counter >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    /// Best validation loss so far (`+inf` before any observation)
    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    /// One-based epoch of the best validation loss
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Consecutive non-improving epochs
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Configured patience
    pub fn patience(&self) -> usize {
        self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker(patience: usize) -> EarlyStopping {
        EarlyStopping::new(&EarlyStoppingConfig {
            enabled: true,
            patience,
            min_delta: 0.0,
        })
    }

    #[test]
    fn test_equal_loss_is_not_an_improvement() {
        let mut stopping = tracker(3);
        assert_eq!(stopping.observe(1.0), StopDecision::Continue);
        assert_eq!(stopping.observe(1.0), StopDecision::Continue);
        assert_eq!(stopping.counter(), 1);
        assert_eq!(stopping.best_epoch(), Some(1));
    }

    #[test]
    fn test_stops_when_counter_reaches_patience() {
        let mut stopping = tracker(3);
        let decisions: Vec<_> = [1.0, 0.9, 0.95, 0.95, 0.95]
            .into_iter()
            .map(|loss| stopping.observe(loss))
            .collect();
        assert_eq!(
            decisions,
            vec![
                StopDecision::Continue,
                StopDecision::Continue,
                StopDecision::Continue,
                StopDecision::Continue,
                StopDecision::Stop,
            ]
        );
        assert_eq!(stopping.best_loss(), 0.9);
        assert_eq!(stopping.best_epoch(), Some(2));
    }

    #[test]
    fn test_min_delta_requires_margin() {
        let mut stopping = EarlyStopping::new(&EarlyStoppingConfig {
            enabled: true,
            patience: 5,
            min_delta: 0.1,
        });
        stopping.observe(1.0);
        stopping.observe(0.95);
        assert_eq!(stopping.best_loss(), 1.0);
        stopping.observe(0.85);
        assert_eq!(stopping.best_loss(), 0.85);
    }

    #[test]
    fn test_disabled_never_stops_but_tracks_best() {
        let mut stopping = EarlyStopping::new(&EarlyStoppingConfig {
            enabled: false,
            patience: 1,
            min_delta: 0.0,
        });
        for loss in [0.5, 1.0, 1.0, 1.0] {
            assert_eq!(stopping.observe(loss), StopDecision::Continue);
        }
        assert_eq!(stopping.best_loss(), 0.5);
    }

    proptest! {
        #[test]
        fn prop_stops_exactly_patience_epochs_after_best(
            improving in prop::collection::vec(0.0f64..1.0, 1..10),
            patience in 1usize..12,
            plateau_offsets in prop::collection::vec(0.0f64..5.0, 12),
        ) {
            // Strictly decreasing prefix, then losses never below the best
            let mut losses: Vec<f64> = Vec::new();
            let mut level = 100.0;
            for step in &improving {
                level -= 1.0 + step;
                losses.push(level);
            }
            let best_epoch = losses.len();
            losses.extend(plateau_offsets.iter().map(|offset| level + offset));

            let mut stopping = tracker(patience);
            let stop_epoch = losses
                .iter()
                .position(|&loss| stopping.observe(loss) == StopDecision::Stop)
                .map(|i| i + 1);

            prop_assert_eq!(stop_epoch, Some(best_epoch + patience));
            prop_assert_eq!(stopping.best_epoch(), Some(best_epoch));
        }

        #[test]
        fn prop_never_stops_while_improving(
            steps in prop::collection::vec(0.001f64..1.0, 1..50),
            patience in 1usize..5,
        ) {
            let mut stopping = tracker(patience);
            let mut level = 1000.0;
            for step in steps {
                level -= step;
                prop_assert_eq!(stopping.observe(level), StopDecision::Continue);
                prop_assert_eq!(stopping.counter(), 0);
            }
        }
    }
}
