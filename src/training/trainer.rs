//! Epoch-based training loop for the age regressor
//!
//! Each epoch runs one optimizer step per full training batch, measures the
//! validation loss, lets the learning-rate policy observe that loss, records
//! the epoch, and finally asks the early-stopping policy whether to go on.
//! The two policies watch the same signal with independent counters.

use std::time::{Duration, Instant};

use candle_core::Module;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::data::{RemainderPolicy, TensorDataset};
use crate::error::{Error, Result};
use crate::training::config::TrainingParams;
use crate::training::early_stopping::{EarlyStopping, StopDecision};
use crate::training::loss::{loss_value, LossFunction, MseLoss};
use crate::training::optimizers::{create_scheduler, Optimizer, SchedulerState};

/// Losses and learning rate of one completed epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// One-based epoch number
    pub epoch: usize,
    /// Mean loss over the full training batches
    pub train_loss: f64,
    /// Loss over the whole validation split
    pub val_loss: f64,
    /// Learning rate in effect for the next epoch
    pub learning_rate: f64,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Epoch budget exhausted
    MaxEpochs,
    /// Validation loss stopped improving
    EarlyStopped,
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    EarlyStopped,
    Failed { error: String },
}

/// Training state tracking, rebuilt at the start of every fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch (one-based, 0 before the first)
    pub epoch: usize,

    /// Current learning rate
    pub current_lr: f64,

    /// Training status
    pub status: TrainingStatus,

    /// Training start time
    pub start_time: Option<DateTime<Utc>>,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            current_lr: 0.0,
            status: TrainingStatus::NotStarted,
            start_time: None,
        }
    }
}

/// Training events for monitoring
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    EpochCompleted(EpochRecord),
    LearningRateReduced { epoch: usize, from: f64, to: f64 },
    EarlyStopped { epoch: usize, best_epoch: usize, best_val_loss: f64 },
    Completed { epochs_run: usize, reason: StopReason },
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// One record per completed epoch
    pub history: Vec<EpochRecord>,

    /// Number of completed epochs
    pub epochs_run: usize,

    /// Lowest validation loss observed
    pub best_val_loss: f64,

    /// Epoch of `best_val_loss`
    pub best_epoch: usize,

    /// Learning rate after the last epoch
    pub final_lr: f64,

    /// Why the loop ended
    pub stop_reason: StopReason,

    /// Wall-clock start of training
    pub started_at: DateTime<Utc>,

    /// Training duration
    pub training_duration: Duration,
}

type EventSink = Box<dyn FnMut(&TrainingEvent) + Send>;

/// Runs the epoch loop for a model and optimizer over fixed splits
pub struct Trainer {
    params: TrainingParams,
    loss_fn: Box<dyn LossFunction>,
    state: TrainingState,
    event_sink: Option<EventSink>,
}

impl Trainer {
    /// Create a trainer with mean squared error as the loss
    pub fn new(params: TrainingParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            loss_fn: Box::new(MseLoss),
            state: TrainingState::new(),
            event_sink: None,
        })
    }

    /// Replace the loss function
    pub fn with_loss(mut self, loss_fn: Box<dyn LossFunction>) -> Self {
        self.loss_fn = loss_fn;
        self
    }

    /// Deliver training events to `sink` as they happen
    pub fn with_event_monitoring(mut self, sink: impl FnMut(&TrainingEvent) + Send + 'static) -> Self {
        self.event_sink = Some(Box::new(sink));
        self
    }

    /// Get current training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Training parameters
    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    /// Train `model` until the epoch budget runs out or early stopping fires.
    ///
    /// The optimizer's current learning rate is the scheduler's base rate.
    /// Any non-finite loss aborts the run.
    #[instrument(skip_all, fields(train = train.len(), val = val.len()))]
    pub fn fit<M, O>(
        &mut self,
        model: &M,
        optimizer: &mut O,
        train: &TensorDataset,
        val: &TensorDataset,
    ) -> Result<TrainingResult>
    where
        M: Module + ?Sized,
        O: Optimizer + ?Sized,
    {
        let batches_per_epoch = self
            .params
            .remainder
            .num_batches(train.len(), self.params.batch_size);
        if batches_per_epoch == 0 {
            return Err(Error::invalid_input(format!(
                "Training split of {} samples yields no batches of size {}",
                train.len(),
                self.params.batch_size
            )));
        }
        if val.is_empty() {
            return Err(Error::invalid_input("Validation split is empty"));
        }

        let dropped = self
            .params
            .remainder
            .dropped_samples(train.len(), self.params.batch_size);
        info!(
            "Training for up to {} epochs: {} batches of {} per epoch ({} samples dropped), {} optimizer",
            self.params.max_epochs,
            batches_per_epoch,
            self.params.batch_size,
            dropped,
            optimizer.name()
        );

        self.state = TrainingState::new();
        self.state.status = TrainingStatus::Running;
        self.state.current_lr = optimizer.learning_rate();
        let started_at = Utc::now();
        self.state.start_time = Some(started_at);
        let training_start = Instant::now();

        let mut scheduler = create_scheduler(&self.params.scheduler, optimizer.learning_rate());
        let mut early_stopping = EarlyStopping::new(&self.params.early_stopping);

        let result = self.run_epochs(
            model,
            optimizer,
            train,
            val,
            &mut scheduler,
            &mut early_stopping,
        );

        let (history, stop_reason) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Training failed at epoch {}: {}", self.state.epoch + 1, e);
                self.state.status = TrainingStatus::Failed {
                    error: e.to_string(),
                };
                return Err(e);
            }
        };

        self.state.status = match stop_reason {
            StopReason::MaxEpochs => TrainingStatus::Completed,
            StopReason::EarlyStopped => TrainingStatus::EarlyStopped,
        };
        self.send_event(TrainingEvent::Completed {
            epochs_run: history.len(),
            reason: stop_reason,
        });

        let result = TrainingResult {
            epochs_run: history.len(),
            best_val_loss: early_stopping.best_loss(),
            best_epoch: early_stopping.best_epoch().unwrap_or(0),
            final_lr: self.state.current_lr,
            stop_reason,
            started_at,
            training_duration: training_start.elapsed(),
            history,
        };

        info!(
            "Training finished after {} epochs in {:?} (best validation loss {:.4} at epoch {})",
            result.epochs_run, result.training_duration, result.best_val_loss, result.best_epoch
        );
        Ok(result)
    }

    fn run_epochs<M, O>(
        &mut self,
        model: &M,
        optimizer: &mut O,
        train: &TensorDataset,
        val: &TensorDataset,
        scheduler: &mut SchedulerState,
        early_stopping: &mut EarlyStopping,
    ) -> Result<(Vec<EpochRecord>, StopReason)>
    where
        M: Module + ?Sized,
        O: Optimizer + ?Sized,
    {
        let mut history = Vec::with_capacity(self.params.max_epochs);

        for epoch in 1..=self.params.max_epochs {
            let epoch_start = Instant::now();

            let train_loss = self.train_epoch(model, optimizer, train, epoch)?;
            let val_loss = self.validate(model, val, epoch)?;

            let previous_lr = scheduler.get_lr();
            scheduler.step(Some(val_loss));
            let learning_rate = scheduler.get_lr();
            if learning_rate != previous_lr {
                optimizer.set_learning_rate(learning_rate);
                self.send_event(TrainingEvent::LearningRateReduced {
                    epoch,
                    from: previous_lr,
                    to: learning_rate,
                });
            }

            self.state.epoch = epoch;
            self.state.current_lr = learning_rate;

            let record = EpochRecord {
                epoch,
                train_loss,
                val_loss,
                learning_rate,
            };
            history.push(record);
            info!(
                "Epoch {} - Training Loss: {:.4} - Validation Loss: {:.4} ({:?})",
                epoch,
                train_loss,
                val_loss,
                epoch_start.elapsed()
            );
            self.send_event(TrainingEvent::EpochCompleted(record));

            if early_stopping.observe(val_loss) == StopDecision::Stop {
                let best_epoch = early_stopping.best_epoch().unwrap_or(0);
                info!(
                    "Early stopping at epoch {}: no improvement for {} epochs since epoch {}",
                    epoch,
                    early_stopping.counter(),
                    best_epoch
                );
                self.send_event(TrainingEvent::EarlyStopped {
                    epoch,
                    best_epoch,
                    best_val_loss: early_stopping.best_loss(),
                });
                return Ok((history, StopReason::EarlyStopped));
            }
        }

        Ok((history, StopReason::MaxEpochs))
    }

    /// Train for one epoch, returning the mean batch loss
    fn train_epoch<M, O>(
        &mut self,
        model: &M,
        optimizer: &mut O,
        train: &TensorDataset,
        epoch: usize,
    ) -> Result<f64>
    where
        M: Module + ?Sized,
        O: Optimizer + ?Sized,
    {
        let mut epoch_loss = 0.0;
        let mut num_batches = 0usize;

        for batch in train.batches(self.params.batch_size, self.params.remainder) {
            let batch = batch?;
            let predictions = model.forward(&batch.inputs)?;
            let loss = self.loss_fn.forward(&predictions, &batch.targets)?;

            let value = loss_value(&loss)?;
            if !value.is_finite() {
                return Err(Error::NonFiniteLoss {
                    epoch,
                    stage: "train",
                });
            }

            optimizer.backward_step(&loss)?;

            epoch_loss += value;
            num_batches += 1;
            debug!(
                "Epoch {} batch {} - {}: {:.4}",
                epoch,
                batch.index,
                self.loss_fn.name(),
                value
            );
        }

        Ok(epoch_loss / num_batches as f64)
    }

    /// Loss over the whole validation split, without parameter updates.
    ///
    /// With a validation batch size set, chunks are weighted by their size,
    /// so the result still equals the loss of a single pass over the split.
    fn validate<M>(&self, model: &M, val: &TensorDataset, epoch: usize) -> Result<f64>
    where
        M: Module + ?Sized,
    {
        let chunk = self.params.validation_batch_size.unwrap_or(val.len()).max(1);
        let mut weighted_loss = 0.0;

        for batch in val.batches(chunk, RemainderPolicy::Keep) {
            let batch = batch?;
            let predictions = model.forward(&batch.inputs)?.detach();
            let loss = loss_value(&self.loss_fn.forward(&predictions, &batch.targets)?)?;
            weighted_loss += loss * batch.len() as f64;
        }

        let val_loss = weighted_loss / val.len() as f64;
        if !val_loss.is_finite() {
            return Err(Error::NonFiniteLoss {
                epoch,
                stage: "validation",
            });
        }
        Ok(val_loss)
    }

    /// Send training event
    fn send_event(&mut self, event: TrainingEvent) {
        if let Some(sink) = self.event_sink.as_mut() {
            sink(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::config::{EarlyStoppingConfig, PlateauConfig, SchedulerConfig};
    use crate::training::optimizers::SgdOptimizer;
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::Linear;
    use std::sync::{Arc, Mutex};

    fn linear_model(weight: f32, bias: f32) -> (Linear, Vec<Var>) {
        let w = Var::new(&[[weight]], &Device::Cpu).unwrap();
        let b = Var::new(&[bias], &Device::Cpu).unwrap();
        let model = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        (model, vec![w, b])
    }

    fn dataset(n: usize) -> TensorDataset {
        let xs: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
        let ys: Vec<f32> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        TensorDataset::new(
            Tensor::from_vec(xs, (n, 1), &Device::Cpu).unwrap(),
            Tensor::from_vec(ys, n, &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    fn params(max_epochs: usize, patience: usize) -> TrainingParams {
        TrainingParams {
            max_epochs,
            batch_size: 8,
            early_stopping: EarlyStoppingConfig {
                enabled: true,
                patience,
                min_delta: 0.0,
            },
            ..TrainingParams::default()
        }
    }

    #[test]
    fn test_constant_model_stops_after_patience() {
        // Zero learning rate keeps validation loss constant: epoch 1 sets the
        // best, epochs 2..=1+P are non-improving.
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.0, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(params(50, 3)).unwrap();

        let result = trainer.fit(&model, &mut optimizer, &dataset(20), &dataset(5)).unwrap();

        assert_eq!(result.epochs_run, 4);
        assert_eq!(result.stop_reason, StopReason::EarlyStopped);
        assert_eq!(result.best_epoch, 1);
        assert_eq!(trainer.state().status, TrainingStatus::EarlyStopped);
    }

    #[test]
    fn test_one_step_per_full_batch() {
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.01, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(params(2, 10)).unwrap();

        // 53 samples in batches of 8: 6 full batches, 5 samples dropped
        trainer.fit(&model, &mut optimizer, &dataset(53), &dataset(5)).unwrap();
        assert_eq!(optimizer.step_count(), 12);
    }

    #[test]
    fn test_training_reduces_loss_and_emits_events() {
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.1, 0.0, 0.0).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut trainer = Trainer::new(params(5, 10))
            .unwrap()
            .with_event_monitoring(move |event| sink.lock().unwrap().push(event.clone()));

        let result = trainer.fit(&model, &mut optimizer, &dataset(32), &dataset(8)).unwrap();

        assert_eq!(result.epochs_run, 5);
        assert_eq!(result.stop_reason, StopReason::MaxEpochs);
        assert!(result.history[4].val_loss < result.history[0].val_loss);

        let events = events.lock().unwrap();
        let epochs = events
            .iter()
            .filter(|e| matches!(e, TrainingEvent::EpochCompleted(_)))
            .count();
        assert_eq!(epochs, 5);
        assert!(matches!(
            events.last(),
            Some(TrainingEvent::Completed { epochs_run: 5, reason: StopReason::MaxEpochs })
        ));
    }

    #[test]
    fn test_plateau_reduction_updates_optimizer() {
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 1e-12, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(TrainingParams {
            scheduler: SchedulerConfig::ReduceOnPlateau(PlateauConfig {
                eps: 0.0,
                ..PlateauConfig::default()
            }),
            ..params(5, 10)
        })
        .unwrap();

        let result = trainer.fit(&model, &mut optimizer, &dataset(16), &dataset(4)).unwrap();

        // Best at epoch 1, reduction on the 4th non-improving epoch
        assert_eq!(result.history[3].learning_rate, 1e-12);
        approx::assert_relative_eq!(result.history[4].learning_rate, 1e-13);
        approx::assert_relative_eq!(optimizer.learning_rate(), 1e-13);
    }

    #[test]
    fn test_constant_scheduler_keeps_rate() {
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.0, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(TrainingParams {
            scheduler: SchedulerConfig::Constant,
            ..params(6, 10)
        })
        .unwrap();

        let result = trainer.fit(&model, &mut optimizer, &dataset(16), &dataset(4)).unwrap();
        assert!(result.history.iter().all(|r| r.learning_rate == 0.0));
    }

    #[test]
    fn test_too_small_train_split_is_rejected() {
        let (model, vars) = linear_model(0.0, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.1, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(params(5, 3)).unwrap();
        let err = trainer.fit(&model, &mut optimizer, &dataset(7), &dataset(4)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_non_finite_loss_aborts() {
        let (model, vars) = linear_model(f32::NAN, 0.0);
        let mut optimizer = SgdOptimizer::new(vars, 0.1, 0.0, 0.0).unwrap();
        let mut trainer = Trainer::new(params(5, 3)).unwrap();
        let err = trainer.fit(&model, &mut optimizer, &dataset(16), &dataset(4)).unwrap_err();
        assert!(matches!(err, Error::NonFiniteLoss { epoch: 1, stage: "train" }));
        assert!(matches!(trainer.state().status, TrainingStatus::Failed { .. }));
    }

    #[test]
    fn test_validation_loss_matches_full_split_mse() {
        let (model, _vars) = linear_model(0.0, 0.0);
        let trainer = Trainer::new(params(1, 1)).unwrap();
        let val = dataset(11);

        let expected = {
            let ys = val.targets().to_dtype(DType::F64).unwrap().to_vec1::<f64>().unwrap();
            ys.iter().map(|y| y * y).sum::<f64>() / ys.len() as f64
        };
        let val_loss = trainer.validate(&model, &val, 1).unwrap();
        approx::assert_relative_eq!(val_loss, expected, epsilon = 1e-5);
    }

    struct CountingModel {
        inner: Linear,
        calls: std::cell::Cell<usize>,
    }

    impl Module for CountingModel {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            self.calls.set(self.calls.get() + 1);
            self.inner.forward(xs)
        }
    }

    #[test]
    fn test_validation_runs_one_pass_unless_chunked() {
        let (inner, _vars) = linear_model(0.5, 0.0);
        let model = CountingModel {
            inner,
            calls: std::cell::Cell::new(0),
        };
        let val = dataset(11);

        let single = Trainer::new(params(1, 1)).unwrap();
        let full_pass = single.validate(&model, &val, 1).unwrap();
        assert_eq!(model.calls.get(), 1);

        let chunked = Trainer::new(TrainingParams {
            validation_batch_size: Some(3),
            ..params(1, 1)
        })
        .unwrap();
        model.calls.set(0);
        let chunked_loss = chunked.validate(&model, &val, 1).unwrap();
        assert_eq!(model.calls.get(), 4);
        approx::assert_relative_eq!(chunked_loss, full_pass, epsilon = 1e-5);
    }
}
