//! End-to-end experiment runs on tiny generated images

use std::path::Path;
use std::sync::{Arc, Mutex};

use age_regressor::config::{Backbone, DeviceConfig, PretrainedSource};
use age_regressor::training::{StopReason, TrainingEvent};
use age_regressor::{AgeRegression, ExperimentConfig};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

const SAMPLES: usize = 20;

fn write_dataset(root: &Path) {
    let images = root.join("images");
    std::fs::create_dir_all(&images).unwrap();

    let mut manifest = String::from("filenames,age\n");
    for i in 0..SAMPLES {
        let filename = format!("S{:04}.png", i);
        let shade = (i * 12) as u8;
        RgbImage::from_fn(24, 20, |x, y| Rgb([shade, (x * 10) as u8, (y * 10) as u8]))
            .save(images.join(&filename))
            .unwrap();
        manifest.push_str(&format!("{},{}\n", filename, 8 + i % 10));
    }
    std::fs::write(root.join("train.csv"), manifest).unwrap();
}

fn config(root: &Path) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.data.manifest_path = root.join("train.csv");
    config.data.image_dir = root.join("images");
    config.data.image_size = 32;
    config.model.backbone = Backbone::Resnet18;
    config.model.pretrained = PretrainedSource::None;
    config.runtime.device = DeviceConfig::Cpu;
    config.training.max_epochs = 2;
    config.training.batch_size = 4;
    config.evaluation.batch_size = 4;
    config.report.tile_size = 16;
    config
}

#[test]
fn test_full_experiment_writes_panels() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    let panel_dir = dir.path().join("panels");

    let mut config = config(dir.path());
    config.report.panel_dir = Some(panel_dir.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let experiment = AgeRegression::new(config).unwrap();
    let outcome = experiment
        .run(move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();

    assert_eq!(outcome.training.epochs_run, 2);
    assert_eq!(outcome.training.history.len(), 2);
    assert_eq!(outcome.training.stop_reason, StopReason::MaxEpochs);
    assert!(outcome.training.history.iter().all(|r| r.train_loss.is_finite() && r.val_loss.is_finite()));

    // 20 records: 16 train, 2 validation, 2 test
    assert_eq!(outcome.evaluation.predictions.len(), 2);
    assert!(outcome.evaluation.metrics.mse >= 0.0);
    assert!(outcome.evaluation.metrics.r2.is_finite());

    assert_eq!(outcome.report.panels.len(), 3);
    assert_eq!(outcome.report.panels[2].tiles.len(), 1);
    assert!(panel_dir.join("maximal_error.png").exists());
    assert!(panel_dir.join("maximal_error.txt").exists());

    let events = events.lock().unwrap();
    let epochs = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::EpochCompleted(_)))
        .count();
    assert_eq!(epochs, 2);
    assert!(matches!(events.last(), Some(TrainingEvent::Completed { epochs_run: 2, .. })));
}

#[test]
fn test_splits_are_reproducible() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());

    let experiment = AgeRegression::new(config(dir.path())).unwrap();
    let first = experiment.load_splits().unwrap();
    let second = experiment.load_splits().unwrap();

    assert_eq!(first.train.len(), 16);
    assert_eq!(first.validation.len(), 2);
    assert_eq!(first.test.len(), 2);
    assert_eq!(first.test.records, second.test.records);
    assert_eq!(first.validation.data.inputs().dims(), &[2, 3, 32, 32]);

    let a = first.train.data.inputs().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let b = second.train.data.inputs().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_missing_image_fails_materialization() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    std::fs::remove_file(dir.path().join("images").join("S0003.png")).unwrap();

    let experiment = AgeRegression::new(config(dir.path())).unwrap();
    assert!(experiment.load_splits().is_err());
}

#[test]
fn test_config_file_drives_experiment() {
    let dir = TempDir::new().unwrap();
    write_dataset(dir.path());
    let path = dir.path().join("experiment.yaml");
    config(dir.path()).to_file(&path).unwrap();

    let loaded = ExperimentConfig::from_file(&path).unwrap();
    assert_eq!(loaded.data.image_size, 32);
    assert_eq!(loaded.model.pretrained, PretrainedSource::None);

    let experiment = AgeRegression::new(loaded).unwrap();
    assert!(experiment.device().is_cpu());
    assert_eq!(experiment.load_splits().unwrap().train.len(), 16);
}

#[test]
fn test_resnet_regressor_trains_through_the_epoch_loop() {
    use age_regressor::config::ModelConfig;
    use age_regressor::training::{create_optimizer, Optimizer, OptimizerConfig, Trainer, TrainingParams};
    use age_regressor::{AgeRegressor, TensorDataset};
    use candle_core::{Device, Tensor};

    let device = Device::Cpu;
    let model = AgeRegressor::new(
        &ModelConfig {
            backbone: Backbone::Resnet18,
            pretrained: PretrainedSource::None,
        },
        &device,
    )
    .unwrap();
    let data = |n: usize| {
        TensorDataset::new(
            Tensor::rand(0f32, 1f32, (n, 3, 32, 32), &device).unwrap(),
            Tensor::rand(10f32, 20f32, n, &device).unwrap(),
        )
        .unwrap()
    };

    let mut optimizer = create_optimizer(&OptimizerConfig::default(), model.trainable_vars().unwrap()).unwrap();
    let mut trainer = Trainer::new(TrainingParams {
        max_epochs: 1,
        ..TrainingParams::default()
    })
    .unwrap();
    let result = trainer.fit(&model, &mut optimizer, &data(8), &data(4)).unwrap();

    assert_eq!(result.epochs_run, 1);
    assert!(result.history[0].train_loss.is_finite());
    assert_eq!(optimizer.step_count(), 1);
}
