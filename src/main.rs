use age_regressor::config::{DeviceConfig, LogFormat, PretrainedSource};
use age_regressor::training::{StopReason, TrainingEvent};
use age_regressor::{AgeRegression, ExperimentConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "age-regressor")]
#[command(about = "Fine-tune a pretrained ResNet to regress age from images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full experiment: split, train, evaluate, report
    Train {
        /// Configuration file (JSON or YAML); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// CSV manifest with filename and label columns
        #[arg(short, long, env = "AGE_REGRESSOR_MANIFEST")]
        manifest: Option<PathBuf>,

        /// Directory with the images named in the manifest
        #[arg(short, long, env = "AGE_REGRESSOR_IMAGE_DIR")]
        image_dir: Option<PathBuf>,

        /// Maximum number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Compute device: auto, cpu, cuda[:N], metal[:N]
        #[arg(short, long)]
        device: Option<DeviceConfig>,

        /// Directory to write report panels to
        #[arg(long)]
        panel_dir: Option<PathBuf>,

        /// Local safetensors file with backbone weights
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Emit logs as JSON lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path (JSON for .json, YAML otherwise)
        #[arg(short, long, default_value = "experiment.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            manifest,
            image_dir,
            epochs,
            device,
            panel_dir,
            weights,
            json_logs,
        } => {
            let mut config = match config {
                Some(path) => ExperimentConfig::from_file(&path)
                    .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
                None => ExperimentConfig::default(),
            };
            if let Some(manifest) = manifest {
                config.data.manifest_path = manifest;
            }
            if let Some(image_dir) = image_dir {
                config.data.image_dir = image_dir;
            }
            if let Some(epochs) = epochs {
                config.training.max_epochs = epochs;
            }
            if let Some(device) = device {
                config.runtime.device = device;
            }
            if let Some(panel_dir) = panel_dir {
                config.report.panel_dir = Some(panel_dir);
            }
            if let Some(path) = weights {
                config.model.pretrained = PretrainedSource::File { path };
            }
            if json_logs {
                config.logging.format = LogFormat::Json;
            }

            init_logging(&config.logging.level, config.logging.format);
            run_experiment(config)?;
        }

        Commands::Config { file } => {
            init_logging("info", LogFormat::Text);
            validate_config(file)?;
        }

        Commands::InitConfig { output, force } => {
            init_logging("info", LogFormat::Text);
            if output.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
            }
            ExperimentConfig::default()
                .to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote default configuration to {}", output.display());
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn init_logging(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn run_experiment(config: ExperimentConfig) -> Result<()> {
    info!("Starting age regression experiment");

    let experiment = AgeRegression::new(config).context("Invalid experiment configuration")?;

    let splits = experiment
        .load_splits()
        .context("Failed to materialize dataset splits")?;

    let model = experiment
        .build_model()
        .context("Failed to build regressor model")?;

    let training = experiment
        .train(&model, &splits, print_event)
        .context("Training failed")?;
    if training.stop_reason == StopReason::EarlyStopped {
        info!(
            "Stopped early after {} epochs; best validation loss {:.4} at epoch {}",
            training.epochs_run, training.best_val_loss, training.best_epoch
        );
    }

    let evaluation = experiment
        .evaluate(&model, &splits.test)
        .context("Evaluation failed")?;
    println!("{}", evaluation.metrics);

    let report = experiment
        .report(&splits.test, &evaluation)
        .context("Failed to report prediction errors")?;
    println!("Maximal prediction error: {:.4}", report.subsets.max_error());
    for path in &report.written {
        info!("Panel saved to {}", path.display());
    }

    info!("Experiment complete!");
    Ok(())
}

fn print_event(event: &TrainingEvent) {
    match event {
        TrainingEvent::EpochCompleted(record) => println!(
            "Epoch {} - Training Loss: {:.4} - Validation Loss: {:.4}",
            record.epoch, record.train_loss, record.val_loss
        ),
        TrainingEvent::LearningRateReduced { epoch, from, to } => {
            info!("Learning rate reduced after epoch {}: {:.2e} -> {:.2e}", epoch, from, to)
        }
        TrainingEvent::EarlyStopped { epoch, .. } => warn!("Early stopping at epoch {}", epoch),
        TrainingEvent::Completed { .. } => {}
    }
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = ExperimentConfig::from_file(&config_path)
        .context("Failed to load configuration file")?;

    // from_file already validates
    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  - Manifest: {}", config.data.manifest_path.display());
    info!("  - Images: {} ({}px)", config.data.image_dir.display(), config.data.image_size);
    info!("  - Backbone: {} ({:?})", config.model.backbone, config.model.pretrained);
    info!(
        "  - Optimizer: {:?} (lr {})",
        config.optimizer.optimizer_type, config.optimizer.learning_rate
    );
    info!(
        "  - Training: {} epochs, batch size {}, early stopping patience {}",
        config.training.max_epochs, config.training.batch_size, config.training.early_stopping.patience
    );
    info!("  - Device: {:?}", config.runtime.device);

    Ok(())
}

fn show_system_info() {
    println!("age-regressor - ResNet age regression");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("CPU cores: {}", num_cpus::get());
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: compiled (available: {})", candle_core::utils::cuda_is_available());
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: compiled (available: {})", candle_core::utils::metal_is_available());
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate: compiled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate: not compiled");

    println!("  CPU: available");
    println!();
    println!("Usage:");
    println!("  age-regressor init-config -o experiment.yaml");
    println!("  age-regressor config -f experiment.yaml");
    println!("  age-regressor train -c experiment.yaml --panel-dir panels/");
    println!("  age-regressor info");
}
