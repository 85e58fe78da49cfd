//! Configuration structures for the age regression experiment

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::RemainderPolicy;
use crate::error::{Error, Result};
use crate::training::config::{OptimizerConfig, TrainingParams};

/// Main configuration for one experiment run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Manifest, images, splits, and augmentation
    pub data: DataConfig,
    /// Backbone and pretrained weights
    pub model: ModelConfig,
    /// Optimizer hyperparameters
    pub optimizer: OptimizerConfig,
    /// Training loop, early stopping, and LR schedule
    pub training: TrainingParams,
    /// Test-split evaluation
    pub evaluation: EvaluationConfig,
    /// Error subsets and panels
    pub report: ReportConfig,
    /// Device and threading
    pub runtime: RuntimeConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl ExperimentConfig {
    /// Load configuration from a file (JSON for `.json`, YAML otherwise)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file (JSON for `.json`, YAML otherwise)
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        info!("Wrote configuration to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.optimizer.validate()?;
        self.training.validate()?;

        if self.runtime.num_threads == Some(0) {
            return Err(Error::config("Number of worker threads must be greater than 0"));
        }

        if self.evaluation.batch_size == 0 {
            return Err(Error::config("Evaluation batch size must be greater than 0"));
        }

        if self.report.large_error_threshold < self.report.correct_threshold {
            return Err(Error::config(
                "Large-error threshold must not be below the correct-prediction threshold",
            ));
        }

        if self.report.tile_size == 0 {
            return Err(Error::config("Panel tile size must be greater than 0"));
        }

        if let PretrainedSource::File { path } = &self.model.pretrained {
            if path.as_os_str().is_empty() {
                return Err(Error::config("Pretrained weights path must not be empty"));
            }
        }

        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// CSV manifest with one row per image
    pub manifest_path: PathBuf,
    /// Directory holding the images named in the manifest
    pub image_dir: PathBuf,
    /// Manifest column with image file names
    pub filename_column: String,
    /// Manifest column with numeric labels
    pub label_column: String,
    /// Edge length images are resized to
    pub image_size: u32,
    /// Partitioning parameters
    pub split: SplitConfig,
    /// Train-split augmentation
    pub augmentation: AugmentationConfig,
}

impl DataConfig {
    fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(Error::config("Image size must be greater than 0"));
        }

        for (name, fraction) in [
            ("holdout_fraction", self.split.holdout_fraction),
            ("test_fraction", self.split.test_fraction),
        ] {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(Error::config(format!("{name} must be in (0.0, 1.0)")));
            }
        }

        if self.filename_column.is_empty() || self.label_column.is_empty() {
            return Err(Error::config("Manifest column names must not be empty"));
        }

        let aug = &self.augmentation;
        if !(0.0..=1.0).contains(&aug.horizontal_flip_prob) {
            return Err(Error::config("Horizontal flip probability must be in [0.0, 1.0]"));
        }
        let (lo, hi) = aug.crop_scale;
        if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
            return Err(Error::config("Crop scale must satisfy 0 < min <= max <= 1"));
        }
        if aug.rotation_degrees < 0.0
            || aug.brightness < 0.0
            || aug.contrast < 0.0
            || aug.saturation < 0.0
            || !(0.0..=0.5).contains(&aug.hue)
        {
            return Err(Error::config(
                "Augmentation strengths must be non-negative and hue at most 0.5",
            ));
        }

        Ok(())
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("data/train.csv"),
            image_dir: PathBuf::from("data/images"),
            filename_column: "filenames".to_string(),
            label_column: "age".to_string(),
            image_size: 1024,
            split: SplitConfig::default(),
            augmentation: AugmentationConfig::default(),
        }
    }
}

/// Parameters of the two sequential seeded splits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Seed shared by both splits and the augmentation
    pub seed: u64,
    /// Fraction of all records held out from training
    pub holdout_fraction: f64,
    /// Fraction of the holdout assigned to the test split
    pub test_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            holdout_fraction: 0.2,
            test_fraction: 0.5,
        }
    }
}

/// Train-split augmentation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Apply augmentation at all
    pub enabled: bool,
    /// Probability of a horizontal flip
    pub horizontal_flip_prob: f64,
    /// Maximum absolute rotation in degrees
    pub rotation_degrees: f64,
    /// Area fraction range of the random resized crop
    pub crop_scale: (f64, f64),
    /// Brightness jitter strength
    pub brightness: f64,
    /// Contrast jitter strength
    pub contrast: f64,
    /// Saturation jitter strength
    pub saturation: f64,
    /// Hue jitter strength, as a fraction of a full turn
    pub hue: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizontal_flip_prob: 0.5,
            rotation_degrees: 30.0,
            crop_scale: (0.8, 1.0),
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.2,
            hue: 0.1,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Feature extractor architecture
    pub backbone: Backbone,
    /// Where the backbone weights come from
    pub pretrained: PretrainedSource,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: Backbone::Resnet18,
            pretrained: PretrainedSource::default(),
        }
    }
}

/// Supported ResNet backbones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    Resnet18,
    Resnet34,
    Resnet50,
}

impl Backbone {
    /// Width of the pooled feature vector fed to the regression head
    pub fn feature_dim(&self) -> usize {
        match self {
            Backbone::Resnet18 | Backbone::Resnet34 => 512,
            Backbone::Resnet50 => 2048,
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backbone::Resnet18 => "resnet18",
            Backbone::Resnet34 => "resnet34",
            Backbone::Resnet50 => "resnet50",
        };
        f.write_str(name)
    }
}

/// Source of pretrained backbone weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum PretrainedSource {
    /// Random initialization
    None,
    /// Local safetensors file
    File { path: PathBuf },
    /// Safetensors file from a Hugging Face hub repository
    Hub { repo: String, file: String },
}

impl Default for PretrainedSource {
    fn default() -> Self {
        Self::Hub {
            repo: "lmz/candle-resnet".to_string(),
            file: "resnet18.safetensors".to_string(),
        }
    }
}

/// Test-split evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Inference batch size
    pub batch_size: usize,
    /// Handling of the trailing partial batch
    pub remainder: RemainderPolicy,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            remainder: RemainderPolicy::Keep,
        }
    }
}

/// Reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Errors strictly below this count as correct
    pub correct_threshold: f64,
    /// Errors at or above this count as large
    pub large_error_threshold: f64,
    /// Edge length of each panel tile
    pub tile_size: u32,
    /// Directory for panel PNGs; panels are only logged when unset
    pub panel_dir: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            correct_threshold: 1.0,
            large_error_threshold: 2.0,
            tile_size: 256,
            panel_dir: None,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute device
    pub device: DeviceConfig,
    /// Worker threads for image decoding (all cores when unset)
    pub num_threads: Option<usize>,
}

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    /// First available accelerator, else CPU
    #[default]
    Auto,
    /// CPU
    Cpu,
    /// CUDA GPU
    Cuda { ordinal: usize },
    /// Metal (Apple Silicon)
    Metal { ordinal: usize },
}

impl DeviceConfig {
    /// Map the configured device onto a candle device
    pub fn resolve(&self) -> Result<Device> {
        let device = match self {
            DeviceConfig::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
            DeviceConfig::Cpu => Device::Cpu,
            DeviceConfig::Cuda { ordinal } => Device::new_cuda(*ordinal)?,
            DeviceConfig::Metal { ordinal } => Device::new_metal(*ordinal)?,
        };
        debug!("Resolved device {:?} to {:?}", self, device);
        Ok(device)
    }
}

impl FromStr for DeviceConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse()
                    .map_err(|_| Error::invalid_input(format!("Invalid device ordinal in '{s}'")))?;
                (kind, Some(ordinal))
            }
            None => (s, None),
        };

        match (kind.to_ascii_lowercase().as_str(), ordinal) {
            ("auto", None) => Ok(DeviceConfig::Auto),
            ("cpu", None) => Ok(DeviceConfig::Cpu),
            ("cuda", ordinal) => Ok(DeviceConfig::Cuda {
                ordinal: ordinal.unwrap_or(0),
            }),
            ("metal", ordinal) => Ok(DeviceConfig::Metal {
                ordinal: ordinal.unwrap_or(0),
            }),
            _ => Err(Error::invalid_input(format!(
                "Unknown device '{s}' (expected auto, cpu, cuda[:N] or metal[:N])"
            ))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Output format of log lines
    pub format: LogFormat,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.data.image_size, 1024);
        assert_eq!(config.data.split.seed, 42);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.training.early_stopping.patience, 10);
        assert_eq!(config.evaluation.remainder, RemainderPolicy::Keep);
    }

    #[test]
    fn test_file_round_trip_by_extension() {
        let dir = TempDir::new().unwrap();
        let mut config = ExperimentConfig::default();
        config.training.max_epochs = 7;
        config.runtime.device = DeviceConfig::Cuda { ordinal: 1 };

        for name in ["config.json", "config.yaml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = ExperimentConfig::from_file(&path).unwrap();
            assert_eq!(loaded.training.max_epochs, 7);
            assert_eq!(loaded.runtime.device, DeviceConfig::Cuda { ordinal: 1 });
            assert_eq!(loaded.model.pretrained, PretrainedSource::default());
        }
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
data:
  manifest_path: /data/ages.csv
  image_size: 224
model:
  backbone: resnet50
  pretrained:
    source: none
"#;
        let config: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.data.manifest_path, PathBuf::from("/data/ages.csv"));
        assert_eq!(config.data.image_size, 224);
        assert_eq!(config.data.label_column, "age");
        assert_eq!(config.model.backbone.feature_dim(), 2048);
        assert_eq!(config.model.pretrained, PretrainedSource::None);
        assert_eq!(config.optimizer.learning_rate, 1e-3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.data.split.holdout_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.report.large_error_threshold = 0.5;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.evaluation.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.data.image_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.runtime.num_threads = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_and_logging_sections() {
        let yaml = r#"
runtime:
  device:
    type: cpu
  num_threads: 4
logging:
  level: debug
  format: json
"#;
        let config: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.runtime.device, DeviceConfig::Cpu);
        assert_eq!(config.runtime.num_threads, Some(4));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());

        let defaults = ExperimentConfig::default();
        assert_eq!(defaults.runtime.num_threads, None);
        assert_eq!(defaults.logging.format, LogFormat::Text);
    }

    #[test_case("auto", DeviceConfig::Auto ; "auto")]
    #[test_case("cpu", DeviceConfig::Cpu ; "cpu")]
    #[test_case("CUDA", DeviceConfig::Cuda { ordinal: 0 } ; "cuda default ordinal")]
    #[test_case("cuda:2", DeviceConfig::Cuda { ordinal: 2 } ; "cuda with ordinal")]
    #[test_case("metal:1", DeviceConfig::Metal { ordinal: 1 } ; "metal with ordinal")]
    fn test_device_parsing(input: &str, expected: DeviceConfig) {
        assert_eq!(input.parse::<DeviceConfig>().unwrap(), expected);
    }

    #[test_case("tpu" ; "unknown backend")]
    #[test_case("cpu:1" ; "cpu with ordinal")]
    #[test_case("cuda:x" ; "bad ordinal")]
    fn test_device_parsing_rejects(input: &str) {
        assert!(input.parse::<DeviceConfig>().is_err());
    }

    #[test]
    fn test_cpu_device_resolves() {
        assert!(DeviceConfig::Cpu.resolve().unwrap().is_cpu());
    }
}
