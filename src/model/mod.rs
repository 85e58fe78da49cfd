//! Regressor model: pretrained ResNet feature extractor with a scalar head
//!
//! The backbone and the head live in separate variable maps. Pretrained
//! weights are loaded into the backbone map only, so the classification
//! layer of the checkpoint is never used and the single-output head always
//! starts from a fresh initialization.

pub mod resnet;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Func, Linear, VarBuilder, VarMap};
use tracing::{debug, info, instrument};

use crate::config::{Backbone, ModelConfig, PretrainedSource};
use crate::error::{Error, Result};

/// Batch-norm buffers that are not trained
const FROZEN_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

/// ResNet backbone followed by a linear layer with one output
pub struct AgeRegressor {
    backbone: Func<'static>,
    head: Linear,
    backbone_vars: VarMap,
    head_vars: VarMap,
    kind: Backbone,
    device: Device,
}

impl AgeRegressor {
    /// Build the model and load the configured backbone weights
    #[instrument(skip_all, fields(backbone = %config.backbone))]
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let mut backbone_vars = VarMap::new();
        let backbone_vb = VarBuilder::from_varmap(&backbone_vars, DType::F32, device);
        let backbone = match config.backbone {
            Backbone::Resnet18 => resnet::resnet18(backbone_vb)?,
            Backbone::Resnet34 => resnet::resnet34(backbone_vb)?,
            Backbone::Resnet50 => resnet::resnet50(backbone_vb)?,
        };

        if let Some(path) = resolve_weights(&config.pretrained)? {
            info!("Loading {} weights from {}", config.backbone, path.display());
            backbone_vars.load(&path).map_err(|e| {
                Error::model_loading(format!(
                    "Failed to load {} weights from {}: {}",
                    config.backbone,
                    path.display(),
                    e
                ))
            })?;
        } else {
            info!("Using randomly initialized {} backbone", config.backbone);
        }

        let head_vars = VarMap::new();
        let head_vb = VarBuilder::from_varmap(&head_vars, DType::F32, device);
        let head = candle_nn::linear(config.backbone.feature_dim(), 1, head_vb.pp("fc"))?;

        let model = Self {
            backbone,
            head,
            backbone_vars,
            head_vars,
            kind: config.backbone,
            device: device.clone(),
        };
        debug!(
            "Built {} regressor with {} trainable parameters",
            model.kind,
            model.trainable_parameter_count()?
        );
        Ok(model)
    }

    /// Variables updated by the optimizer: every backbone weight except the
    /// batch-norm running statistics, plus the head
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let mut vars: Vec<(String, Var)> = lock_vars(self.backbone_vars.data())?
            .iter()
            .filter(|(name, _)| !FROZEN_SUFFIXES.iter().any(|s| name.ends_with(s)))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.extend(
            lock_vars(self.head_vars.data())?
                .iter()
                .map(|(name, var)| (format!("head.{name}"), var.clone())),
        );

        // HashMap order is unspecified; sort for a stable parameter order
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars.into_iter().map(|(_, var)| var).collect())
    }

    /// Number of scalar parameters in [`Self::trainable_vars`]
    pub fn trainable_parameter_count(&self) -> Result<usize> {
        Ok(self.trainable_vars()?.iter().map(|v| v.elem_count()).sum())
    }

    /// Scalar predictions `[N]` for images `[N, 3, H, W]`, without gradients
    pub fn predict(&self, images: &Tensor) -> Result<Tensor> {
        Ok(self.forward(images)?.detach().squeeze(1)?)
    }

    /// Backbone architecture
    pub fn backbone(&self) -> Backbone {
        self.kind
    }

    /// Device holding the weights
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Module for AgeRegressor {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let features = self.backbone.forward(xs)?;
        self.head.forward(&features)
    }
}

fn lock_vars(data: &Mutex<HashMap<String, Var>>) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    data.lock()
        .map_err(|_| Error::internal("Variable map lock poisoned"))
}

/// Local path of the pretrained weights, downloading them if needed
fn resolve_weights(source: &PretrainedSource) -> Result<Option<PathBuf>> {
    match source {
        PretrainedSource::None => Ok(None),
        PretrainedSource::File { path } => {
            if !path.exists() {
                return Err(Error::model_loading(format!(
                    "Weights file not found: {}",
                    path.display()
                )));
            }
            Ok(Some(path.clone()))
        }
        PretrainedSource::Hub { repo, file } => {
            info!("Fetching {} from hub repository {}", file, repo);
            let api = hf_hub::api::sync::Api::new()
                .map_err(|e| Error::model_loading(format!("Failed to initialize hub client: {e}")))?;
            let path = api
                .model(repo.clone())
                .get(file)
                .map_err(|e| Error::model_loading(format!("Failed to fetch {repo}/{file}: {e}")))?;
            Ok(Some(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizers::SgdOptimizer;
    use crate::training::{LossFunction, MseLoss, Optimizer};

    fn untrained(backbone: Backbone) -> AgeRegressor {
        let config = ModelConfig {
            backbone,
            pretrained: PretrainedSource::None,
        };
        AgeRegressor::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_produces_one_output_per_image() {
        let model = untrained(Backbone::Resnet18);
        let images = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();

        assert_eq!(model.forward(&images).unwrap().dims(), &[2, 1]);
        assert_eq!(model.predict(&images).unwrap().dims(), &[2]);
    }

    #[test]
    fn test_gradient_step_updates_head_but_not_running_statistics() {
        let model = untrained(Backbone::Resnet18);
        let images = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[20f32, 30.0], &Device::Cpu).unwrap();

        let snapshot = |var: &Tensor| var.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let head_before = snapshot(model.head.weight());
        let stats_before = snapshot(lock_vars(model.backbone_vars.data()).unwrap()["bn1.running_mean"].as_tensor());
        let conv_before = snapshot(lock_vars(model.backbone_vars.data()).unwrap()["conv1.weight"].as_tensor());

        let mut optimizer = SgdOptimizer::new(model.trainable_vars().unwrap(), 1e-3, 0.0, 0.0).unwrap();
        let loss = MseLoss.forward(&model.forward(&images).unwrap(), &targets).unwrap();
        optimizer.backward_step(&loss).unwrap();

        assert_eq!(optimizer.step_count(), 1);
        assert_ne!(snapshot(model.head.weight()), head_before);
        assert_ne!(
            snapshot(lock_vars(model.backbone_vars.data()).unwrap()["conv1.weight"].as_tensor()),
            conv_before
        );
        assert_eq!(
            snapshot(lock_vars(model.backbone_vars.data()).unwrap()["bn1.running_mean"].as_tensor()),
            stats_before
        );
    }

    #[test]
    fn test_running_statistics_are_not_trainable() {
        let model = untrained(Backbone::Resnet18);
        let all: usize = lock_vars(model.backbone_vars.data())
            .unwrap()
            .values()
            .chain(lock_vars(model.head_vars.data()).unwrap().values())
            .map(|v| v.elem_count())
            .sum();
        let frozen: usize = lock_vars(model.backbone_vars.data())
            .unwrap()
            .iter()
            .filter(|(name, _)| name.ends_with("running_mean") || name.ends_with("running_var"))
            .map(|(_, v)| v.elem_count())
            .sum();

        assert!(frozen > 0);
        assert_eq!(model.trainable_parameter_count().unwrap(), all - frozen);
    }

    #[test]
    fn test_missing_weights_file_is_reported() {
        let config = ModelConfig {
            backbone: Backbone::Resnet18,
            pretrained: PretrainedSource::File {
                path: PathBuf::from("/nonexistent/resnet18.safetensors"),
            },
        };
        let err = AgeRegressor::new(&config, &Device::Cpu).err().unwrap();
        assert!(matches!(err, Error::ModelLoading(_)));
    }

    #[test]
    fn test_weights_round_trip_through_safetensors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backbone.safetensors");
        let source = untrained(Backbone::Resnet18);
        source.backbone_vars.save(&path).unwrap();

        let config = ModelConfig {
            backbone: Backbone::Resnet18,
            pretrained: PretrainedSource::File { path },
        };
        let loaded = AgeRegressor::new(&config, &Device::Cpu).unwrap();

        let name = "conv1.weight";
        let expected = lock_vars(source.backbone_vars.data()).unwrap()[name]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let actual = lock_vars(loaded.backbone_vars.data()).unwrap()[name]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(expected, actual);
    }
}
