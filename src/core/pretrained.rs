//! Pretrained graph-encoder checkpoint loader
//!
//! A pretrained graph model directory looks like:
//! ```text
//! clip_gt_arxiv/
//!   ├── config.json        (flat attribute bag)
//!   └── clip_gt_arxiv.pkl  (exactly one weight file: *.pkl or *.safetensors)
//! ```
//! Contrastive pretraining checkpoints carry a `logit_scale` scalar that no graph
//! encoder consumes; it is dropped on load.

use crate::core::{ConfigErrorType, ProcessingContext, UnifiedError, UnifiedResult};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";
const LOGIT_SCALE_KEY: &str = "logit_scale";
const WEIGHT_EXTENSIONS: [&str; 2] = ["pkl", "safetensors"];

/// Flat attribute bag deserialized from a pretrained `config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PretrainedGraphConfig {
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl PretrainedGraphConfig {
    pub fn from_map(attributes: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn get_usize(&self, key: &str) -> UnifiedResult<usize> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .ok_or_else(|| UnifiedError::Configuration {
                operation: "read pretrained graph config".to_string(),
                reason: ConfigErrorType::MissingField(key.to_string()),
                context: Some("expected a non-negative integer".to_string()),
            })
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Attribute bag plus the raw state dict of a pretrained graph model
#[derive(Debug, Clone)]
pub struct PretrainedGraphCheckpoint {
    pub config: PretrainedGraphConfig,
    pub tensors: HashMap<String, Tensor>,
    pub weights_path: PathBuf,
}

/// Load `config.json` and the single weight file of a pretrained graph model
pub fn load_pretrained_graph_model(
    model_dir: impl AsRef<Path>,
    device: &Device,
) -> UnifiedResult<PretrainedGraphCheckpoint> {
    let model_dir = model_dir.as_ref();
    let config_path = model_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(UnifiedError::ConfigMissing { path: model_dir.to_path_buf() });
    }

    let config_str = std::fs::read_to_string(&config_path)?;
    let config: PretrainedGraphConfig =
        serde_json::from_str(&config_str).map_err(|e| UnifiedError::Configuration {
            operation: "pretrained graph config parsing".to_string(),
            reason: ConfigErrorType::ParseError(e.to_string()),
            context: Some(format!("{:?}", config_path)),
        })?;

    let weights_path = find_weight_file(model_dir)?;
    info!(path = ?weights_path, "loading graph pretrain model");

    let mut tensors = read_state_dict(&weights_path, device)?;
    if tensors.remove(LOGIT_SCALE_KEY).is_some() {
        debug!("dropped {} from pretrained state dict", LOGIT_SCALE_KEY);
    }

    Ok(PretrainedGraphCheckpoint {
        config,
        tensors,
        weights_path,
    })
}

/// Read a state dict from a `.safetensors` file or a torch pickle
pub fn read_state_dict(path: &Path, device: &Device) -> UnifiedResult<HashMap<String, Tensor>> {
    let is_safetensors = path
        .extension()
        .map(|ext| ext == "safetensors")
        .unwrap_or(false);

    let raw: HashMap<String, Tensor> = if is_safetensors {
        candle_core::safetensors::load(path, &Device::Cpu).processing("read safetensors state dict")?
    } else {
        candle_core::pickle::read_all(path)
            .processing("read pickled state dict")?
            .into_iter()
            .collect()
    };

    raw.into_iter()
        .map(|(name, tensor)| {
            let tensor = tensor.to_device(device).processing("move state dict to device")?;
            Ok((name, tensor))
        })
        .collect()
}

fn find_weight_file(model_dir: &Path) -> UnifiedResult<PathBuf> {
    for ext in WEIGHT_EXTENSIONS {
        let mut matches: Vec<PathBuf> = std::fs::read_dir(model_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map(|e| e == ext).unwrap_or(false))
            .collect();
        matches.sort();

        match matches.len() {
            0 => continue,
            1 => return Ok(matches.remove(0)),
            n => {
                return Err(UnifiedError::Validation {
                    field: format!("*.{} weight files", ext),
                    expected: "exactly one".to_string(),
                    actual: n.to_string(),
                    context: Some(format!("{:?}", model_dir)),
                })
            }
        }
    }

    Err(UnifiedError::Configuration {
        operation: "find graph model weights".to_string(),
        reason: ConfigErrorType::FileNotFound(format!("{:?}/*.pkl", model_dir)),
        context: Some("Expected one *.pkl or *.safetensors file".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn write_checkpoint(dir: &Path, with_logit_scale: bool) {
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"{"gnn_input": 128, "gnn_output": 128, "gt_layers": 3, "if_pos": false}"#,
        )
        .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(
            "gnn.W_P.weight".to_string(),
            Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        if with_logit_scale {
            tensors.insert(
                LOGIT_SCALE_KEY.to_string(),
                Tensor::new(&[2.6592f32], &Device::Cpu).unwrap(),
            );
        }
        candle_core::safetensors::save(&tensors, dir.join("clip_gt.safetensors")).unwrap();
    }

    #[test]
    fn test_missing_config_is_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_pretrained_graph_model(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, UnifiedError::ConfigMissing { .. }));
    }

    #[test]
    fn test_loads_attribute_bag_and_drops_logit_scale() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), true);

        let ckpt = load_pretrained_graph_model(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(ckpt.config.get_usize("gt_layers").unwrap(), 3);
        assert_eq!(ckpt.config.get("if_pos"), Some(&serde_json::Value::Bool(false)));
        assert!(ckpt.tensors.contains_key("gnn.W_P.weight"));
        assert!(!ckpt.tensors.contains_key(LOGIT_SCALE_KEY));
    }

    #[test]
    fn test_missing_weight_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        let err = load_pretrained_graph_model(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            UnifiedError::Configuration {
                reason: ConfigErrorType::FileNotFound(_),
                ..
            }
        ));
    }

    #[test]
    fn test_missing_attribute_reports_field() {
        let config = PretrainedGraphConfig::default();
        match config.get_usize("gnn_output") {
            Err(UnifiedError::Configuration {
                reason: ConfigErrorType::MissingField(field),
                ..
            }) => assert_eq!(field, "gnn_output"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
