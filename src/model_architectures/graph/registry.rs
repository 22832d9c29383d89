//! Model registration by `model_type`
//!
//! The application builds a [`ModelRegistry`] at startup (usually via
//! [`ModelRegistry::with_defaults`]) and loads checkpoints through it; the `model_type`
//! field of `config.json` selects the loader.

use crate::core::{ConfigErrorType, UnifiedError, UnifiedResult};
use crate::model_architectures::graph::config::{GraphLlamaConfig, MODEL_TYPE};
use crate::model_architectures::graph::model::GraphLlamaForCausalLM;
use candle_core::Device;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub type ModelLoader = fn(&Path, &Device) -> UnifiedResult<GraphLlamaForCausalLM>;

#[derive(Default)]
pub struct ModelRegistry {
    loaders: HashMap<String, ModelLoader>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `GraphLlama` mapped to [`GraphLlamaForCausalLM::from_pretrained`]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MODEL_TYPE, |dir, device| GraphLlamaForCausalLM::from_pretrained(dir, device));
        registry
    }

    pub fn register(&mut self, model_type: &str, loader: ModelLoader) -> &mut Self {
        self.loaders.insert(model_type.to_string(), loader);
        self
    }

    pub fn is_registered(&self, model_type: &str) -> bool {
        self.loaders.contains_key(model_type)
    }

    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Load the model in `model_dir`, dispatching on its `model_type`
    pub fn load(&self, model_dir: impl AsRef<Path>, device: &Device) -> UnifiedResult<GraphLlamaForCausalLM> {
        let model_dir = model_dir.as_ref();
        let config = GraphLlamaConfig::from_pretrained(model_dir)?;
        let loader = self.loaders.get(&config.model_type).ok_or_else(|| UnifiedError::Configuration {
            operation: "resolve model type".to_string(),
            reason: ConfigErrorType::InvalidData(format!("unregistered model_type '{}'", config.model_type)),
            context: Some(format!("registered: {:?}", self.model_types())),
        })?;
        debug!(model_type = %config.model_type, "dispatching model loader");
        loader(model_dir, device)
    }
}
