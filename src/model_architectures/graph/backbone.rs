//! Decoder backbone
//!
//! The transformer stack itself comes from `candle_transformers::models::llama`. This
//! module only wires our embedding tables into it and keeps the KV cache alongside.

use crate::core::{ConfigErrorType, ModelErrorType, ProcessingContext, UnifiedError, UnifiedResult};
use crate::model_architectures::graph::config::GraphLlamaConfig;
use crate::model_architectures::graph::registrar::EmbeddingTables;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaEosToks};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

pub const EMBED_TOKENS_KEY: &str = "model.embed_tokens.weight";
pub const LM_HEAD_KEY: &str = "lm_head.weight";

/// Decoder consuming already-embedded (and spliced) inputs
pub trait DecoderBackbone {
    /// Logits of the last position, `[B, vocab_size]` in f32
    fn forward_embeds(&mut self, inputs_embeds: &Tensor, index_pos: usize) -> UnifiedResult<Tensor>;

    /// Drop cached keys/values before a new sequence
    fn reset_cache(&mut self) -> UnifiedResult<()>;

    fn eos_token_ids(&self) -> Vec<u32>;
}

pub struct LlamaBackbone {
    llama: Llama,
    cache: Cache,
    config: Config,
    dtype: DType,
    device: Device,
}

impl LlamaBackbone {
    /// Build the Llama stack from `weights` with the embedding and lm head rows taken
    /// from `tables`
    pub fn new(
        weights: &HashMap<String, Tensor>,
        tables: &EmbeddingTables,
        config: &GraphLlamaConfig,
        dtype: DType,
        device: &Device,
    ) -> UnifiedResult<Self> {
        let config = config.llama_config()?.into_config(false);
        if config.vocab_size != tables.vocab_size() {
            return Err(UnifiedError::Validation {
                field: "vocab_size".to_string(),
                expected: tables.vocab_size().to_string(),
                actual: config.vocab_size.to_string(),
                context: Some("config and embedding tables disagree".to_string()),
            });
        }

        let mut tensors = weights.clone();
        tensors.insert(EMBED_TOKENS_KEY.to_string(), tables.input().clone());
        if !config.tie_word_embeddings {
            tensors.insert(LM_HEAD_KEY.to_string(), tables.output().clone());
        }
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        let llama = Llama::load(vb, &config).model_err(ModelErrorType::Backbone, "load llama")?;
        let cache = Cache::new(true, dtype, &config, device)
            .model_err(ModelErrorType::Backbone, "create kv cache")?;
        debug!(
            layers = config.num_hidden_layers,
            vocab_size = config.vocab_size,
            "built llama backbone"
        );
        Ok(Self {
            llama,
            cache,
            config,
            dtype,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl DecoderBackbone for LlamaBackbone {
    fn forward_embeds(&mut self, inputs_embeds: &Tensor, index_pos: usize) -> UnifiedResult<Tensor> {
        let inputs_embeds = inputs_embeds
            .to_dtype(self.dtype)
            .processing("cast embeddings to backbone dtype")?;
        self.llama
            .forward_input_embed(&inputs_embeds, index_pos, &mut self.cache)
            .model_err(ModelErrorType::Backbone, "llama forward")
    }

    fn reset_cache(&mut self) -> UnifiedResult<()> {
        self.cache = Cache::new(true, self.dtype, &self.config, &self.device)
            .model_err(ModelErrorType::Backbone, "reset kv cache")?;
        Ok(())
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        match &self.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }
}

/// Read every `*.safetensors` shard in `model_dir` into one name -> tensor map
pub fn load_backbone_weights(
    model_dir: &Path,
    dtype: DType,
    device: &Device,
) -> UnifiedResult<HashMap<String, Tensor>> {
    let mut shards: Vec<_> = std::fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    shards.sort();
    if shards.is_empty() {
        return Err(UnifiedError::Configuration {
            operation: "find model weights".to_string(),
            reason: ConfigErrorType::FileNotFound(format!("{:?}/*.safetensors", model_dir)),
            context: Some("Expected safetensors weights in model directory".to_string()),
        });
    }

    let mut weights = HashMap::new();
    for shard in &shards {
        let tensors = candle_core::safetensors::load(shard, device)
            .model_err(ModelErrorType::Backbone, "load safetensors shard")?;
        for (name, tensor) in tensors {
            let tensor = tensor.to_dtype(dtype).processing("cast backbone weight")?;
            weights.insert(name, tensor);
        }
    }
    info!(shards = shards.len(), tensors = weights.len(), "loaded backbone weights");
    Ok(weights)
}
