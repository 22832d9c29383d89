//! GraphLlama configuration
//!
//! Loaded from (and persisted to) `config.json` in the model directory. Graph-specific
//! fields sit next to the Llama backbone fields; everything the graph layer does not
//! interpret is kept verbatim in `backbone` and handed to candle's `LlamaConfig`.

use crate::core::{ConfigErrorType, UnifiedError, UnifiedResult};
use candle_transformers::models::llama::LlamaConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MODEL_TYPE: &str = "GraphLlama";

pub const DEFAULT_GRAPH_TOKEN: &str = "<graph>";
pub const DEFAULT_GRAPH_PATCH_TOKEN: &str = "<g_patch>";
pub const DEFAULT_G_START_TOKEN: &str = "<g_start>";
pub const DEFAULT_G_END_TOKEN: &str = "<g_end>";

/// Marker token ids read by the embedding splicer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMarkerConfig {
    #[serde(default)]
    pub graph_patch_token: Option<u32>,
    #[serde(default)]
    pub graph_start_token: Option<u32>,
    #[serde(default)]
    pub graph_end_token: Option<u32>,
    #[serde(default)]
    pub use_graph_start_end: bool,
}

impl GraphMarkerConfig {
    pub fn patch_token(&self) -> UnifiedResult<u32> {
        self.graph_patch_token.ok_or_else(|| missing_marker("graph_patch_token"))
    }

    /// START and END ids, required only in start/end mode
    pub fn start_end_tokens(&self) -> UnifiedResult<(u32, u32)> {
        let start = self.graph_start_token.ok_or_else(|| missing_marker("graph_start_token"))?;
        let end = self.graph_end_token.ok_or_else(|| missing_marker("graph_end_token"))?;
        Ok((start, end))
    }
}

fn missing_marker(field: &str) -> UnifiedError {
    UnifiedError::Configuration {
        operation: "read graph marker ids".to_string(),
        reason: ConfigErrorType::MissingField(field.to_string()),
        context: Some("register graph marker tokens before splicing".to_string()),
    }
}

fn default_model_type() -> String {
    MODEL_TYPE.to_string()
}

fn default_graph_hidden_size() -> usize {
    128
}

fn default_graph_select_layer() -> i64 {
    -2
}

/// GraphLlama model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLlamaConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,

    pub hidden_size: usize,
    pub vocab_size: usize,

    /// Graph tower tag (`MPNN`, `clip_gcn_arxiv`, `clip_gt`, ...)
    #[serde(default)]
    pub graph_tower: Option<String>,

    #[serde(default = "default_graph_hidden_size")]
    pub graph_hidden_size: usize,

    #[serde(default = "default_graph_select_layer")]
    pub graph_select_layer: i64,

    #[serde(default)]
    pub use_graph_proj: bool,

    #[serde(default)]
    pub pretrain_graph_model_path: Option<String>,

    #[serde(flatten)]
    pub markers: GraphMarkerConfig,

    /// Remaining keys, passed through to the Llama backbone
    #[serde(flatten)]
    pub backbone: serde_json::Map<String, serde_json::Value>,
}

impl GraphLlamaConfig {
    /// Load configuration from a model directory
    pub fn from_pretrained(model_path: impl AsRef<Path>) -> UnifiedResult<Self> {
        let model_path = model_path.as_ref();
        let config_path = model_path.join("config.json");
        if !config_path.exists() {
            return Err(UnifiedError::ConfigMissing {
                path: model_path.to_path_buf(),
            });
        }
        let config_str = std::fs::read_to_string(&config_path)?;
        Self::from_json_str(&config_str).map_err(|e| match e {
            UnifiedError::Configuration { operation, reason, .. } => UnifiedError::Configuration {
                operation,
                reason,
                context: Some(format!("Failed to parse config.json from {:?}", model_path)),
            },
            other => other,
        })
    }

    pub fn from_json_str(config_str: &str) -> UnifiedResult<Self> {
        serde_json::from_str(config_str).map_err(|e| UnifiedError::Configuration {
            operation: "config JSON parsing".to_string(),
            reason: ConfigErrorType::ParseError(e.to_string()),
            context: None,
        })
    }

    /// Write `config.json` so graph settings and marker ids travel with the checkpoint
    pub fn save_pretrained(&self, model_path: impl AsRef<Path>) -> UnifiedResult<()> {
        let config_path = model_path.as_ref().join("config.json");
        let json = serde_json::to_string_pretty(self).map_err(|e| UnifiedError::Configuration {
            operation: "config JSON serialization".to_string(),
            reason: ConfigErrorType::InvalidData(e.to_string()),
            context: None,
        })?;
        std::fs::write(config_path, json)?;
        Ok(())
    }

    /// Backbone view with the current vocabulary and hidden sizes
    pub fn llama_config(&self) -> UnifiedResult<LlamaConfig> {
        let mut map = self.backbone.clone();
        map.insert("hidden_size".to_string(), self.hidden_size.into());
        map.insert("vocab_size".to_string(), self.vocab_size.into());
        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
            UnifiedError::Configuration {
                operation: "llama backbone config".to_string(),
                reason: ConfigErrorType::ParseError(e.to_string()),
                context: Some(
                    "config.json must carry the llama keys (intermediate_size, num_hidden_layers, \
                     num_attention_heads, rms_norm_eps, max_position_embeddings, ...)"
                        .to_string(),
                ),
            }
        })
    }

    pub fn tie_word_embeddings(&self) -> bool {
        self.backbone
            .get("tie_word_embeddings")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
