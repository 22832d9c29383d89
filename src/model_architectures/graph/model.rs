//! GraphLlama causal language model
//!
//! Token embeddings come from the registrar-managed [`EmbeddingTables`]. When a graph
//! tower is attached and graph data is supplied, the graphs are encoded (frozen),
//! projected, and spliced into the embeddings before the Llama backbone runs.
//!
//! ## Usage Example
//! ```ignore
//! let mut model = GraphLlamaForCausalLM::from_pretrained("./checkpoints/graphgpt", &device)?;
//! model.initialize_graph_modules(&towers, GraphModuleArgs::new(GraphTowerKind::ClipGt))?;
//! model.register_markers(&mut tokenizer, &RegistrationOptions { use_start_end: true, ..Default::default() })?;
//!
//! let result = model.generate(&tokenizer, &prompt, Some(graph), &GenerationConfig::default())?;
//! ```

use crate::core::{ConfigErrorType, ModelErrorType, ProcessingContext, UnifiedError, UnifiedResult};
use crate::model_architectures::graph::backbone::{
    load_backbone_weights, DecoderBackbone, LlamaBackbone, EMBED_TOKENS_KEY, LM_HEAD_KEY,
};
use crate::model_architectures::graph::config::GraphLlamaConfig;
use crate::model_architectures::graph::graph_tower::{
    GraphBatch, GraphInput, GraphTowerKind, GraphTowerRegistry, GraphTowerSlot,
};
use crate::model_architectures::graph::projector::GraphProjector;
use crate::model_architectures::graph::registrar::{
    self, EmbeddingTables, MarkerRegistration, RegistrationOptions,
};
use crate::model_architectures::graph::splicer::{EmbeddingSplicer, SplicedBatch, TextOnlyCursor};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Module, VarBuilder, VarMap};
use candle_transformers::generation::LogitsProcessor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

const GRAPH_PROJECTOR_PREFIX: &str = "model.graph_projector";

/// Labels with this value do not contribute to the loss
pub const IGNORE_INDEX: i64 = -100;

/// Generation configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,
    /// Sampling temperature (None = greedy)
    pub temperature: Option<f64>,
    /// Top-p (nucleus) sampling parameter
    pub top_p: Option<f64>,
    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Context size for repeat penalty
    pub repeat_last_n: usize,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: Some(0.7),
            top_p: None,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: 299792458,
        }
    }
}

/// Generation result
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Generated text (decoded, excluding prompt)
    pub text: String,
    /// All token IDs (including prompt)
    pub token_ids: Vec<u32>,
    pub num_generated: usize,
    pub tokens_per_second: f64,
}

/// Inputs for one decoding step
#[derive(Debug, Clone)]
pub struct GenerationStep {
    pub input_ids: Tensor,
    pub graph_batch: Option<GraphBatch>,
}

/// Trim the ids to the last token once a cache exists and wrap the graph into a list
pub fn prepare_inputs_for_generation(
    input_ids: &Tensor,
    has_cache: bool,
    graph: Option<GraphInput>,
) -> UnifiedResult<GenerationStep> {
    let input_ids = if has_cache {
        let seq_len = input_ids.dim(1).processing("read sequence length")?;
        let last = seq_len.saturating_sub(1);
        input_ids
            .narrow(1, last, seq_len - last)
            .processing("keep last token")?
    } else {
        input_ids.clone()
    };
    Ok(GenerationStep {
        input_ids,
        graph_batch: graph.map(GraphBatch::wrap),
    })
}

/// Next-token cross entropy: logits at position t predict the label at t + 1
///
/// Standalone training helper. [`GraphLlamaForCausalLM::forward`] only returns
/// last-position logits, so the caller supplies full-sequence `logits: [B, L, V]`
/// from its own decoder pass. `labels`: `[B, L]` integer ids; positions labelled
/// [`IGNORE_INDEX`] are skipped, every other label must lie in `0..V`.
pub fn shifted_cross_entropy(logits: &Tensor, labels: &Tensor) -> UnifiedResult<Tensor> {
    let (batch, seq_len, vocab_size) = logits.dims3().processing("read logits shape")?;
    if seq_len < 2 {
        return Err(UnifiedError::Validation {
            field: "sequence length".to_string(),
            expected: ">= 2".to_string(),
            actual: seq_len.to_string(),
            context: Some("shifted loss needs a next token".to_string()),
        });
    }
    let labels = labels
        .to_dtype(DType::I64)
        .and_then(|t| t.to_vec2::<i64>())
        .processing("read labels")?;

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (b, sample) in labels.iter().enumerate() {
        for (t, &label) in sample.iter().enumerate().skip(1) {
            if label == IGNORE_INDEX {
                continue;
            }
            if label < 0 || label as usize >= vocab_size {
                return Err(UnifiedError::Validation {
                    field: "labels".to_string(),
                    expected: format!("{} or a token id in 0..{}", IGNORE_INDEX, vocab_size),
                    actual: label.to_string(),
                    context: Some(format!("sample {}, position {}", b, t)),
                });
            }
            rows.push((b * (seq_len - 1) + t - 1) as u32);
            targets.push(label as u32);
        }
    }
    if rows.is_empty() {
        return Err(UnifiedError::Validation {
            field: "labels".to_string(),
            expected: "at least one supervised position".to_string(),
            actual: "all positions ignored".to_string(),
            context: None,
        });
    }

    let device = logits.device();
    let num_rows = rows.len();
    let rows = Tensor::from_vec(rows, num_rows, device).processing("index supervised rows")?;
    let targets = Tensor::from_vec(targets, num_rows, device).processing("build targets")?;
    let shifted = logits
        .narrow(1, 0, seq_len - 1)
        .and_then(|t| t.reshape((batch * (seq_len - 1), vocab_size)))
        .and_then(|t| t.index_select(&rows, 0))
        .and_then(|t| t.to_dtype(DType::F32))
        .processing("shift logits")?;
    candle_nn::loss::cross_entropy(&shifted, &targets).processing("cross entropy")
}

/// Arguments of [`GraphLlamaForCausalLM::initialize_graph_modules`]
#[derive(Debug, Clone)]
pub struct GraphModuleArgs {
    pub graph_tower: GraphTowerKind,
    pub graph_select_layer: i64,
    /// CLIP checkpoint directory for the pretrained tower kinds
    pub pretrain_graph_model_path: Option<PathBuf>,
    /// Projector adapter checkpoint
    pub pretrain_graph_mlp_adapter: Option<PathBuf>,
    /// Hold the tower through a shared handle
    pub sharded: bool,
}

impl GraphModuleArgs {
    pub fn new(graph_tower: GraphTowerKind) -> Self {
        Self {
            graph_tower,
            graph_select_layer: -2,
            pretrain_graph_model_path: None,
            pretrain_graph_mlp_adapter: None,
            sharded: false,
        }
    }
}

/// Llama causal LM with graph feature splicing
pub struct GraphLlamaForCausalLM {
    config: GraphLlamaConfig,
    tables: EmbeddingTables,
    backbone_weights: HashMap<String, Tensor>,
    backbone: LlamaBackbone,
    graph_tower: Option<GraphTowerSlot>,
    projector: Option<GraphProjector>,
    text_only_cursor: TextOnlyCursor,
    training: bool,
    dtype: DType,
    device: Device,
}

impl GraphLlamaForCausalLM {
    /// Load a GraphLlama model from a directory holding `config.json` and safetensors weights
    pub fn from_pretrained(model_path: impl AsRef<Path>, device: &Device) -> UnifiedResult<Self> {
        let model_dir = model_path.as_ref();
        info!(path = ?model_dir, "loading GraphLlama");
        let config = GraphLlamaConfig::from_pretrained(model_dir)?;

        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        let mut weights = load_backbone_weights(model_dir, dtype, device)?;

        let embed = weights.remove(EMBED_TOKENS_KEY).ok_or_else(|| missing_weight(EMBED_TOKENS_KEY))?;
        let lm_head = if config.tie_word_embeddings() {
            weights.remove(LM_HEAD_KEY);
            None
        } else {
            Some(weights.remove(LM_HEAD_KEY).ok_or_else(|| missing_weight(LM_HEAD_KEY))?)
        };
        let tables = EmbeddingTables::new(&embed, lm_head.as_ref())?;

        let projector = match (
            weights.remove(&format!("{}.weight", GRAPH_PROJECTOR_PREFIX)),
            weights.remove(&format!("{}.bias", GRAPH_PROJECTOR_PREFIX)),
        ) {
            (Some(weight), Some(bias)) if config.use_graph_proj => {
                Some(GraphProjector::from_tensors(weight, bias)?)
            }
            _ => None,
        };

        let backbone = LlamaBackbone::new(&weights, &tables, &config, dtype, device)?;
        info!(
            vocab_size = tables.vocab_size(),
            hidden_size = tables.hidden_size(),
            graph_projector = projector.is_some(),
            "GraphLlama loaded"
        );

        Ok(Self {
            config,
            tables,
            backbone_weights: weights,
            backbone,
            graph_tower: None,
            projector,
            text_only_cursor: TextOnlyCursor::default(),
            training: false,
            dtype,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &GraphLlamaConfig {
        &self.config
    }

    pub fn tables(&self) -> &EmbeddingTables {
        &self.tables
    }

    pub fn graph_tower(&self) -> Option<&GraphTowerSlot> {
        self.graph_tower.as_ref()
    }

    pub fn projector(&self) -> Option<&GraphProjector> {
        self.projector.as_ref()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn set_text_only_cursor(&mut self, policy: TextOnlyCursor) {
        self.text_only_cursor = policy;
    }

    /// Attach the graph tower and the projector
    ///
    /// An already attached tower is kept. A newly built tower's `output_size()` becomes
    /// `graph_hidden_size`, since that is the width the projector consumes. The projector
    /// is created fresh unless one exists, then optionally overwritten from
    /// `pretrain_graph_mlp_adapter`.
    pub fn initialize_graph_modules(
        &mut self,
        towers: &GraphTowerRegistry,
        args: GraphModuleArgs,
    ) -> UnifiedResult<()> {
        if self.graph_tower.is_none() {
            let pretrain_path = args
                .pretrain_graph_model_path
                .clone()
                .or_else(|| self.config.pretrain_graph_model_path.as_ref().map(PathBuf::from));
            let encoder = towers.build(
                args.graph_tower,
                self.config.graph_hidden_size,
                pretrain_path.as_deref(),
                self.dtype,
                &self.device,
            )?;
            if encoder.output_size() != self.config.graph_hidden_size {
                debug!(
                    configured = self.config.graph_hidden_size,
                    tower = encoder.output_size(),
                    "graph_hidden_size follows the tower output width"
                );
                self.config.graph_hidden_size = encoder.output_size();
            }
            self.graph_tower = Some(GraphTowerSlot::new(encoder, args.sharded));
        }

        self.config.graph_tower = Some(args.graph_tower.as_str().to_string());
        self.config.use_graph_proj = true;
        self.config.graph_select_layer = args.graph_select_layer;
        if let Some(path) = &args.pretrain_graph_model_path {
            self.config.pretrain_graph_model_path = Some(path.to_string_lossy().into_owned());
        }

        let graph_hidden_size = self.config.graph_hidden_size;
        match &self.projector {
            Some(projector) if projector.graph_hidden_size() != graph_hidden_size => {
                return Err(UnifiedError::Validation {
                    field: "graph_projector input width".to_string(),
                    expected: graph_hidden_size.to_string(),
                    actual: projector.graph_hidden_size().to_string(),
                    context: Some(format!("output size of {}", args.graph_tower.as_str())),
                });
            }
            Some(_) => {}
            None => {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
                self.projector = Some(GraphProjector::new(
                    graph_hidden_size,
                    self.config.hidden_size,
                    vb.pp(GRAPH_PROJECTOR_PREFIX),
                )?);
            }
        }
        if let (Some(projector), Some(adapter)) =
            (self.projector.as_mut(), args.pretrain_graph_mlp_adapter.as_deref())
        {
            projector.load_adapter(adapter)?;
        }

        info!(
            tower = args.graph_tower.as_str(),
            sharded = args.sharded,
            graph_hidden_size,
            "initialized graph modules"
        );
        Ok(())
    }

    /// Register graph marker tokens and rebuild the backbone around the grown tables
    pub fn register_markers(
        &mut self,
        tokenizer: &mut Tokenizer,
        options: &RegistrationOptions,
    ) -> UnifiedResult<MarkerRegistration> {
        let registration =
            registrar::register_markers(tokenizer, &mut self.tables, &mut self.config.markers, options)?;
        if self.config.vocab_size != registration.vocab_size {
            self.config.vocab_size = registration.vocab_size;
            self.rebuild_backbone()?;
        }
        Ok(registration)
    }

    /// Put the pre-registration embedding rows back after an adapter-tuning step
    pub fn restore_original_rows(&mut self) -> UnifiedResult<()> {
        self.tables.restore_original_rows()
    }

    fn rebuild_backbone(&mut self) -> UnifiedResult<()> {
        self.backbone = LlamaBackbone::new(
            &self.backbone_weights,
            &self.tables,
            &self.config,
            self.dtype,
            &self.device,
        )?;
        Ok(())
    }

    /// Trainable parameters: embedding tables per their flags and the projector
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.tables.trainable_vars();
        if let Some(projector) = &self.projector {
            vars.extend(projector.vars());
        }
        vars
    }

    /// `[B, L]` ids -> `[B, L, D]` embeddings
    pub fn embed_tokens(&self, input_ids: &Tensor) -> UnifiedResult<Tensor> {
        Embedding::new(self.tables.input().clone(), self.tables.hidden_size())
            .forward(input_ids)
            .model_err(ModelErrorType::Embedding, "embed input ids")
    }

    /// Embed `input_ids` and splice the encoded graphs of `graph_batch` into them
    pub fn splice_inputs(&self, input_ids: &Tensor, graph_batch: &GraphBatch) -> UnifiedResult<SplicedBatch> {
        let tower = self.graph_tower.as_ref().ok_or_else(|| missing_module("graph tower"))?;
        let projector = self.projector.as_ref().ok_or_else(|| missing_module("graph projector"))?;

        let inputs_embeds = self.embed_tokens(input_ids)?;
        let graph_features = projector.project_all(&tower.encode_batch(graph_batch)?)?;
        let dummy_features = projector.dummy_features(self.dtype, &self.device)?;
        EmbeddingSplicer::new(&self.config.markers)
            .protect_original(self.tables.has_snapshot())
            .text_only_cursor(self.text_only_cursor)
            .splice(input_ids, &inputs_embeds, &graph_features, &dummy_features)
    }

    /// Last-position logits `[B, vocab_size]`
    ///
    /// Graphs are spliced only with a tower attached, graph data supplied, and either
    /// more than one input position or training mode.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        graph_batch: Option<&GraphBatch>,
        index_pos: usize,
    ) -> UnifiedResult<Tensor> {
        let seq_len = input_ids.dim(1).processing("read sequence length")?;
        let inputs_embeds = match graph_batch {
            Some(batch) if self.graph_tower.is_some() && (seq_len != 1 || self.training) => {
                self.splice_inputs(input_ids, batch)?.inputs_embeds
            }
            _ => self.embed_tokens(input_ids)?,
        };
        self.backbone.forward_embeds(&inputs_embeds, index_pos)
    }

    /// Generate a continuation of `prompt`, conditioning on `graph` when given
    pub fn generate(
        &mut self,
        tokenizer: &Tokenizer,
        prompt: &str,
        graph: Option<GraphInput>,
        gen_config: &GenerationConfig,
    ) -> UnifiedResult<GenerationResult> {
        let start_time = std::time::Instant::now();
        let encoding = tokenizer
            .encode(prompt, true)
            .map_err(|e| UnifiedError::Configuration {
                operation: "tokenization".to_string(),
                reason: ConfigErrorType::ParseError(e.to_string()),
                context: Some("Failed to tokenize input prompt".to_string()),
            })?;
        let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
        let prompt_len = tokens.len();
        if prompt_len == 0 {
            return Err(UnifiedError::Validation {
                field: "prompt".to_string(),
                expected: "at least one token".to_string(),
                actual: "0 tokens".to_string(),
                context: None,
            });
        }

        self.backbone.reset_cache()?;
        let mut logits_processor =
            LogitsProcessor::new(gen_config.seed, gen_config.temperature, gen_config.top_p);
        let eos_tokens = self.backbone.eos_token_ids();

        let mut index_pos = 0;
        for step in 0..gen_config.max_new_tokens {
            let all_ids = Tensor::new(tokens.as_slice(), &self.device)
                .and_then(|t| t.unsqueeze(0))
                .processing("create input tensor")?;
            let inputs = prepare_inputs_for_generation(&all_ids, step > 0, graph.clone())?;
            let step_len = inputs.input_ids.dim(1).processing("read step length")?;

            let logits = self
                .forward(&inputs.input_ids, inputs.graph_batch.as_ref(), index_pos)?
                .squeeze(0)
                .processing("squeeze batch")?;
            index_pos += step_len;

            let logits = if gen_config.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(gen_config.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    gen_config.repeat_penalty,
                    &tokens[start_at..],
                )
                .processing("apply repeat penalty")?
            };

            let next_token = logits_processor.sample(&logits).processing("sample next token")?;
            if eos_tokens.contains(&next_token) {
                break;
            }
            tokens.push(next_token);
        }

        let generated = &tokens[prompt_len..];
        let text = tokenizer
            .decode(generated, true)
            .map_err(|e| UnifiedError::Processing {
                operation: "decode tokens".to_string(),
                reason: e.to_string(),
                input_context: None,
            })?;
        let num_generated = generated.len();
        let tokens_per_second = num_generated as f64 / start_time.elapsed().as_secs_f64();
        debug!(num_generated, tokens_per_second, "generation finished");

        Ok(GenerationResult {
            text,
            token_ids: tokens,
            num_generated,
            tokens_per_second,
        })
    }
}

fn missing_weight(name: &str) -> UnifiedError {
    UnifiedError::Model {
        model_type: ModelErrorType::Backbone,
        operation: "load weights".to_string(),
        reason: format!("missing tensor {}", name),
        context: None,
    }
}

fn missing_module(name: &str) -> UnifiedError {
    UnifiedError::Configuration {
        operation: "splice graph features".to_string(),
        reason: ConfigErrorType::MissingField(name.to_string()),
        context: Some("call initialize_graph_modules first".to_string()),
    }
}
