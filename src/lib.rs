//! Graph-conditioned Llama on candle
//!
//! Graph encoder outputs are projected to the language model's hidden size and spliced
//! into the token embedding sequence at graph marker tokens before the decoder runs.

pub mod core;
pub mod model_architectures;

pub use crate::core::{UnifiedError, UnifiedResult};
pub use model_architectures::graph::{
    register_markers, EmbeddingSplicer, GenerationConfig, GraphBatch, GraphData, GraphInput,
    GraphLlamaConfig, GraphLlamaForCausalLM, GraphMarkerConfig, GraphProjector, GraphTowerKind,
    GraphTowerRegistry, ModelRegistry, RegistrationOptions,
};
