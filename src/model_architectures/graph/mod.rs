//! Graph-conditioned causal language model
//!
//! ## Components
//! - **config**: `GraphLlamaConfig` and the marker ids shared with the splicer
//! - **graph_tower**: external graph encoder contract, tower kinds and construction
//! - **projector**: graph feature width -> LLM hidden size
//! - **splicer**: replaces marker positions with projected node features
//! - **registrar**: marker token registration and embedding row bookkeeping
//! - **backbone**: candle Llama decoder fed with spliced embeddings
//! - **model**: `GraphLlamaForCausalLM`, generation and loss
//! - **registry**: `model_type` -> loader

pub mod backbone;
pub mod config;
pub mod graph_tower;
pub mod model;
pub mod projector;
pub mod registrar;
pub mod registry;
pub mod splicer;

pub use backbone::{DecoderBackbone, LlamaBackbone};
pub use config::{GraphLlamaConfig, GraphMarkerConfig};
pub use graph_tower::{
    GraphBatch, GraphData, GraphEncoder, GraphEncoderFamily, GraphInput, GraphTowerKind,
    GraphTowerRegistry, GraphTowerSlot, GraphTowerSpec,
};
pub use model::{
    prepare_inputs_for_generation, shifted_cross_entropy, GenerationConfig, GenerationResult,
    GraphLlamaForCausalLM, GraphModuleArgs,
};
pub use projector::{GraphProjector, DUMMY_PATCH_COUNT};
pub use registrar::{register_markers, EmbeddingTables, MarkerRegistration, RegistrationOptions};
pub use registry::ModelRegistry;
pub use splicer::{EmbeddingSplicer, PositionRole, SplicedBatch, TextOnlyCursor, TrainabilityMask};
