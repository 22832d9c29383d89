//! Model architectures
//!
//! - **graph**: GraphLlama, a Llama decoder whose input embeddings carry spliced graph features

pub mod graph;

pub use graph::{
    EmbeddingSplicer, GraphLlamaConfig, GraphLlamaForCausalLM, GraphProjector, ModelRegistry,
};
