//! Core shared infrastructure
//!
//! - `errors`: the crate-wide `UnifiedError` type and its helpers
//! - `pretrained`: directory loader for pretrained graph-encoder checkpoints

pub mod errors;
pub mod pretrained;

pub use errors::{ConfigErrorType, ModelErrorType, ProcessingContext, UnifiedError, UnifiedResult};
pub use pretrained::{load_pretrained_graph_model, PretrainedGraphCheckpoint, PretrainedGraphConfig};
