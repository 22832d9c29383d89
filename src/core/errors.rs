//! Unified error type
//!
//! Every fallible operation in the crate returns [`UnifiedResult`]. The generic
//! `Configuration` / `Model` / `Processing` / `Validation` variants carry an operation
//! label; the graph-splicing and registration failures have dedicated variants so
//! callers can match on the exact kind.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate
pub type UnifiedResult<T> = Result<T, UnifiedError>;

/// What went wrong while reading configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorType {
    FileNotFound(String),
    ParseError(String),
    MissingField(String),
    InvalidData(String),
}

impl std::fmt::Display for ConfigErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigErrorType::FileNotFound(path) => write!(f, "file not found: {}", path),
            ConfigErrorType::ParseError(msg) => write!(f, "parse error: {}", msg),
            ConfigErrorType::MissingField(field) => write!(f, "missing field: {}", field),
            ConfigErrorType::InvalidData(msg) => write!(f, "invalid data: {}", msg),
        }
    }
}

/// Which model component raised a `Model` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorType {
    Embedding,
    Projector,
    GraphTower,
    Backbone,
}

impl std::fmt::Display for ModelErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelErrorType::Embedding => "embedding",
            ModelErrorType::Projector => "graph projector",
            ModelErrorType::GraphTower => "graph tower",
            ModelErrorType::Backbone => "decoder backbone",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum UnifiedError {
    #[error("configuration error during {operation}: {reason}{}", fmt_context(.context))]
    Configuration {
        operation: String,
        reason: ConfigErrorType,
        context: Option<String>,
    },

    #[error("{model_type} error during {operation}: {reason}{}", fmt_context(.context))]
    Model {
        model_type: ModelErrorType,
        operation: String,
        reason: String,
        context: Option<String>,
    },

    #[error("processing error during {operation}: {reason}{}", fmt_context(.input_context))]
    Processing {
        operation: String,
        reason: String,
        input_context: Option<String>,
    },

    #[error("validation failed for {field}: expected {expected}, got {actual}{}", fmt_context(.context))]
    Validation {
        field: String,
        expected: String,
        actual: String,
        context: Option<String>,
    },

    /// Pretrained directory lacks its `config.json`
    #[error("config.json missing in pretrained directory {path:?}")]
    ConfigMissing { path: PathBuf },

    /// START/END counts differ, or PATCH count differs from the feature-set size
    #[error("sample {sample}: {marker} count mismatch, expected {expected}, found {actual}")]
    MarkerCountMismatch {
        sample: usize,
        marker: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("sample {sample}: graph patch tokens must be consecutive, found positions {positions:?}")]
    MarkerNotContiguous { sample: usize, positions: Vec<usize> },

    /// END marker absent at the offset implied by a START marker and its feature count
    #[error("sample {sample}: expected graph end token at position {position}, found {found:?}")]
    MarkerSequenceInvalid {
        sample: usize,
        position: usize,
        found: Option<u32>,
    },

    #[error("graph feature sets consumed ({consumed}) does not match supplied ({supplied})")]
    GraphFeatureCardinalityMismatch { consumed: usize, supplied: usize },

    #[error(
        "unexpected embed_tokens shape in adapter: pretrained {pretrained:?}, current {current:?}, new tokens {num_new_tokens}"
    )]
    AdapterShapeMismatch {
        pretrained: Vec<usize>,
        current: Vec<usize>,
        num_new_tokens: usize,
    },

    #[error("graph data is expected to be a list but got {actual}")]
    InputTypeInvalid { actual: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_context(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" ({})", ctx),
        None => String::new(),
    }
}

/// Attach an operation label to a candle error
pub trait ProcessingContext<T> {
    fn processing(self, operation: &str) -> UnifiedResult<T>;
    fn model_err(self, model_type: ModelErrorType, operation: &str) -> UnifiedResult<T>;
}

impl<T> ProcessingContext<T> for Result<T, candle_core::Error> {
    fn processing(self, operation: &str) -> UnifiedResult<T> {
        self.map_err(|e| UnifiedError::Processing {
            operation: operation.to_string(),
            reason: e.to_string(),
            input_context: None,
        })
    }

    fn model_err(self, model_type: ModelErrorType, operation: &str) -> UnifiedResult<T> {
        self.map_err(|e| UnifiedError::Model {
            model_type,
            operation: operation.to_string(),
            reason: e.to_string(),
            context: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = UnifiedError::Configuration {
            operation: "config JSON parsing".to_string(),
            reason: ConfigErrorType::ParseError("trailing comma".to_string()),
            context: Some("model dir ./graph".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("config JSON parsing"));
        assert!(msg.contains("trailing comma"));
        assert!(msg.ends_with("(model dir ./graph)"));
    }

    #[test]
    fn test_processing_context_wraps_candle_error() {
        let failing: Result<(), candle_core::Error> = Err(candle_core::Error::Msg("boom".into()));
        match failing.processing("stack spliced embeddings") {
            Err(UnifiedError::Processing { operation, reason, .. }) => {
                assert_eq!(operation, "stack spliced embeddings");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_marker_errors_are_distinct() {
        let count = UnifiedError::MarkerCountMismatch {
            sample: 1,
            marker: "graph patch",
            expected: 4,
            actual: 3,
        };
        assert!(count.to_string().contains("expected 4, found 3"));

        let gap = UnifiedError::MarkerNotContiguous {
            sample: 0,
            positions: vec![2, 3, 5],
        };
        assert!(gap.to_string().contains("[2, 3, 5]"));
    }
}
