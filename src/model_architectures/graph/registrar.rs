//! Graph marker token registration
//!
//! Adds the graph marker tokens to the tokenizer, grows the input/output embedding
//! tables to the new vocabulary and initializes the appended rows. The registrar is
//! the only writer of those rows.

use crate::core::pretrained::read_state_dict;
use crate::core::{ConfigErrorType, ProcessingContext, UnifiedError, UnifiedResult};
use crate::model_architectures::graph::config::{
    GraphMarkerConfig, DEFAULT_GRAPH_PATCH_TOKEN, DEFAULT_G_END_TOKEN, DEFAULT_G_START_TOKEN,
};
use candle_core::{DType, Tensor, Var};
use std::path::PathBuf;
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info, warn};

/// Adapter parameter holding the pretrained marker embeddings
pub const ADAPTER_EMBED_KEY: &str = "model.embed_tokens.weight";

#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Also register START/END markers around the patch run
    pub use_start_end: bool,
    /// Train the input table only; the lm head stays frozen
    pub tune_graph_mlp_adapter: bool,
    /// Adapter checkpoint whose `model.embed_tokens.weight` seeds the new rows
    pub pretrain_graph_mlp_adapter: Option<PathBuf>,
}

/// Outcome of [`register_markers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerRegistration {
    pub num_new_tokens: usize,
    pub vocab_size: usize,
}

/// Input embeddings and lm head, as resizable variables
///
/// `output` is `None` when the lm head is tied to the input table.
#[derive(Debug)]
pub struct EmbeddingTables {
    input: Var,
    output: Option<Var>,
    input_trainable: bool,
    output_trainable: bool,
    original_input: Option<Tensor>,
    original_vocab_size: usize,
}

impl EmbeddingTables {
    pub fn new(input: &Tensor, output: Option<&Tensor>) -> UnifiedResult<Self> {
        let (vocab_size, hidden_size) = input.dims2().processing("read input embedding shape")?;
        if let Some(output) = output {
            let dims = output.dims2().processing("read lm head shape")?;
            if dims != (vocab_size, hidden_size) {
                return Err(UnifiedError::Validation {
                    field: "lm_head.weight".to_string(),
                    expected: format!("[{}, {}]", vocab_size, hidden_size),
                    actual: format!("{:?}", output.dims()),
                    context: None,
                });
            }
        }
        Ok(Self {
            input: Var::from_tensor(input).processing("wrap input embeddings")?,
            output: output
                .map(Var::from_tensor)
                .transpose()
                .processing("wrap lm head")?,
            input_trainable: true,
            output_trainable: true,
            original_input: None,
            original_vocab_size: vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.input.dims()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.input.dims()[1]
    }

    pub fn input(&self) -> &Tensor {
        self.input.as_tensor()
    }

    /// lm head weights, the input table when tied
    pub fn output(&self) -> &Tensor {
        self.output.as_ref().unwrap_or(&self.input).as_tensor()
    }

    /// True once adapter tuning took its snapshot; splicing then detaches text rows
    pub fn has_snapshot(&self) -> bool {
        self.original_input.is_some()
    }

    pub fn is_tied(&self) -> bool {
        self.output.is_none()
    }

    pub fn input_trainable(&self) -> bool {
        self.input_trainable
    }

    pub fn output_trainable(&self) -> bool {
        self.output_trainable && self.output.is_some()
    }

    /// Variables an optimizer should update
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if self.input_trainable {
            vars.push(self.input.clone());
        }
        if let Some(output) = self.output.as_ref().filter(|_| self.output_trainable) {
            vars.push(output.clone());
        }
        vars
    }

    /// Grow (zero rows) or truncate both tables to `vocab_size`
    pub fn resize(&mut self, vocab_size: usize) -> UnifiedResult<()> {
        let current = self.vocab_size();
        if vocab_size == current {
            return Ok(());
        }
        self.input = Var::from_tensor(&resize_rows(self.input.as_tensor(), vocab_size)?)
            .processing("resize input embeddings")?;
        if let Some(output) = self.output.as_mut() {
            *output = Var::from_tensor(&resize_rows(output.as_tensor(), vocab_size)?)
                .processing("resize lm head")?;
        }
        debug!(from = current, to = vocab_size, "resized embedding tables");
        Ok(())
    }

    /// Set the last `num_new` rows of each table to the mean of the rows before them
    pub fn mean_init_new_rows(&mut self, num_new: usize) -> UnifiedResult<()> {
        if num_new == 0 {
            return Ok(());
        }
        let vocab_size = self.vocab_size();
        if num_new >= vocab_size {
            return Err(UnifiedError::Validation {
                field: "num_new_tokens".to_string(),
                expected: format!("< {}", vocab_size),
                actual: num_new.to_string(),
                context: Some("mean init needs at least one pre-existing row".to_string()),
            });
        }
        self.input.set(&mean_fill(self.input.as_tensor(), num_new)?)
            .processing("mean init input embeddings")?;
        if let Some(output) = self.output.as_ref() {
            output
                .set(&mean_fill(output.as_tensor(), num_new)?)
                .processing("mean init lm head")?;
        }
        Ok(())
    }

    /// Snapshot the input table and freeze the lm head
    pub fn enable_adapter_tuning(&mut self) -> UnifiedResult<()> {
        self.original_input = Some(self.input.as_tensor().copy().processing("snapshot input embeddings")?);
        self.input_trainable = true;
        self.output_trainable = false;
        Ok(())
    }

    /// Overwrite trailing input rows from an adapter `embed_tokens` tensor
    ///
    /// Accepts a full table of the current shape (its last `num_new` rows are used) or
    /// `[m, hidden]` with `1 <= m <= num_new`, written into the last `m` rows. A
    /// start/end adapter trained with two new tokens seeds the START and END rows of a
    /// registration that also added PATCH.
    pub fn load_new_rows(&mut self, pretrained: &Tensor, num_new: usize) -> UnifiedResult<()> {
        let current = self.input.dims().to_vec();
        let (vocab_size, hidden_size) = (current[0], current[1]);
        let mismatch = || UnifiedError::AdapterShapeMismatch {
            pretrained: pretrained.dims().to_vec(),
            current: current.clone(),
            num_new_tokens: num_new,
        };
        if num_new > vocab_size {
            return Err(mismatch());
        }
        let rows = match pretrained.dims() {
            dims if dims == current.as_slice() => pretrained
                .narrow(0, vocab_size - num_new, num_new)
                .processing("slice adapter marker rows")?,
            &[m, h] if h == hidden_size && (1..=num_new).contains(&m) => pretrained.clone(),
            _ => return Err(mismatch()),
        };
        let num_rows = rows.dim(0).processing("read adapter row count")?;
        let rows = rows
            .to_dtype(self.input.dtype())
            .and_then(|t| t.to_device(self.input.device()))
            .processing("prepare adapter marker rows")?;

        let kept = self
            .input
            .narrow(0, 0, vocab_size - num_rows)
            .processing("slice existing rows")?;
        let merged = Tensor::cat(&[&kept, &rows], 0).processing("merge adapter marker rows")?;
        self.input.set(&merged).processing("write adapter marker rows")
    }

    /// Put the pre-registration rows back from the adapter-tuning snapshot
    ///
    /// Run after an optimizer step so only the marker rows drift.
    pub fn restore_original_rows(&mut self) -> UnifiedResult<()> {
        let snapshot = self.original_input.as_ref().ok_or_else(|| UnifiedError::Validation {
            field: "original_input".to_string(),
            expected: "embedding snapshot".to_string(),
            actual: "none".to_string(),
            context: Some("enable adapter tuning before restoring rows".to_string()),
        })?;
        let keep = self.original_vocab_size.min(self.vocab_size());
        let restored = snapshot.narrow(0, 0, keep).processing("slice snapshot rows")?;
        let current = self.input.as_tensor();
        let merged = if keep < self.vocab_size() {
            let tail = current
                .narrow(0, keep, self.vocab_size() - keep)
                .processing("slice marker rows")?;
            Tensor::cat(&[&restored, &tail], 0).processing("merge restored rows")?
        } else {
            restored
        };
        self.input.set(&merged).processing("restore original rows")
    }
}

fn resize_rows(table: &Tensor, vocab_size: usize) -> UnifiedResult<Tensor> {
    let (current, hidden_size) = table.dims2().processing("read table shape")?;
    if vocab_size <= current {
        return table.narrow(0, 0, vocab_size).processing("truncate table");
    }
    let pad = Tensor::zeros((vocab_size - current, hidden_size), table.dtype(), table.device())
        .processing("allocate new rows")?;
    Tensor::cat(&[table, &pad], 0).processing("append new rows")
}

fn mean_fill(table: &Tensor, num_new: usize) -> UnifiedResult<Tensor> {
    let (vocab_size, hidden_size) = table.dims2().processing("read table shape")?;
    let old = table.narrow(0, 0, vocab_size - num_new).processing("slice existing rows")?;
    let mean = old
        .to_dtype(DType::F32)
        .and_then(|t| t.mean_keepdim(0))
        .and_then(|t| t.to_dtype(table.dtype()))
        .and_then(|t| t.broadcast_as((num_new, hidden_size)))
        .and_then(|t| t.contiguous())
        .processing("average existing rows")?;
    Tensor::cat(&[&old, &mean], 0).processing("append mean rows")
}

/// Add `content` as a special token unless the vocabulary already has it
fn ensure_token(tokenizer: &mut Tokenizer, content: &str) -> UnifiedResult<(u32, bool)> {
    if let Some(id) = tokenizer.token_to_id(content) {
        return Ok((id, false));
    }
    tokenizer.add_special_tokens(&[AddedToken::from(content.to_string(), true)]);
    let id = tokenizer.token_to_id(content).ok_or_else(|| UnifiedError::Configuration {
        operation: "register graph marker".to_string(),
        reason: ConfigErrorType::InvalidData(format!("tokenizer rejected {}", content)),
        context: None,
    })?;
    Ok((id, true))
}

/// Register graph marker tokens and prepare the embedding rows behind them
///
/// Records the marker ids in `markers`. Running it again on an already extended
/// tokenizer adds nothing and leaves the tables untouched.
pub fn register_markers(
    tokenizer: &mut Tokenizer,
    tables: &mut EmbeddingTables,
    markers: &mut GraphMarkerConfig,
    options: &RegistrationOptions,
) -> UnifiedResult<MarkerRegistration> {
    let (patch, patch_added) = ensure_token(tokenizer, DEFAULT_GRAPH_PATCH_TOKEN)?;
    markers.graph_patch_token = Some(patch);
    let mut num_new_tokens = patch_added as usize;
    tables.resize(tokenizer.get_vocab_size(true))?;

    if options.use_start_end {
        let (start, start_added) = ensure_token(tokenizer, DEFAULT_G_START_TOKEN)?;
        let (end, end_added) = ensure_token(tokenizer, DEFAULT_G_END_TOKEN)?;
        num_new_tokens += start_added as usize + end_added as usize;
        tables.resize(tokenizer.get_vocab_size(true))?;
        markers.graph_start_token = Some(start);
        markers.graph_end_token = Some(end);
    }
    markers.use_graph_start_end = options.use_start_end;

    tables.mean_init_new_rows(num_new_tokens)?;

    if options.tune_graph_mlp_adapter {
        tables.enable_adapter_tuning()?;
    }

    if let Some(adapter_path) = &options.pretrain_graph_mlp_adapter {
        if num_new_tokens == 0 {
            warn!(path = ?adapter_path, "no new marker rows, adapter embeddings ignored");
        } else {
            let mut weights = read_state_dict(adapter_path, tables.input().device())?;
            let embed = weights.remove(ADAPTER_EMBED_KEY).ok_or_else(|| UnifiedError::Configuration {
                operation: "load adapter marker embeddings".to_string(),
                reason: ConfigErrorType::MissingField(ADAPTER_EMBED_KEY.to_string()),
                context: Some(format!("{:?}", adapter_path)),
            })?;
            tables.load_new_rows(&embed, num_new_tokens)?;
        }
    }

    let registration = MarkerRegistration {
        num_new_tokens,
        vocab_size: tables.vocab_size(),
    };
    info!(
        new_tokens = registration.num_new_tokens,
        vocab_size = registration.vocab_size,
        start_end = options.use_start_end,
        "registered graph marker tokens"
    );
    Ok(registration)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;
    use std::str::FromStr;

    /// Word-level tokenizer with `num_words` plain words `w0..wN`
    pub(crate) fn word_tokenizer(num_words: usize) -> Tokenizer {
        let vocab: serde_json::Map<String, serde_json::Value> = (0..num_words)
            .map(|i| {
                let word = if i == 0 { "<unk>".to_string() } else { format!("w{}", i) };
                (word, serde_json::Value::from(i as u32))
            })
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    /// Row i = [i, 2i]
    fn table(rows: usize) -> Tensor {
        let data: Vec<f32> = (0..rows).flat_map(|i| [i as f32, 2.0 * i as f32]).collect();
        Tensor::from_vec(data, (rows, 2), &Device::Cpu).unwrap()
    }

    fn row(t: &Tensor, i: usize) -> Vec<f32> {
        t.get(i).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_patch_only_registration() {
        let mut tokenizer = word_tokenizer(4);
        let mut tables = EmbeddingTables::new(&table(4), Some(&table(4))).unwrap();
        let mut markers = GraphMarkerConfig::default();

        let reg = register_markers(
            &mut tokenizer,
            &mut tables,
            &mut markers,
            &RegistrationOptions::default(),
        )
        .unwrap();

        assert_eq!(reg, MarkerRegistration { num_new_tokens: 1, vocab_size: 5 });
        assert_eq!(markers.graph_patch_token, Some(4));
        assert!(!markers.use_graph_start_end);
        // mean of rows 0..4 = [1.5, 3.0]
        assert_eq!(row(tables.input(), 4), vec![1.5, 3.0]);
        assert_eq!(row(tables.output(), 4), vec![1.5, 3.0]);
        assert_eq!(row(tables.input(), 3), vec![3.0, 6.0]);
    }

    #[test]
    fn test_start_end_registration_mean_inits_every_new_row() {
        let mut tokenizer = word_tokenizer(3);
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        let mut markers = GraphMarkerConfig::default();
        let options = RegistrationOptions {
            use_start_end: true,
            ..Default::default()
        };

        let reg = register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();
        assert_eq!(reg.num_new_tokens, 3);
        assert_eq!(tables.vocab_size(), 6);
        assert_eq!(markers.start_end_tokens().unwrap(), (4, 5));
        assert!(markers.use_graph_start_end);
        for i in 3..6 {
            assert_eq!(row(tables.input(), i), vec![1.0, 2.0]);
        }
        assert!(tables.is_tied());
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut tokenizer = word_tokenizer(4);
        let mut tables = EmbeddingTables::new(&table(4), None).unwrap();
        let mut markers = GraphMarkerConfig::default();
        let options = RegistrationOptions {
            use_start_end: true,
            ..Default::default()
        };
        register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();
        let before = tables.input().to_vec2::<f32>().unwrap();

        let again = register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();
        assert_eq!(again.num_new_tokens, 0);
        assert_eq!(again.vocab_size, 7);
        assert_eq!(tables.input().to_vec2::<f32>().unwrap(), before);
    }

    #[test]
    fn test_adapter_tuning_freezes_output() {
        let mut tokenizer = word_tokenizer(4);
        let mut tables = EmbeddingTables::new(&table(4), Some(&table(4))).unwrap();
        let mut markers = GraphMarkerConfig::default();
        let options = RegistrationOptions {
            tune_graph_mlp_adapter: true,
            ..Default::default()
        };
        register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();

        assert!(tables.input_trainable());
        assert!(!tables.output_trainable());
        assert_eq!(tables.trainable_vars().len(), 1);
    }

    #[test]
    fn test_restore_original_rows_keeps_marker_rows() {
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        tables.resize(4).unwrap();
        tables.mean_init_new_rows(1).unwrap();
        tables.enable_adapter_tuning().unwrap();

        // simulate an optimizer step touching every row
        let stepped = (tables.input() + 10.0).unwrap();
        tables.input.set(&stepped).unwrap();
        tables.restore_original_rows().unwrap();

        assert_eq!(row(tables.input(), 0), vec![0.0, 0.0]);
        assert_eq!(row(tables.input(), 2), vec![2.0, 4.0]);
        assert_eq!(row(tables.input(), 3), vec![11.0, 12.0]);
    }

    #[test]
    fn test_restore_requires_snapshot() {
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        assert!(tables.restore_original_rows().is_err());
    }

    #[test]
    fn test_adapter_rows_from_full_table_or_new_rows() {
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        tables.resize(5).unwrap();

        let full = Tensor::full(7f32, (5, 2), &Device::Cpu).unwrap();
        tables.load_new_rows(&full, 2).unwrap();
        assert_eq!(row(tables.input(), 1), vec![1.0, 2.0]);
        assert_eq!(row(tables.input(), 4), vec![7.0, 7.0]);

        let rows = Tensor::full(9f32, (2, 2), &Device::Cpu).unwrap();
        tables.load_new_rows(&rows, 2).unwrap();
        assert_eq!(row(tables.input(), 3), vec![9.0, 9.0]);
    }

    #[test]
    fn test_two_row_adapter_seeds_start_and_end() {
        // PATCH, START, END were added; the adapter only carries START and END
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        tables.resize(6).unwrap();
        let rows = Tensor::full(4f32, (2, 2), &Device::Cpu).unwrap();
        tables.load_new_rows(&rows, 3).unwrap();
        assert_eq!(row(tables.input(), 2), vec![2.0, 4.0]);
        assert_eq!(row(tables.input(), 4), vec![4.0, 4.0]);
        assert_eq!(row(tables.input(), 5), vec![4.0, 4.0]);
        assert_eq!(tables.input().dims(), &[6, 2]);
    }

    #[test]
    fn test_adapter_shape_mismatch() {
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        tables.resize(5).unwrap();
        let bad = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        match tables.load_new_rows(&bad, 2).unwrap_err() {
            UnifiedError::AdapterShapeMismatch {
                pretrained,
                current,
                num_new_tokens,
            } => {
                assert_eq!(pretrained, vec![3, 2]);
                assert_eq!(current, vec![5, 2]);
                assert_eq!(num_new_tokens, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_adapter_checkpoint_seeds_marker_rows() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = dir.path().join("graph_projector.safetensors");
        let mut weights = HashMap::new();
        weights.insert(
            ADAPTER_EMBED_KEY.to_string(),
            Tensor::full(5f32, (3, 2), &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&weights, &adapter).unwrap();

        let mut tokenizer = word_tokenizer(3);
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        let mut markers = GraphMarkerConfig::default();
        let options = RegistrationOptions {
            use_start_end: true,
            pretrain_graph_mlp_adapter: Some(adapter),
            ..Default::default()
        };
        register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();

        assert_eq!(row(tables.input(), 2), vec![2.0, 4.0]);
        for i in 3..6 {
            assert_eq!(row(tables.input(), i), vec![5.0, 5.0]);
        }

        // a two-row start/end adapter is accepted against three new tokens
        let mut weights = HashMap::new();
        weights.insert(
            ADAPTER_EMBED_KEY.to_string(),
            Tensor::full(8f32, (2, 2), &Device::Cpu).unwrap(),
        );
        let two_rows = dir.path().join("start_end_adapter.safetensors");
        candle_core::safetensors::save(&weights, &two_rows).unwrap();
        let mut tokenizer = word_tokenizer(3);
        let mut tables = EmbeddingTables::new(&table(3), None).unwrap();
        let mut markers = GraphMarkerConfig::default();
        let options = RegistrationOptions {
            use_start_end: true,
            pretrain_graph_mlp_adapter: Some(two_rows),
            ..Default::default()
        };
        let registration = register_markers(&mut tokenizer, &mut tables, &mut markers, &options).unwrap();
        assert_eq!(registration.num_new_tokens, 3);
        assert_ne!(row(tables.input(), 3), vec![8.0, 8.0]);
        assert_eq!(row(tables.input(), 4), vec![8.0, 8.0]);
        assert_eq!(row(tables.input(), 5), vec![8.0, 8.0]);
    }

    #[test]
    fn test_mismatched_lm_head_rejected() {
        let err = EmbeddingTables::new(&table(3), Some(&table(4))).unwrap_err();
        assert!(matches!(err, UnifiedError::Validation { .. }));
    }

    #[test]
    fn test_resize_truncates() {
        let mut tables = EmbeddingTables::new(&table(5), Some(&table(5))).unwrap();
        tables.resize(3).unwrap();
        assert_eq!(tables.input().dims(), &[3, 2]);
        assert_eq!(tables.output().dims(), &[3, 2]);
    }
}
