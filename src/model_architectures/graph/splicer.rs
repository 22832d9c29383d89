//! Embedding splicer
//!
//! Replaces graph marker positions in a batch of token embeddings with projected
//! graph node features. Two layouts are supported:
//!
//! - patch-only: `... <g_patch> x n ...`, the run of n PATCH tokens is replaced by
//!   the n node features;
//! - start/end: `... <g_start> <g_patch> x n <g_end> ...`, the n positions between
//!   START and END are replaced, the markers themselves stay.
//!
//! Either way every output sequence keeps its input length. Feature sets come as one
//! flat list and are consumed strictly in sample order, left to right within a sample.

use crate::core::{ProcessingContext, UnifiedError, UnifiedResult};
use crate::model_architectures::graph::config::GraphMarkerConfig;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

/// Feature-cursor behaviour for samples without any PATCH marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextOnlyCursor {
    /// Consume one feature slot anyway (loader allocates one slot per sample)
    #[default]
    Advance,
    /// Leave the cursor where it is (loader allocates slots only for graph samples)
    Hold,
}

/// Role of one output position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionRole {
    Text,
    Marker,
    GraphFeature,
}

/// Per-position trainability of a spliced batch
///
/// With protection active only markers and graph features receive gradients; the
/// surrounding text embeddings are detached in the output tensor as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainabilityMask {
    roles: Vec<Vec<PositionRole>>,
    protect_original: bool,
}

impl TrainabilityMask {
    /// `None` when `sample` is outside the batch
    pub fn roles(&self, sample: usize) -> Option<&[PositionRole]> {
        self.roles.get(sample).map(Vec::as_slice)
    }

    /// `None` when `(sample, position)` is outside the batch
    pub fn is_trainable(&self, sample: usize, position: usize) -> Option<bool> {
        let role = self.roles.get(sample)?.get(position)?;
        Some(self.role_trainable(*role))
    }

    fn role_trainable(&self, role: PositionRole) -> bool {
        !self.protect_original || role != PositionRole::Text
    }

    /// `[B, L]` u8 mask, 1 where gradients flow
    pub fn to_tensor(&self, device: &Device) -> UnifiedResult<Tensor> {
        let flat: Vec<u8> = self
            .roles
            .iter()
            .flatten()
            .map(|&role| self.role_trainable(role) as u8)
            .collect();
        let seq_len = self.roles.first().map(|r| r.len()).unwrap_or(0);
        Tensor::from_vec(flat, (self.roles.len(), seq_len), device).processing("build trainability mask")
    }
}

/// Output of [`EmbeddingSplicer::splice`]
#[derive(Debug, Clone)]
pub struct SplicedBatch {
    /// `[B, L, D]`, same dtype and device as the input embeddings
    pub inputs_embeds: Tensor,
    pub trainable: TrainabilityMask,
    pub graphs_consumed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingSplicer<'a> {
    markers: &'a GraphMarkerConfig,
    protect_original: bool,
    text_only_cursor: TextOnlyCursor,
}

impl<'a> EmbeddingSplicer<'a> {
    pub fn new(markers: &'a GraphMarkerConfig) -> Self {
        Self {
            markers,
            protect_original: false,
            text_only_cursor: TextOnlyCursor::default(),
        }
    }

    /// Detach text embeddings outside spliced regions
    pub fn protect_original(mut self, protect: bool) -> Self {
        self.protect_original = protect;
        self
    }

    pub fn text_only_cursor(mut self, policy: TextOnlyCursor) -> Self {
        self.text_only_cursor = policy;
        self
    }

    /// Splice projected graph features into `inputs_embeds`
    ///
    /// - `input_ids`: `[B, L]` token ids
    /// - `inputs_embeds`: `[B, L, D]` token embeddings
    /// - `graph_features`: flat list of projected feature sets, each `[n, D]`
    /// - `dummy_features`: projected zero placeholder, folded into text-only samples
    pub fn splice(
        &self,
        input_ids: &Tensor,
        inputs_embeds: &Tensor,
        graph_features: &[Tensor],
        dummy_features: &Tensor,
    ) -> UnifiedResult<SplicedBatch> {
        let ids = input_ids
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .processing("read input ids")?;
        let (batch, seq_len, hidden) = inputs_embeds.dims3().processing("read embedding shape")?;
        if ids.len() != batch || ids.iter().any(|row| row.len() != seq_len) {
            return Err(UnifiedError::Validation {
                field: "input_ids".to_string(),
                expected: format!("[{}, {}]", batch, seq_len),
                actual: format!("{:?}", input_ids.dims()),
                context: Some("ids and embeddings must share batch and sequence dims".to_string()),
            });
        }

        let patch_token = self.markers.patch_token()?;
        let mut cursor = FeatureCursor::new(graph_features, hidden, inputs_embeds);
        let mut merged = Vec::with_capacity(batch);
        let mut roles = Vec::with_capacity(batch);

        for (sample, sample_ids) in ids.iter().enumerate() {
            let embeds = inputs_embeds.get(sample).processing("select sample embeddings")?;
            let num_patches = sample_ids.iter().filter(|&&t| t == patch_token).count();

            let (sample_embeds, sample_roles) = if num_patches == 0 {
                let out = self.text_only(&embeds, dummy_features)?;
                if self.text_only_cursor == TextOnlyCursor::Advance {
                    cursor.skip();
                }
                (out, vec![PositionRole::Text; seq_len])
            } else if self.markers.use_graph_start_end {
                self.splice_start_end(sample, sample_ids, &embeds, &mut cursor)?
            } else {
                self.splice_patches(sample, sample_ids, &embeds, patch_token, &mut cursor)?
            };

            let out_len = sample_embeds.dim(0).processing("read spliced length")?;
            if out_len != seq_len {
                return Err(UnifiedError::Validation {
                    field: format!("sample {} spliced length", sample),
                    expected: seq_len.to_string(),
                    actual: out_len.to_string(),
                    context: None,
                });
            }
            merged.push(sample_embeds);
            roles.push(sample_roles);
        }

        if cursor.consumed != graph_features.len() {
            return Err(UnifiedError::GraphFeatureCardinalityMismatch {
                consumed: cursor.consumed,
                supplied: graph_features.len(),
            });
        }

        let inputs_embeds = Tensor::stack(&merged, 0).processing("stack spliced embeddings")?;
        debug!(batch, seq_len, graphs = cursor.consumed, "spliced graph features");

        Ok(SplicedBatch {
            inputs_embeds,
            trainable: TrainabilityMask {
                roles,
                protect_original: self.protect_original,
            },
            graphs_consumed: cursor.consumed,
        })
    }

    /// Numerically a no-op; keeps the projector in the autograd graph for this sample
    ///
    /// The zero factor is a tensor operand: backprop prunes scalar multiplies by zero.
    fn text_only(&self, embeds: &Tensor, dummy_features: &Tensor) -> UnifiedResult<Tensor> {
        let zero = dummy_features
            .sum_all()
            .and_then(|sum| {
                let factor = Tensor::zeros((), sum.dtype(), sum.device())?;
                sum.mul(&factor)
            })
            .and_then(|t| t.to_dtype(embeds.dtype()))
            .and_then(|t| t.to_device(embeds.device()))
            .processing("fold dummy graph features")?;
        embeds.broadcast_add(&zero).processing("add dummy graph term")
    }

    fn splice_start_end(
        &self,
        sample: usize,
        ids: &[u32],
        embeds: &Tensor,
        cursor: &mut FeatureCursor,
    ) -> UnifiedResult<(Tensor, Vec<PositionRole>)> {
        let (start_token, end_token) = self.markers.start_end_tokens()?;
        let starts: Vec<usize> = positions_of(ids, start_token);
        if starts.is_empty() {
            // patches are present but no region encloses them
            return Err(UnifiedError::MarkerCountMismatch {
                sample,
                marker: "graph start",
                expected: 1,
                actual: 0,
            });
        }
        let num_ends = ids.iter().filter(|&&t| t == end_token).count();
        if starts.len() != num_ends {
            return Err(UnifiedError::MarkerCountMismatch {
                sample,
                marker: "graph end",
                expected: starts.len(),
                actual: num_ends,
            });
        }

        let mut builder = SequenceBuilder::new(embeds, ids.len(), self.protect_original);
        for start in starts {
            if start < builder.position {
                return Err(UnifiedError::MarkerSequenceInvalid {
                    sample,
                    position: start,
                    found: Some(start_token),
                });
            }
            let features = cursor.next()?;
            let num_nodes = features.dim(0).processing("read graph node count")?;
            let end = start + num_nodes + 1;
            if ids.get(end) != Some(&end_token) {
                return Err(UnifiedError::MarkerSequenceInvalid {
                    sample,
                    position: end,
                    found: ids.get(end).copied(),
                });
            }
            builder.text_until(start)?;
            builder.markers(start, 1)?;
            builder.features(features, num_nodes);
            builder.markers(end, 1)?;
        }
        builder.finish()
    }

    fn splice_patches(
        &self,
        sample: usize,
        ids: &[u32],
        embeds: &Tensor,
        patch_token: u32,
        cursor: &mut FeatureCursor,
    ) -> UnifiedResult<(Tensor, Vec<PositionRole>)> {
        let features = cursor.next()?;
        let num_nodes = features.dim(0).processing("read graph node count")?;
        let patches = positions_of(ids, patch_token);
        if patches.len() != num_nodes {
            return Err(UnifiedError::MarkerCountMismatch {
                sample,
                marker: "graph patch",
                expected: num_nodes,
                actual: patches.len(),
            });
        }
        let first = patches[0];
        if patches.iter().enumerate().any(|(i, &p)| p != first + i) {
            return Err(UnifiedError::MarkerNotContiguous {
                sample,
                positions: patches,
            });
        }

        let mut builder = SequenceBuilder::new(embeds, ids.len(), self.protect_original);
        builder.text_until(first)?;
        builder.features(features, num_nodes);
        builder.finish()
    }
}

fn positions_of(ids: &[u32], token: u32) -> Vec<usize> {
    ids.iter()
        .enumerate()
        .filter_map(|(i, &t)| (t == token).then_some(i))
        .collect()
}

/// Walks the flat feature list in order, casting each set to the embedding dtype/device
struct FeatureCursor<'f> {
    features: &'f [Tensor],
    consumed: usize,
    hidden: usize,
    dtype: DType,
    device: Device,
}

impl<'f> FeatureCursor<'f> {
    fn new(features: &'f [Tensor], hidden: usize, like: &Tensor) -> Self {
        Self {
            features,
            consumed: 0,
            hidden,
            dtype: like.dtype(),
            device: like.device().clone(),
        }
    }

    fn skip(&mut self) {
        self.consumed += 1;
    }

    fn next(&mut self) -> UnifiedResult<Tensor> {
        let features = self.features.get(self.consumed).ok_or(
            UnifiedError::GraphFeatureCardinalityMismatch {
                consumed: self.consumed + 1,
                supplied: self.features.len(),
            },
        )?;
        let (_, width) = features.dims2().processing("read graph feature shape")?;
        if width != self.hidden {
            return Err(UnifiedError::Validation {
                field: format!("graph feature set {} width", self.consumed),
                expected: self.hidden.to_string(),
                actual: width.to_string(),
                context: Some("features must be projected to the LLM hidden size".to_string()),
            });
        }
        self.consumed += 1;
        features
            .to_device(&self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .processing("move graph features to embedding device")
    }
}

/// Assembles one output sequence from text, marker and feature segments
struct SequenceBuilder<'e> {
    embeds: &'e Tensor,
    seq_len: usize,
    protect_original: bool,
    position: usize,
    pieces: Vec<Tensor>,
    roles: Vec<PositionRole>,
}

impl<'e> SequenceBuilder<'e> {
    fn new(embeds: &'e Tensor, seq_len: usize, protect_original: bool) -> Self {
        Self {
            embeds,
            seq_len,
            protect_original,
            position: 0,
            pieces: Vec::new(),
            roles: Vec::with_capacity(seq_len),
        }
    }

    fn text_until(&mut self, end: usize) -> UnifiedResult<()> {
        if end > self.position {
            let text = self
                .embeds
                .narrow(0, self.position, end - self.position)
                .processing("slice text embeddings")?;
            let text = if self.protect_original { text.detach() } else { text };
            self.pieces.push(text);
            self.roles.extend(std::iter::repeat(PositionRole::Text).take(end - self.position));
            self.position = end;
        }
        Ok(())
    }

    fn markers(&mut self, at: usize, len: usize) -> UnifiedResult<()> {
        let marker = self.embeds.narrow(0, at, len).processing("slice marker embeddings")?;
        self.pieces.push(marker);
        self.roles.extend(std::iter::repeat(PositionRole::Marker).take(len));
        self.position = at + len;
        Ok(())
    }

    fn features(&mut self, features: Tensor, num_nodes: usize) {
        self.pieces.push(features);
        self.roles.extend(std::iter::repeat(PositionRole::GraphFeature).take(num_nodes));
        self.position += num_nodes;
    }

    fn finish(mut self) -> UnifiedResult<(Tensor, Vec<PositionRole>)> {
        let seq_len = self.seq_len;
        self.text_until(seq_len)?;
        let merged = Tensor::cat(&self.pieces, 0).processing("concatenate spliced segments")?;
        Ok((merged, self.roles))
    }
}
