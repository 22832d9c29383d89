//! Graph tower: the (external) graph encoder and how it is constructed
//!
//! Encoder implementations live outside this crate. They are plugged in through a
//! [`GraphTowerRegistry`] keyed by [`GraphEncoderFamily`]; each [`GraphTowerKind`] tag
//! maps onto one family and, for the CLIP-pretrained kinds, onto the shared
//! [`transplant_gnn_weights`] helper.

use crate::core::{
    load_pretrained_graph_model, ConfigErrorType, ModelErrorType, PretrainedGraphConfig,
    ProcessingContext, UnifiedError, UnifiedResult,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// One graph: node features `[num_nodes, in_channels]` and edges `[2, num_edges]`
#[derive(Debug, Clone)]
pub struct GraphData {
    pub node_features: Tensor,
    pub edge_index: Tensor,
}

impl GraphData {
    pub fn new(node_features: Tensor, edge_index: Tensor) -> Self {
        Self {
            node_features,
            edge_index,
        }
    }

    pub fn num_nodes(&self) -> UnifiedResult<usize> {
        self.node_features.dim(0).processing("read graph node count")
    }
}

/// A graph-bearing sample: one graph, or a `graph_1` / `graph_2` pair
#[derive(Debug, Clone)]
pub enum GraphInput {
    Single(GraphData),
    Pair { graph_1: GraphData, graph_2: GraphData },
}

/// Graph data argument of a forward pass
#[derive(Debug, Clone)]
pub enum GraphBatch {
    /// One entry per graph-bearing sample, in sample order
    List(Vec<GraphInput>),
    /// Unbatched graph; rejected by the encoder with `InputTypeInvalid`
    Single(GraphInput),
}

impl GraphBatch {
    /// Generation-time convention: a single graph wrapped in a one-element list
    pub fn wrap(input: GraphInput) -> Self {
        GraphBatch::List(vec![input])
    }
}

/// Contract of an external graph encoder
pub trait GraphEncoder: Send + Sync {
    /// Per-node output features `[num_nodes, output_size]`
    fn forward(&self, graph: &GraphData) -> candle_core::Result<Tensor>;

    /// Width of the node features this encoder produces
    fn output_size(&self) -> usize;
}

/// Graph tower tag as written in `config.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphTowerKind {
    Mpnn,
    ClipGcnArxiv,
    ClipGt,
    ClipGtArxiv,
    ClipGtArxivPub,
}

/// Encoder architecture behind a tower kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphEncoderFamily {
    Mpnn,
    Gnn,
    GraphTransformer,
}

impl GraphTowerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphTowerKind::Mpnn => "MPNN",
            GraphTowerKind::ClipGcnArxiv => "clip_gcn_arxiv",
            GraphTowerKind::ClipGt => "clip_gt",
            GraphTowerKind::ClipGtArxiv => "clip_gt_arxiv",
            GraphTowerKind::ClipGtArxivPub => "clip_gt_arxiv_pub",
        }
    }

    pub fn family(&self) -> GraphEncoderFamily {
        match self {
            GraphTowerKind::Mpnn => GraphEncoderFamily::Mpnn,
            GraphTowerKind::ClipGcnArxiv => GraphEncoderFamily::Gnn,
            GraphTowerKind::ClipGt | GraphTowerKind::ClipGtArxiv | GraphTowerKind::ClipGtArxivPub => {
                GraphEncoderFamily::GraphTransformer
            }
        }
    }

    /// CLIP kinds transplant their encoder from a contrastive pretraining checkpoint
    pub fn requires_pretrained(&self) -> bool {
        !matches!(self, GraphTowerKind::Mpnn)
    }
}

impl FromStr for GraphTowerKind {
    type Err = UnifiedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MPNN" => Ok(GraphTowerKind::Mpnn),
            "clip_gcn_arxiv" => Ok(GraphTowerKind::ClipGcnArxiv),
            "clip_gt" => Ok(GraphTowerKind::ClipGt),
            "clip_gt_arxiv" => Ok(GraphTowerKind::ClipGtArxiv),
            "clip_gt_arxiv_pub" => Ok(GraphTowerKind::ClipGtArxivPub),
            other => Err(UnifiedError::Configuration {
                operation: "parse graph_tower".to_string(),
                reason: ConfigErrorType::InvalidData(format!("unknown graph tower '{}'", other)),
                context: None,
            }),
        }
    }
}

/// Hyper-parameters of a freshly initialized MPNN tower
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MpnnParams {
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub out_channels: usize,
    pub dropout: f64,
    pub num_layers: usize,
}

/// Everything an encoder constructor needs
#[derive(Debug, Clone)]
pub struct GraphTowerSpec {
    pub kind: GraphTowerKind,
    pub graph_hidden_size: usize,
    /// Attribute bag of the pretrained checkpoint (CLIP kinds only)
    pub pretrained_config: Option<PretrainedGraphConfig>,
}

impl GraphTowerSpec {
    pub fn mpnn_params(&self) -> MpnnParams {
        MpnnParams {
            in_channels: self.graph_hidden_size,
            hidden_channels: self.graph_hidden_size * 2,
            out_channels: self.graph_hidden_size,
            dropout: 0.1,
            num_layers: 2,
        }
    }
}

pub type GraphTowerConstructor =
    Box<dyn Fn(&GraphTowerSpec, VarBuilder) -> UnifiedResult<Box<dyn GraphEncoder>> + Send + Sync>;

/// Encoder constructors, populated by the application at startup
#[derive(Default)]
pub struct GraphTowerRegistry {
    constructors: HashMap<GraphEncoderFamily, GraphTowerConstructor>,
}

impl GraphTowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, family: GraphEncoderFamily, constructor: F) -> &mut Self
    where
        F: Fn(&GraphTowerSpec, VarBuilder) -> UnifiedResult<Box<dyn GraphEncoder>> + Send + Sync + 'static,
    {
        self.constructors.insert(family, Box::new(constructor));
        self
    }

    pub fn contains(&self, family: GraphEncoderFamily) -> bool {
        self.constructors.contains_key(&family)
    }

    /// Construct the tower for `kind`
    ///
    /// MPNN starts from freshly initialized weights; CLIP kinds load the pretrained
    /// checkpoint at `pretrain_path` and keep only its `gnn.*` parameters.
    pub fn build(
        &self,
        kind: GraphTowerKind,
        graph_hidden_size: usize,
        pretrain_path: Option<&Path>,
        dtype: DType,
        device: &Device,
    ) -> UnifiedResult<Box<dyn GraphEncoder>> {
        let constructor = self.constructors.get(&kind.family()).ok_or_else(|| {
            UnifiedError::Configuration {
                operation: "build graph tower".to_string(),
                reason: ConfigErrorType::InvalidData(format!(
                    "no constructor registered for {:?}",
                    kind.family()
                )),
                context: Some(kind.as_str().to_string()),
            }
        })?;

        if !kind.requires_pretrained() {
            let spec = GraphTowerSpec {
                kind,
                graph_hidden_size,
                pretrained_config: None,
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, dtype, device);
            info!(tower = kind.as_str(), "initializing graph tower");
            return constructor(&spec, vb);
        }

        let pretrain_path = pretrain_path.ok_or_else(|| UnifiedError::Configuration {
            operation: "build graph tower".to_string(),
            reason: ConfigErrorType::MissingField("pretrain_graph_model_path".to_string()),
            context: Some(kind.as_str().to_string()),
        })?;
        let checkpoint = load_pretrained_graph_model(pretrain_path, device)?;
        let tensors = transplant_gnn_weights(checkpoint.tensors)?;
        let spec = GraphTowerSpec {
            kind,
            graph_hidden_size,
            pretrained_config: Some(checkpoint.config),
        };
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        info!(tower = kind.as_str(), path = ?pretrain_path, "transplanted pretrained graph tower");
        constructor(&spec, vb)
    }
}

const GNN_PREFIX: &str = "gnn.";

/// Keep the `gnn.*` parameters of a CLIP checkpoint, re-rooted at the encoder
pub fn transplant_gnn_weights(
    clip_state: HashMap<String, Tensor>,
) -> UnifiedResult<HashMap<String, Tensor>> {
    let transplanted: HashMap<String, Tensor> = clip_state
        .into_iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(GNN_PREFIX)
                .map(|stripped| (stripped.to_string(), tensor))
        })
        .collect();

    if transplanted.is_empty() {
        return Err(UnifiedError::Model {
            model_type: ModelErrorType::GraphTower,
            operation: "transplant graph encoder weights".to_string(),
            reason: format!("no '{}' parameters in pretrained checkpoint", GNN_PREFIX),
            context: None,
        });
    }
    debug!(params = transplanted.len(), "transplanted gnn parameters");
    Ok(transplanted)
}

/// Single-valued ownership slot for the graph tower
///
/// `Sharded` marks a tower shared with a multi-device wrapper; it encodes the same way.
#[derive(Clone)]
pub enum GraphTowerSlot {
    Owned(Arc<dyn GraphEncoder>),
    Sharded(Arc<dyn GraphEncoder>),
}

impl GraphTowerSlot {
    pub fn new(encoder: Box<dyn GraphEncoder>, sharded: bool) -> Self {
        let encoder: Arc<dyn GraphEncoder> = Arc::from(encoder);
        if sharded {
            GraphTowerSlot::Sharded(encoder)
        } else {
            GraphTowerSlot::Owned(encoder)
        }
    }

    pub fn encoder(&self) -> &dyn GraphEncoder {
        match self {
            GraphTowerSlot::Owned(encoder) | GraphTowerSlot::Sharded(encoder) => encoder.as_ref(),
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, GraphTowerSlot::Sharded(_))
    }

    /// Encode one graph without tracking gradients into the tower
    pub fn encode_frozen(&self, graph: &GraphData) -> UnifiedResult<Tensor> {
        let features = self
            .encoder()
            .forward(graph)
            .model_err(ModelErrorType::GraphTower, "graph tower forward")?;
        Ok(features.detach())
    }

    /// Encode a batch into the flat feature-set list consumed by the splicer
    ///
    /// Pairs contribute two consecutive sets (`graph_1`, then `graph_2`).
    pub fn encode_batch(&self, batch: &GraphBatch) -> UnifiedResult<Vec<Tensor>> {
        let inputs = match batch {
            GraphBatch::List(inputs) => inputs,
            GraphBatch::Single(_) => {
                return Err(UnifiedError::InputTypeInvalid {
                    actual: "a single graph".to_string(),
                })
            }
        };

        let paired = matches!(inputs.first(), Some(GraphInput::Pair { .. }));
        let mut features = Vec::with_capacity(if paired { inputs.len() * 2 } else { inputs.len() });
        for input in inputs {
            match (input, paired) {
                (GraphInput::Single(graph), false) => features.push(self.encode_frozen(graph)?),
                (GraphInput::Pair { graph_1, graph_2 }, true) => {
                    features.push(self.encode_frozen(graph_1)?);
                    features.push(self.encode_frozen(graph_2)?);
                }
                _ => {
                    return Err(UnifiedError::InputTypeInvalid {
                        actual: "a list mixing single graphs and graph pairs".to_string(),
                    })
                }
            }
        }
        Ok(features)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::{Linear, Module};

    /// Node-wise linear map; enough to exercise the tower plumbing
    pub(crate) struct NodeLinearEncoder {
        pub(crate) proj: Linear,
        pub(crate) out: usize,
    }

    impl GraphEncoder for NodeLinearEncoder {
        fn forward(&self, graph: &GraphData) -> candle_core::Result<Tensor> {
            self.proj.forward(&graph.node_features)
        }

        fn output_size(&self) -> usize {
            self.out
        }
    }

    pub(crate) fn graph(num_nodes: usize, width: usize) -> GraphData {
        let x = Tensor::arange(0f32, (num_nodes * width) as f32, &Device::Cpu)
            .unwrap()
            .reshape((num_nodes, width))
            .unwrap();
        let edges = Tensor::new(&[[0u32], [0u32]], &Device::Cpu).unwrap();
        GraphData::new(x, edges)
    }

    pub(crate) fn registry() -> GraphTowerRegistry {
        let mut registry = GraphTowerRegistry::new();
        registry.register(GraphEncoderFamily::Mpnn, |spec, vb| {
            let p = spec.mpnn_params();
            let proj = candle_nn::linear(p.in_channels, p.out_channels, vb.pp("W_P"))
                .model_err(ModelErrorType::GraphTower, "create MPNN")?;
            Ok(Box::new(NodeLinearEncoder { proj, out: p.out_channels }) as Box<dyn GraphEncoder>)
        });
        registry.register(GraphEncoderFamily::GraphTransformer, |spec, vb| {
            let config = spec.pretrained_config.as_ref().expect("pretrained config");
            let (inp, out) = (config.get_usize("gnn_input")?, config.get_usize("gnn_output")?);
            let proj = candle_nn::linear(inp, out, vb.pp("W_P"))
                .model_err(ModelErrorType::GraphTower, "create graph transformer")?;
            Ok(Box::new(NodeLinearEncoder { proj, out }) as Box<dyn GraphEncoder>)
        });
        registry
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in ["MPNN", "clip_gcn_arxiv", "clip_gt", "clip_gt_arxiv", "clip_gt_arxiv_pub"] {
            let kind: GraphTowerKind = tag.parse().unwrap();
            assert_eq!(kind.as_str(), tag);
        }
        assert!("gat".parse::<GraphTowerKind>().is_err());
        assert_eq!(GraphTowerKind::ClipGtArxivPub.family(), GraphEncoderFamily::GraphTransformer);
        assert_eq!(GraphTowerKind::ClipGcnArxiv.family(), GraphEncoderFamily::Gnn);
    }

    #[test]
    fn test_transplant_keeps_only_gnn_params() {
        let mut state = HashMap::new();
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        state.insert("gnn.W_P.weight".to_string(), t.clone());
        state.insert("transformer.ln_final.weight".to_string(), t.clone());
        let transplanted = transplant_gnn_weights(state).unwrap();
        assert_eq!(transplanted.len(), 1);
        assert!(transplanted.contains_key("W_P.weight"));

        let mut no_gnn = HashMap::new();
        no_gnn.insert("text.weight".to_string(), t);
        assert!(transplant_gnn_weights(no_gnn).is_err());
    }

    #[test]
    fn test_build_mpnn_from_fresh_weights() {
        let tower = registry()
            .build(GraphTowerKind::Mpnn, 8, None, DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(tower.output_size(), 8);
    }

    #[test]
    fn test_build_clip_kind_requires_path() {
        let err = registry()
            .build(GraphTowerKind::ClipGt, 8, None, DType::F32, &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            UnifiedError::Configuration {
                reason: ConfigErrorType::MissingField(_),
                ..
            }
        ));
    }

    #[test]
    fn test_build_clip_kind_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"gnn_input": 4, "gnn_output": 6}"#).unwrap();
        let mut state = HashMap::new();
        state.insert(
            "gnn.W_P.weight".to_string(),
            Tensor::ones((6, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        state.insert(
            "gnn.W_P.bias".to_string(),
            Tensor::zeros(6, DType::F32, &Device::Cpu).unwrap(),
        );
        state.insert("logit_scale".to_string(), Tensor::new(&[1f32], &Device::Cpu).unwrap());
        candle_core::safetensors::save(&state, dir.path().join("clip.safetensors")).unwrap();

        let tower = registry()
            .build(GraphTowerKind::ClipGtArxiv, 4, Some(dir.path()), DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(tower.output_size(), 6);
        let out = tower.forward(&graph(3, 4)).unwrap();
        assert_eq!(out.dims(), &[3, 6]);
    }

    #[test]
    fn test_missing_family_constructor() {
        let registry = GraphTowerRegistry::new();
        assert!(!registry.contains(GraphEncoderFamily::Gnn));
        assert!(registry
            .build(GraphTowerKind::Mpnn, 4, None, DType::F32, &Device::Cpu)
            .is_err());
    }

    #[test]
    fn test_encode_batch_flattens_pairs_and_rejects_single() {
        let tower = registry()
            .build(GraphTowerKind::Mpnn, 4, None, DType::F32, &Device::Cpu)
            .unwrap();
        let slot = GraphTowerSlot::new(tower, false);

        let pairs = GraphBatch::List(vec![
            GraphInput::Pair { graph_1: graph(2, 4), graph_2: graph(3, 4) },
            GraphInput::Pair { graph_1: graph(1, 4), graph_2: graph(5, 4) },
        ]);
        let sets = slot.encode_batch(&pairs).unwrap();
        let sizes: Vec<usize> = sets.iter().map(|t| t.dim(0).unwrap()).collect();
        assert_eq!(sizes, vec![2, 3, 1, 5]);

        let single = GraphBatch::Single(GraphInput::Single(graph(2, 4)));
        assert!(matches!(
            slot.encode_batch(&single),
            Err(UnifiedError::InputTypeInvalid { .. })
        ));

        let mixed = GraphBatch::List(vec![
            GraphInput::Single(graph(2, 4)),
            GraphInput::Pair { graph_1: graph(1, 4), graph_2: graph(1, 4) },
        ]);
        assert!(matches!(
            slot.encode_batch(&mixed),
            Err(UnifiedError::InputTypeInvalid { .. })
        ));
    }

    #[test]
    fn test_wrap_produces_one_element_list() {
        match GraphBatch::wrap(GraphInput::Single(graph(2, 4))) {
            GraphBatch::List(inputs) => assert_eq!(inputs.len(), 1),
            GraphBatch::Single(_) => panic!("expected list form"),
        }
    }
}
