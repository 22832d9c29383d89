//! Graph projector: node features (graph_hidden_size) -> LLM hidden states (hidden_size)

use crate::core::{
    ConfigErrorType, ModelErrorType, ProcessingContext, UnifiedError, UnifiedResult,
};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Rows of the zero placeholder routed through the projector for text-only samples
pub const DUMMY_PATCH_COUNT: usize = 256;

/// Weight and bias are held as [`Var`]s so loaded projectors stay trainable
pub struct GraphProjector {
    weight: Var,
    bias: Var,
    linear: Linear,
    graph_hidden_size: usize,
    hidden_size: usize,
}

impl GraphProjector {
    /// Create (or load) the projector under `vb`, expecting `weight` and `bias`
    pub fn new(graph_hidden_size: usize, hidden_size: usize, vb: VarBuilder) -> UnifiedResult<Self> {
        let linear = candle_nn::linear(graph_hidden_size, hidden_size, vb)
            .model_err(ModelErrorType::Projector, "create graph_projector")?;
        let bias = linear.bias().ok_or_else(|| UnifiedError::Model {
            model_type: ModelErrorType::Projector,
            operation: "create graph_projector".to_string(),
            reason: "linear layer has no bias".to_string(),
            context: None,
        })?;
        Self::from_vars(linear.weight(), bias, graph_hidden_size, hidden_size)
    }

    /// Varmap-backed tensors are shared, anything else is copied into a fresh variable
    fn from_vars(
        weight: &Tensor,
        bias: &Tensor,
        graph_hidden_size: usize,
        hidden_size: usize,
    ) -> UnifiedResult<Self> {
        let weight = Var::from_tensor(weight).model_err(ModelErrorType::Projector, "wrap projector weight")?;
        let bias = Var::from_tensor(bias).model_err(ModelErrorType::Projector, "wrap projector bias")?;
        let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Ok(Self {
            weight,
            bias,
            linear,
            graph_hidden_size,
            hidden_size,
        })
    }

    /// Build from explicit tensors, validating `weight: [hidden, graph_hidden]`, `bias: [hidden]`
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> UnifiedResult<Self> {
        let (hidden_size, graph_hidden_size) = weight.dims2().map_err(|e| UnifiedError::Validation {
            field: "graph_projector.weight".to_string(),
            expected: "rank-2 tensor".to_string(),
            actual: e.to_string(),
            context: None,
        })?;
        if bias.dims() != [hidden_size] {
            return Err(UnifiedError::Validation {
                field: "graph_projector.bias".to_string(),
                expected: format!("[{}]", hidden_size),
                actual: format!("{:?}", bias.dims()),
                context: None,
            });
        }
        Self::from_vars(&weight, &bias, graph_hidden_size, hidden_size)
    }

    pub fn graph_hidden_size(&self) -> usize {
        self.graph_hidden_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// Project `[.., graph_hidden_size]` node features to `[.., hidden_size]`
    pub fn project(&self, features: &Tensor) -> UnifiedResult<Tensor> {
        let width = features.dims().last().copied().unwrap_or(0);
        if width != self.graph_hidden_size {
            return Err(UnifiedError::Validation {
                field: "graph node feature width".to_string(),
                expected: self.graph_hidden_size.to_string(),
                actual: width.to_string(),
                context: None,
            });
        }
        let features = features
            .to_dtype(self.weight.dtype())
            .processing("cast node features to projector dtype")?;
        self.linear.forward(&features).processing("project graph features")
    }

    pub fn project_all(&self, feature_sets: &[Tensor]) -> UnifiedResult<Vec<Tensor>> {
        feature_sets.iter().map(|f| self.project(f)).collect()
    }

    /// Projected zero placeholder `[DUMMY_PATCH_COUNT, hidden_size]`
    pub fn dummy_features(&self, dtype: DType, device: &Device) -> UnifiedResult<Tensor> {
        let zeros = Tensor::zeros((DUMMY_PATCH_COUNT, self.graph_hidden_size), dtype, device)
            .processing("create dummy graph features")?;
        self.project(&zeros)
    }

    /// Load projector weights from an adapter checkpoint (`.safetensors` or torch pickle)
    ///
    /// Keys are dotted parameter paths; only the final segment (`weight` / `bias`) is used.
    /// Values are written into the existing variables.
    pub fn load_adapter(&mut self, adapter_path: &Path) -> UnifiedResult<()> {
        let device = self.weight.device().clone();
        let state = crate::core::pretrained::read_state_dict(adapter_path, &device)?;
        let (weight, bias) = select_projector_weights(&state)?;

        let expected = [self.hidden_size, self.graph_hidden_size];
        if weight.dims() != expected {
            return Err(UnifiedError::Validation {
                field: "graph_projector.weight".to_string(),
                expected: format!("{:?}", expected),
                actual: format!("{:?}", weight.dims()),
                context: Some(format!("{:?}", adapter_path)),
            });
        }
        if bias.dims() != [self.hidden_size] {
            return Err(UnifiedError::Validation {
                field: "graph_projector.bias".to_string(),
                expected: format!("[{}]", self.hidden_size),
                actual: format!("{:?}", bias.dims()),
                context: Some(format!("{:?}", adapter_path)),
            });
        }
        let dtype = self.weight.dtype();
        let weight = weight
            .to_dtype(dtype)
            .and_then(|t| t.contiguous())
            .processing("cast adapter weight")?;
        let bias = bias
            .to_dtype(dtype)
            .and_then(|t| t.contiguous())
            .processing("cast adapter bias")?;
        self.weight.set(&weight).model_err(ModelErrorType::Projector, "write adapter weight")?;
        self.bias.set(&bias).model_err(ModelErrorType::Projector, "write adapter bias")?;
        info!(path = ?adapter_path, "loaded pretrained graph projector");
        Ok(())
    }
}

/// Pick `weight` and `bias` by the last path segment, preferring `graph_projector` keys
fn select_projector_weights(state: &HashMap<String, Tensor>) -> UnifiedResult<(Tensor, Tensor)> {
    let scoped = state.keys().any(|k| k.contains("graph_projector"));
    let mut weight = None;
    let mut bias = None;
    for (name, tensor) in state {
        if scoped && !name.contains("graph_projector") {
            continue;
        }
        match name.rsplit('.').next() {
            Some("weight") => weight = Some(tensor.clone()),
            Some("bias") => bias = Some(tensor.clone()),
            _ => {}
        }
    }
    match (weight, bias) {
        (Some(w), Some(b)) => Ok((w, b)),
        (w, _) => Err(UnifiedError::Configuration {
            operation: "load graph projector adapter".to_string(),
            reason: ConfigErrorType::MissingField(
                if w.is_none() { "weight" } else { "bias" }.to_string(),
            ),
            context: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn projector() -> GraphProjector {
        // weight = [[1, 0], [0, 1], [1, 1]], bias = [0.5, 0, -1]
        let weight = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, 0., -1.], &Device::Cpu).unwrap();
        GraphProjector::from_tensors(weight, bias).unwrap()
    }

    #[test]
    fn test_project_is_affine() {
        let proj = projector();
        let nodes = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap();
        let out = proj.project(&nodes).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![1.5, 2., 2.], vec![3.5, 4., 6.]]);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let proj = projector();
        let nodes = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(proj.project(&nodes), Err(UnifiedError::Validation { .. })));
    }

    #[test]
    fn test_bias_shape_checked_at_construction() {
        let weight = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(GraphProjector::from_tensors(weight, bias).is_err());
    }

    #[test]
    fn test_dummy_features_equal_bias_rows() {
        let proj = projector();
        let dummy = proj.dummy_features(DType::F32, &Device::Cpu).unwrap();
        assert_eq!(dummy.dims(), &[DUMMY_PATCH_COUNT, 3]);
        let rows = dummy.to_vec2::<f32>().unwrap();
        assert!(rows.iter().all(|r| r == &vec![0.5, 0., -1.]));
    }

    #[test]
    fn test_varbuilder_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = GraphProjector::new(8, 16, vb.pp("graph_projector")).unwrap();
        assert_eq!(proj.weight().dims(), &[16, 8]);
        assert_eq!(varmap.all_vars().len(), 2);

        // the projector's variables are the varmap's, not copies
        let shared = varmap.all_vars();
        assert!(proj
            .vars()
            .iter()
            .all(|v| shared.iter().any(|s| s.as_tensor().id() == v.as_tensor().id())));
    }

    #[test]
    fn test_load_adapter_by_last_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph_projector.safetensors");
        let mut state = HashMap::new();
        state.insert(
            "model.graph_projector.weight".to_string(),
            Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        state.insert(
            "model.graph_projector.bias".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&state, &path).unwrap();

        let mut proj = projector();
        let before: Vec<_> = proj.vars().iter().map(|v| v.as_tensor().id()).collect();
        proj.load_adapter(&path).unwrap();
        let out = proj
            .project(&Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(out, vec![vec![3., 3., 3.]]);

        let after: Vec<_> = proj.vars().iter().map(|v| v.as_tensor().id()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_loaded_projector_receives_gradients() {
        let proj = projector();
        let nodes = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        let loss = proj.project(&nodes).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in proj.vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
}
