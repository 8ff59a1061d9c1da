//! Adapter checkpoint I/O and merged-model export
//!
//! An adapter checkpoint is the filtered state dict plus enough metadata to
//! validate it against a graph on load. Checkpoints are JSON; full merged
//! models export as SafeTensors.

use super::patch::TunerOutput;
use crate::graph::ModuleGraph;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// Checkpoint save/load errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint validation error: {0}")]
    Validation(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),
}

/// Serializable adapter checkpoint
///
/// Holds the low-rank factors (and biases, per the filter's policy) for one
/// named adapter, keyed exactly as in the graph's state dict.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdapterCheckpoint {
    version: String,
    adapter_name: String,
    rank: usize,
    alpha: f32,
    tensors: BTreeMap<String, Vec<f32>>,
}

impl AdapterCheckpoint {
    const VERSION: &'static str = "1.0";

    /// Snapshot the adapter's parameters out of the graph
    pub fn from_graph(graph: &ModuleGraph, output: &TunerOutput) -> Self {
        let full = graph.state_dict();
        let subset = super::state_dict::lora_state_dict(
            &full,
            &output.adapter_name,
            output.config.bias,
        );
        Self {
            version: Self::VERSION.to_string(),
            adapter_name: output.adapter_name.clone(),
            rank: output.config.r,
            alpha: output.config.lora_alpha,
            tensors: subset
                .into_iter()
                .map(|(k, v)| (k, v.data().to_vec()))
                .collect(),
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn tensors(&self) -> &BTreeMap<String, Vec<f32>> {
        &self.tensors
    }

    /// Write the checkpoint's tensors back into a patched graph.
    ///
    /// Every checkpoint key must resolve to an attached adapter factor (or a
    /// module bias) of matching size.
    pub fn apply(&self, graph: &mut ModuleGraph) -> Result<(), CheckpointError> {
        for (key, values) in &self.tensors {
            let target = locate_param(graph, key, &self.adapter_name).ok_or_else(|| {
                CheckpointError::Validation(format!("checkpoint key '{key}' not found in graph"))
            })?;
            if target.len() != values.len() {
                return Err(CheckpointError::DimensionMismatch {
                    expected: target.len().to_string(),
                    actual: values.len().to_string(),
                });
            }
            *target.data_mut() = ndarray::arr1(values);
        }
        Ok(())
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Load and version-check a checkpoint
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let checkpoint: AdapterCheckpoint = serde_json::from_reader(reader)?;
        if checkpoint.version != Self::VERSION {
            return Err(CheckpointError::Validation(format!(
                "unsupported checkpoint version: {} (expected {})",
                checkpoint.version,
                Self::VERSION
            )));
        }
        Ok(checkpoint)
    }
}

/// Resolve a state-dict key to the mutable tensor it names
fn locate_param<'a>(
    graph: &'a mut ModuleGraph,
    key: &str,
    adapter_name: &str,
) -> Option<&'a mut Tensor> {
    let marker = format!(".adapter_{adapter_name}.");
    if let Some(pos) = key.find(&marker) {
        let path = &key[..pos];
        let factor = &key[pos + marker.len()..];
        let slot = graph.get_mut(path)?.adapter_mut(adapter_name)?;
        let (a, b) = slot.variant.params_mut()?;
        return match factor {
            "lora_A" => Some(a),
            "lora_B" => Some(b),
            _ => None,
        };
    }
    let path = key.strip_suffix(".bias")?;
    graph.get_mut(path)?.bias_mut()
}

/// Collected weights of an unpatched (merged) graph, ready for export
pub struct MergedModel {
    pub tensors: HashMap<String, Vec<f32>>,
    pub shapes: HashMap<String, Vec<usize>>,
    pub layers_merged: usize,
}

impl MergedModel {
    /// Collect every base weight and bias from the graph.
    ///
    /// Call after `unpatch_lora` so the adapter deltas are folded in.
    pub fn collect(graph: &ModuleGraph) -> Self {
        let mut tensors = HashMap::new();
        let mut shapes = HashMap::new();
        let mut layers_merged = 0;
        for (path, node) in graph.iter() {
            if let Some(weight) = node.weight() {
                tensors.insert(format!("{path}.weight"), weight.data().to_vec());
                shapes.insert(format!("{path}.weight"), weight_shape(node));
                layers_merged += 1;
            }
            if let Some(bias) = node.bias() {
                tensors.insert(format!("{path}.bias"), bias.data().to_vec());
                shapes.insert(format!("{path}.bias"), vec![bias.len()]);
            }
        }
        Self { tensors, shapes, layers_merged }
    }

    /// Total parameter count
    pub fn param_count(&self) -> u64 {
        self.tensors.values().map(|t| t.len() as u64).sum()
    }

    /// Save as SafeTensors
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        use safetensors::tensor::{Dtype, TensorView};

        let tensor_data: Vec<(String, Vec<u8>, Vec<usize>)> = self
            .tensors
            .iter()
            .map(|(name, data)| {
                let bytes: Vec<u8> = bytemuck::cast_slice(data).to_vec();
                let shape = self
                    .shapes
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| vec![data.len()]);
                (name.clone(), bytes, shape)
            })
            .collect();

        let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(tensor_data.len());
        for (name, bytes, shape) in &tensor_data {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map_err(|e| CheckpointError::SafeTensors(format!("invalid tensor '{name}': {e}")))?;
            views.push((name.as_str(), view));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "afinar-merged".to_string());

        let safetensor_bytes = safetensors::serialize(views, &Some(metadata))
            .map_err(|e| CheckpointError::SafeTensors(format!("serialization failed: {e}")))?;

        std::fs::write(path, safetensor_bytes)?;
        Ok(())
    }
}

fn weight_shape(node: &crate::graph::ModuleNode) -> Vec<usize> {
    use crate::graph::{KernelSize, NodeKind};
    match *node.kind() {
        NodeKind::Linear { in_features, out_features, fan_in_fan_out } => {
            if fan_in_fan_out {
                vec![in_features, out_features]
            } else {
                vec![out_features, in_features]
            }
        }
        NodeKind::Embedding { num_embeddings, embedding_dim } => vec![num_embeddings, embedding_dim],
        NodeKind::Conv2d { in_channels, out_channels, kernel_size, .. } => {
            let (kh, kw) = match kernel_size {
                KernelSize::Square(k) => (k, k),
                KernelSize::Rect(kh, kw) => (kh, kw),
            };
            vec![out_channels, in_channels, kh, kw]
        }
        NodeKind::LayerNorm { normalized_shape, .. } => vec![normalized_shape],
        _ => node.weight().map_or_else(Vec::new, |w| vec![w.len()]),
    }
}

/// Save a patched graph's adapter subset, convenience wrapper
pub fn save_adapter<P: AsRef<Path>>(
    graph: &ModuleGraph,
    output: &TunerOutput,
    path: P,
) -> Result<(), CheckpointError> {
    AdapterCheckpoint::from_graph(graph, output).save(path)
}

/// Load an adapter checkpoint into an already-patched graph
pub fn load_adapter<P: AsRef<Path>>(
    graph: &mut ModuleGraph,
    path: P,
) -> Result<AdapterCheckpoint, CheckpointError> {
    let checkpoint = AdapterCheckpoint::load(path)?;
    checkpoint.apply(graph)?;
    Ok(checkpoint)
}
