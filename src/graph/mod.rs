//! Module graph: the tree of named sub-layers composing a model
//!
//! The graph is owned by the host; the tuner core only wraps nodes in place.
//! Iteration order is the insertion order, which callers build as depth-first
//! pre-order over the model tree, so target matching and patch reports are
//! deterministic.

mod node;


pub use node::{
    conv_out_size, BaseRefs, Fp4State, Int8State, KernelSize, ModuleNode, NodeKind, PackedState,
    QuantState,
};
pub(crate) use node::{base_conv2d_forward, base_embedding_forward, base_feature_forward, conv2d_raw};

use crate::tensor::Tensor;
use std::collections::{BTreeMap, HashMap};

/// Ordered collection of named module nodes
#[derive(Clone, Debug, Default)]
pub struct ModuleGraph {
    entries: Vec<(String, ModuleNode)>,
    index: HashMap<String, usize>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node under a fully-qualified dotted path.
    ///
    /// Panics on duplicate paths; the host framework guarantees unique module
    /// names and a duplicate here is a construction bug, not a runtime state.
    pub fn insert(&mut self, path: impl Into<String>, node: ModuleNode) {
        let path = path.into();
        assert!(
            !self.index.contains_key(&path),
            "duplicate module path '{path}'"
        );
        self.index.insert(path.clone(), self.entries.len());
        self.entries.push((path, node));
    }

    /// Fully-qualified paths in traversal (insertion) order
    pub fn module_keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&ModuleNode> {
        self.index.get(path).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ModuleNode> {
        let i = *self.index.get(path)?;
        Some(&mut self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleNode)> {
        self.entries.iter().map(|(k, n)| (k.as_str(), n))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ModuleNode)> {
        self.entries.iter_mut().map(|(k, n)| (k.as_str(), n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Toggle train/eval mode across the whole graph
    pub fn set_train(&mut self, mode: bool) {
        for (_, node) in self.entries.iter_mut() {
            node.set_train(mode);
        }
    }

    /// Flat parameter map: base weights, biases, and adapter parameters,
    /// keyed by dotted path
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        let mut out = BTreeMap::new();
        for (path, node) in &self.entries {
            node.collect_state(path, &mut out);
        }
        out
    }
}
