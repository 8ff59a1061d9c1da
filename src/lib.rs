//! afinar — parameter-efficient fine-tuning core
//!
//! Patches low-rank adapters (LoRA) into a live module graph, manages their
//! activation and merge state across train/eval transitions, and filters
//! state dicts for adapter checkpointing. Supports dense, embedding, conv2d,
//! and quantized (8-bit, 4-bit, group-packed) base layers.
//!
//! # Example
//!
//! ```
//! use afinar::graph::{ModuleGraph, ModuleNode};
//! use afinar::lora::{LoRA, LoRAConfig};
//! use afinar::Tensor;
//!
//! let mut graph = ModuleGraph::new();
//! graph.insert(
//!     "encoder.layer.0.q_proj",
//!     ModuleNode::linear(4, 4, Tensor::from_vec(vec![0.1; 16], true), None),
//! );
//!
//! let config = LoRAConfig::new(2, 4.0).target_qv_projections();
//! let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
//! assert_eq!(output.report.len(), 1);
//!
//! LoRA::activate_adapter(&mut graph, "default", true);
//! ```

pub mod graph;
pub mod lora;
pub mod precision;
pub mod quant;
mod tensor;

pub use precision::Precision;
pub use tensor::{matmul, Tensor};
