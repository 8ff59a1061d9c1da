//! Patch engine
//!
//! Wires adapters into a live module graph: resolves targets, constructs the
//! right variant for each target's runtime kind, attaches the slots, freezes
//! the base weights, and reports what was patched.
//!
//! Patching is two-phase so a batch is atomic: every variant is constructed
//! and validated before any slot is attached. A failure in phase one leaves
//! the graph exactly as it was.

use super::config::{LoRAConfig, UnsupportedPolicy};
use super::error::TunerError;
use super::layer::{
    AdapterSlot, AdapterVariant, LoRA4bitLinear, LoRA8bitLinear, LoRAConv2d, LoRAEmbedding,
    LoRALinear, LoRAPackedLinear, MergedLinear,
};
use super::locate::find_target_modules;
use super::state_dict::{lora_state_dict, mark_lora_as_trainable};
use crate::graph::{KernelSize, ModuleGraph, ModuleNode, NodeKind, QuantState};
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// LoRA tuner entry points
pub struct LoRA;

/// Result of a patch pass: the configuration it ran with, the adapter name,
/// and a deterministic record of which module got which variant
#[derive(Debug, Clone)]
pub struct TunerOutput {
    pub config: LoRAConfig,
    pub adapter_name: String,
    /// Module path to attached variant kind, in path order
    pub report: BTreeMap<String, String>,
}

impl TunerOutput {
    /// Filter a full parameter map down to this adapter's checkpoint subset
    pub fn state_dict(
        &self,
        full: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, Tensor>, TunerError> {
        Ok(lora_state_dict(full, &self.adapter_name, self.config.bias))
    }

    /// Apply the bias-trainable policy across the graph
    pub fn mark_trainable(&self, graph: &mut ModuleGraph) {
        mark_lora_as_trainable(graph, &self.adapter_name, self.config.bias);
    }
}

impl LoRA {
    /// Patch the graph and return the tuner callbacks
    pub fn prepare_model(
        graph: &mut ModuleGraph,
        config: &LoRAConfig,
        adapter_name: &str,
    ) -> Result<TunerOutput, TunerError> {
        let report = Self::dynamic_patch_lora(graph, config, adapter_name)?;
        Ok(TunerOutput {
            config: config.clone(),
            adapter_name: adapter_name.to_string(),
            report,
        })
    }

    /// Attach one adapter slot per matched module.
    ///
    /// Phase one constructs and validates every variant without touching the
    /// graph; phase two attaches the slots and freezes base weights. Errors
    /// from phase one therefore leave no module partially patched.
    pub fn dynamic_patch_lora(
        graph: &mut ModuleGraph,
        config: &LoRAConfig,
        adapter_name: &str,
    ) -> Result<BTreeMap<String, String>, TunerError> {
        config.validate()?;
        let targets = find_target_modules(graph, &config.target_modules)?;

        let mut staged: Vec<(String, AdapterVariant)> = Vec::with_capacity(targets.len());
        for path in targets {
            let node = graph
                .get(&path)
                .ok_or_else(|| TunerError::Validation(format!("module '{path}' vanished during patch")))?;
            if node.has_adapter(adapter_name) {
                return Err(TunerError::DuplicateAdapter {
                    path,
                    adapter: adapter_name.to_string(),
                });
            }
            match build_variant(&path, node, config)? {
                Some(variant) => staged.push((path, variant)),
                None => {
                    tracing::warn!(
                        module = %path,
                        kind = %node.kind(),
                        "target has no adapter variant, skipping"
                    );
                }
            }
        }

        let mut report = BTreeMap::new();
        for (path, variant) in staged {
            let node = graph
                .get_mut(&path)
                .ok_or_else(|| TunerError::Validation(format!("module '{path}' vanished during patch")))?;
            report.insert(path.clone(), variant.kind_name().to_string());
            node.attach_adapter(AdapterSlot::new(adapter_name, variant));
            if config.r > 0 {
                if let Some(weight) = node.weight_mut() {
                    weight.set_requires_grad(false);
                }
            }
            tracing::info!(module = %path, adapter = adapter_name, "attached adapter");
        }
        tracing::info!(
            adapter = adapter_name,
            patched = report.len(),
            "patch pass complete"
        );
        Ok(report)
    }

    /// Flip the named adapter's activation flag across the whole graph
    pub fn activate_adapter(graph: &mut ModuleGraph, adapter_name: &str, activate: bool) {
        for (_, node) in graph.iter_mut() {
            node.set_adapter_activation(adapter_name, activate);
        }
    }
}

/// Select and construct the adapter variant for a node's runtime kind.
/// `Ok(None)` means the kind has no variant and the skip policy applies.
fn build_variant(
    path: &str,
    node: &ModuleNode,
    config: &LoRAConfig,
) -> Result<Option<AdapterVariant>, TunerError> {
    let variant = match *node.kind() {
        NodeKind::Linear { in_features, out_features, fan_in_fan_out } => {
            if fan_in_fan_out != config.fan_in_fan_out {
                return Err(TunerError::Validation(format!(
                    "module '{path}' weight layout (fan_in_fan_out={fan_in_fan_out}) \
                     disagrees with config ({})",
                    config.fan_in_fan_out
                )));
            }
            if config.use_merged_linear {
                AdapterVariant::Merged(MergedLinear::new(
                    in_features,
                    out_features,
                    config.r,
                    config.lora_alpha,
                    config.lora_dropout,
                    config.enable_lora.clone(),
                    config.merge_weights,
                    fan_in_fan_out,
                )?)
            } else {
                AdapterVariant::Linear(LoRALinear::new(
                    in_features,
                    out_features,
                    config.r,
                    config.lora_alpha,
                    config.lora_dropout,
                    config.merge_weights,
                    fan_in_fan_out,
                ))
            }
        }
        NodeKind::Embedding { num_embeddings, embedding_dim } => {
            AdapterVariant::Embedding(LoRAEmbedding::new(
                num_embeddings,
                embedding_dim,
                config.r,
                config.lora_alpha,
                config.merge_weights,
            ))
        }
        NodeKind::Conv2d { in_channels, out_channels, kernel_size, stride, padding } => {
            let KernelSize::Square(k) = kernel_size else {
                return Err(TunerError::NonScalarKernel {
                    path: path.to_string(),
                    kernel: kernel_size.to_string(),
                });
            };
            AdapterVariant::Conv2d(LoRAConv2d::new(
                in_channels,
                out_channels,
                k,
                stride,
                padding,
                config.r,
                config.lora_alpha,
                config.lora_dropout,
                config.merge_weights,
            ))
        }
        NodeKind::Linear8bit { in_features, out_features } => {
            let Some(QuantState::Int8(state)) = node.quant() else {
                return Err(TunerError::Validation(format!(
                    "module '{path}' is 8-bit but carries no int8 state"
                )));
            };
            AdapterVariant::Linear8bit(LoRA8bitLinear::new(
                in_features,
                out_features,
                config.r,
                config.lora_alpha,
                config.lora_dropout,
                state.has_fp16_weights,
                state.memory_efficient_backward,
                state.threshold,
                state.index,
            ))
        }
        NodeKind::Linear4bit { in_features, out_features } => {
            let Some(QuantState::Fp4(state)) = node.quant() else {
                return Err(TunerError::Validation(format!(
                    "module '{path}' is 4-bit but carries no fp4 state"
                )));
            };
            AdapterVariant::Linear4bit(LoRA4bitLinear::new(
                in_features,
                out_features,
                config.r,
                config.lora_alpha,
                config.lora_dropout,
                state.compute_dtype,
                state.compress_statistics,
                state.quant_type.clone(),
            ))
        }
        NodeKind::PackedLinear { in_features, out_features } => {
            AdapterVariant::Packed(LoRAPackedLinear::new(
                in_features,
                out_features,
                config.r,
                config.lora_alpha,
                config.lora_dropout,
            ))
        }
        NodeKind::LayerNorm { .. } => {
            return match config.on_unsupported {
                UnsupportedPolicy::Skip => Ok(None),
                UnsupportedPolicy::Error => Err(TunerError::UnsupportedTarget {
                    path: path.to_string(),
                    kind: node.kind().name().to_string(),
                }),
            };
        }
    };
    Ok(Some(variant))
}
