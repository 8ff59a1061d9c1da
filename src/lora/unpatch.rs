//! Unpatch engine
//!
//! Reverses a patch pass for deployment: for each matched module the
//! adapter's delta is force-folded into the base weight, the slot is
//! removed, and the node is left as a plain layer whose forward output
//! matches the active adapter's.
//!
//! Quantized modules cannot absorb an f32 delta into their packed weight;
//! those slots are left attached with a warning so no contribution is lost.

use super::config::LoRAConfig;
use super::error::TunerError;
use super::locate::find_target_modules;
use super::patch::LoRA;
use crate::graph::ModuleGraph;

impl LoRA {
    /// Fold and strip the named adapter from every matched module.
    ///
    /// The selector is the same `target_modules` field used for patching.
    /// Returns the paths actually unpatched, in traversal order.
    pub fn unpatch_lora(
        graph: &mut ModuleGraph,
        config: &LoRAConfig,
        adapter_name: &str,
    ) -> Result<Vec<String>, TunerError> {
        let targets = find_target_modules(graph, &config.target_modules)?;
        let mut unpatched = Vec::new();

        for path in targets {
            let Some(node) = graph.get_mut(&path) else {
                continue;
            };
            let Some(slot) = node.adapter(adapter_name) else {
                continue;
            };
            if slot.variant.is_quantized() {
                tracing::warn!(
                    module = %path,
                    adapter = adapter_name,
                    kind = slot.variant.kind_name(),
                    "cannot fold delta into quantized weight, leaving adapter attached"
                );
                continue;
            }

            node.force_merge_adapter(adapter_name);
            node.remove_adapter(adapter_name);
            tracing::info!(module = %path, adapter = adapter_name, "unpatched adapter");
            unpatched.push(path);
        }
        Ok(unpatched)
    }
}
