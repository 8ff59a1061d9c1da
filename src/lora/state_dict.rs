//! State-dict filter and trainable-parameter marking
//!
//! Adapter checkpoints keep only the low-rank factors, optionally widened by
//! the bias policy. Keys follow the graph convention
//! `{module_path}.adapter_{name}.lora_A` / `.lora_B`.

use super::config::BiasPolicy;
use crate::graph::ModuleGraph;
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// Filter a full parameter map down to the adapter subset for checkpointing
pub fn lora_state_dict(
    full: &BTreeMap<String, Tensor>,
    adapter_name: &str,
    policy: BiasPolicy,
) -> BTreeMap<String, Tensor> {
    let marker = format!("adapter_{adapter_name}");
    let is_adapter_param =
        |key: &str| key.contains(marker.as_str()) && key.contains("lora_");

    match policy {
        BiasPolicy::None => full
            .iter()
            .filter(|(k, _)| is_adapter_param(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        BiasPolicy::All => full
            .iter()
            .filter(|(k, _)| is_adapter_param(k) || k.contains("bias"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        BiasPolicy::LoraOnly => {
            let mut out = BTreeMap::new();
            for (key, value) in full {
                if !is_adapter_param(key) {
                    continue;
                }
                out.insert(key.clone(), value.clone());
                // Sibling bias of the wrapped module
                if let Some(base) = key.split(".adapter_").next() {
                    let bias_key = format!("{base}.bias");
                    if let Some(bias) = full.get(&bias_key) {
                        out.insert(bias_key, bias.clone());
                    }
                }
            }
            out
        }
    }
}

/// Unfreeze bias parameters across the graph per the bias policy.
///
/// Adapter factors are created trainable; this only widens what else trains.
pub fn mark_lora_as_trainable(graph: &mut ModuleGraph, adapter_name: &str, policy: BiasPolicy) {
    match policy {
        BiasPolicy::None => {}
        BiasPolicy::All => {
            for (_, node) in graph.iter_mut() {
                if let Some(bias) = node.bias_mut() {
                    bias.set_requires_grad(true);
                }
            }
        }
        BiasPolicy::LoraOnly => {
            for (_, node) in graph.iter_mut() {
                if node.has_adapter(adapter_name) {
                    if let Some(bias) = node.bias_mut() {
                        bias.set_requires_grad(true);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(v: f32) -> Tensor {
        Tensor::from_vec(vec![v], false)
    }

    fn param_map() -> BTreeMap<String, Tensor> {
        let mut full = BTreeMap::new();
        full.insert("layer.adapter_default.lora_A".to_string(), t(1.0));
        full.insert("layer.adapter_default.lora_B".to_string(), t(2.0));
        full.insert("layer.bias".to_string(), t(3.0));
        full.insert("layer.weight".to_string(), t(4.0));
        full.insert("other.bias".to_string(), t(5.0));
        full
    }

    #[test]
    fn policy_none_keeps_factors_only() {
        let full = param_map();
        let subset = lora_state_dict(&full, "default", BiasPolicy::None);
        assert_eq!(
            subset.keys().collect::<Vec<_>>(),
            vec!["layer.adapter_default.lora_A", "layer.adapter_default.lora_B"]
        );
    }

    #[test]
    fn policy_all_adds_every_bias() {
        let full = param_map();
        let subset = lora_state_dict(&full, "default", BiasPolicy::All);
        assert_eq!(
            subset.keys().collect::<Vec<_>>(),
            vec![
                "layer.adapter_default.lora_A",
                "layer.adapter_default.lora_B",
                "layer.bias",
                "other.bias"
            ]
        );
    }

    #[test]
    fn policy_lora_only_adds_sibling_bias() {
        let full = param_map();
        let subset = lora_state_dict(&full, "default", BiasPolicy::LoraOnly);
        assert_eq!(
            subset.keys().collect::<Vec<_>>(),
            vec![
                "layer.adapter_default.lora_A",
                "layer.adapter_default.lora_B",
                "layer.bias"
            ]
        );
    }

    #[test]
    fn other_adapter_names_are_excluded() {
        let mut full = param_map();
        full.insert("layer.adapter_second.lora_A".to_string(), t(6.0));
        let subset = lora_state_dict(&full, "second", BiasPolicy::None);
        assert_eq!(subset.keys().collect::<Vec<_>>(), vec!["layer.adapter_second.lora_A"]);
    }
}
