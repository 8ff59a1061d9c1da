use super::layer::AdapterVariant;
use super::*;
use crate::graph::{Fp4State, Int8State, KernelSize, ModuleGraph, ModuleNode};
use crate::precision::Precision;
use crate::quant::{Quantized4Bit, QuantizedInt8};
use crate::tensor::Tensor;
use approx::assert_relative_eq;

fn small_graph() -> ModuleGraph {
    let mut g = ModuleGraph::new();
    g.insert(
        "encoder.layer.0.q_proj",
        ModuleNode::linear(4, 4, Tensor::from_vec((0..16).map(|v| v as f32 * 0.1).collect(), true), None),
    );
    g.insert(
        "encoder.layer.0.v_proj",
        ModuleNode::linear(4, 4, Tensor::from_vec(vec![0.2; 16], true), Some(Tensor::from_vec(vec![0.1; 4], false))),
    );
    g.insert(
        "encoder.layer.0.norm",
        ModuleNode::layer_norm(4, Tensor::from_vec(vec![1.0; 4], false), None),
    );
    g.insert(
        "embed_tokens",
        ModuleNode::embedding(6, 4, Tensor::from_vec((0..24).map(|v| v as f32).collect(), true)),
    );
    g
}

fn seed_factors(graph: &mut ModuleGraph, path: &str, adapter: &str, a_val: f32, b_val: f32) {
    let slot = graph.get_mut(path).unwrap().adapter_mut(adapter).unwrap();
    let (a, b) = slot.variant.params_mut().unwrap();
    a.data_mut().fill(a_val);
    b.data_mut().fill(b_val);
}

#[test]
fn patch_attaches_and_reports() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0).target_qv_projections();
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();

    assert_eq!(output.report.len(), 2);
    assert_eq!(output.report["encoder.layer.0.q_proj"], "Linear");
    assert_eq!(output.report["encoder.layer.0.v_proj"], "Linear");
    assert!(graph.get("encoder.layer.0.q_proj").unwrap().has_adapter("default"));
    assert!(!graph.get("embed_tokens").unwrap().has_adapter("default"));
}

#[test]
fn patch_freezes_base_weight() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0).target_qv_projections();
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    assert!(!graph.get("encoder.layer.0.q_proj").unwrap().weight().unwrap().requires_grad());
    // Untargeted modules stay as they were
    assert!(graph.get("embed_tokens").unwrap().weight().unwrap().requires_grad());
}

#[test]
fn zero_rank_patch_leaves_weight_trainable() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(0, 8.0).target_qv_projections();
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    assert!(graph.get("encoder.layer.0.q_proj").unwrap().weight().unwrap().requires_grad());
}

#[test]
fn duplicate_adapter_name_is_fatal() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0).target_qv_projections();
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    let err = LoRA::prepare_model(&mut graph, &config, "default").unwrap_err();
    assert!(matches!(err, TunerError::DuplicateAdapter { .. }));
    // Only the first pass's slots exist
    assert_eq!(graph.get("encoder.layer.0.q_proj").unwrap().adapters().len(), 1);
}

#[test]
fn second_adapter_name_coexists() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0).target_qv_projections();
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    LoRA::prepare_model(&mut graph, &config, "second").unwrap();
    let node = graph.get("encoder.layer.0.q_proj").unwrap();
    assert!(node.has_adapter("default"));
    assert!(node.has_adapter("second"));
}

#[test]
fn failed_patch_is_atomic() {
    let mut graph = small_graph();
    graph.insert(
        "vision.conv",
        ModuleNode::conv2d(
            1,
            1,
            KernelSize::Rect(2, 3),
            1,
            0,
            Tensor::from_vec(vec![0.0; 6], false),
            None,
        ),
    );
    let config = LoRAConfig::new(4, 8.0).target_suffixes(["q_proj", "conv"]);
    let err = LoRA::prepare_model(&mut graph, &config, "default").unwrap_err();
    assert!(matches!(err, TunerError::NonScalarKernel { .. }));
    // The valid target was not patched either
    assert!(graph.get("encoder.layer.0.q_proj").unwrap().adapters().is_empty());
}

#[test]
fn unsupported_kind_skips_by_default() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0).target_suffixes(["norm", "q_proj"]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    assert_eq!(output.report.len(), 1);
    assert!(graph.get("encoder.layer.0.norm").unwrap().adapters().is_empty());
}

#[test]
fn unsupported_kind_errors_when_asked() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(4, 8.0)
        .target_suffixes(["norm"])
        .with_unsupported_policy(UnsupportedPolicy::Error);
    let err = LoRA::prepare_model(&mut graph, &config, "default").unwrap_err();
    assert!(matches!(err, TunerError::UnsupportedTarget { .. }));
}

#[test]
fn inactive_adapter_forward_equals_base() {
    let mut graph = small_graph();
    let x = Tensor::from_vec(vec![1.0, -1.0, 0.5, 2.0], false);
    let base = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();

    let config = LoRAConfig::new(4, 8.0).target_qv_projections();
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "encoder.layer.0.q_proj", "default", 0.5, 0.5);

    let y = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();
    assert_eq!(y.as_slice(), base.as_slice());

    LoRA::activate_adapter(&mut graph, "default", true);
    let y = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();
    assert_ne!(y.as_slice(), base.as_slice());

    LoRA::activate_adapter(&mut graph, "default", false);
    let y = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();
    assert_eq!(y.as_slice(), base.as_slice());
}

#[test]
fn merged_inactive_stays_folded() {
    let mut graph = small_graph();
    let x = Tensor::from_vec(vec![1.0; 4], false);
    let base = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();

    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]).with_merge_weights(true);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "encoder.layer.0.q_proj", "default", 0.5, 0.5);
    LoRA::activate_adapter(&mut graph, "default", true);

    graph.set_train(false);
    LoRA::activate_adapter(&mut graph, "default", false);
    // Deactivation does not unfold an already-merged weight
    let y = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();
    assert_ne!(y.as_slice(), base.as_slice());

    graph.set_train(true);
    let y = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();
    for (yv, bv) in y.as_slice().iter().zip(base.as_slice()) {
        assert_relative_eq!(yv, bv, epsilon = 1e-5);
    }
}

#[test]
fn patch_unpatch_preserves_adapter_forward() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "encoder.layer.0.q_proj", "default", 0.3, 0.4);
    LoRA::activate_adapter(&mut graph, "default", true);

    let x = Tensor::from_vec(vec![0.5, 1.5, -0.5, 1.0], false);
    let with_adapter = graph.get("encoder.layer.0.q_proj").unwrap().forward(&x).unwrap();

    let unpatched = LoRA::unpatch_lora(&mut graph, &config, "default").unwrap();
    assert_eq!(unpatched, vec!["encoder.layer.0.q_proj"]);

    let node = graph.get("encoder.layer.0.q_proj").unwrap();
    assert!(node.adapters().is_empty());
    let plain = node.forward(&x).unwrap();
    for (a, b) in with_adapter.as_slice().iter().zip(plain.as_slice()) {
        assert_relative_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn unpatch_embedding_preserves_lookup() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["embed_tokens"]);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "embed_tokens", "default", 0.2, 0.3);
    LoRA::activate_adapter(&mut graph, "default", true);

    let ids = [1usize, 4];
    let with_adapter = graph.get("embed_tokens").unwrap().forward_ids(&ids).unwrap();

    LoRA::unpatch_lora(&mut graph, &config, "default").unwrap();
    let plain = graph.get("embed_tokens").unwrap().forward_ids(&ids).unwrap();
    for (a, b) in with_adapter.as_slice().iter().zip(plain.as_slice()) {
        assert_relative_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn unpatch_conv_preserves_forward() {
    let mut graph = ModuleGraph::new();
    graph.insert(
        "vision.conv",
        ModuleNode::conv2d(
            1,
            2,
            KernelSize::Square(2),
            1,
            0,
            Tensor::from_vec((0..8).map(|v| v as f32 * 0.1).collect(), true),
            Some(Tensor::from_vec(vec![0.5, -0.5], false)),
        ),
    );
    let config = LoRAConfig::new(1, 2.0).target_suffixes(["conv"]);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "vision.conv", "default", 0.4, 0.2);
    LoRA::activate_adapter(&mut graph, "default", true);

    let x = Tensor::from_vec((0..9).map(|v| v as f32).collect(), false);
    let with_adapter = graph.get("vision.conv").unwrap().forward_image(&x, 3, 3).unwrap();

    LoRA::unpatch_lora(&mut graph, &config, "default").unwrap();
    let plain = graph.get("vision.conv").unwrap().forward_image(&x, 3, 3).unwrap();
    for (a, b) in with_adapter.as_slice().iter().zip(plain.as_slice()) {
        assert_relative_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn unpatch_leaves_quantized_adapter_attached() {
    let mut graph = ModuleGraph::new();
    let weights = QuantizedInt8::quantize(&[1.0, -1.0, 0.5, 2.0], 2, 2);
    graph.insert(
        "mlp.q8",
        ModuleNode::linear8bit(
            Int8State {
                weights,
                has_fp16_weights: false,
                memory_efficient_backward: false,
                threshold: 6.0,
                index: None,
            },
            None,
        ),
    );
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q8"]);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();

    let unpatched = LoRA::unpatch_lora(&mut graph, &config, "default").unwrap();
    assert!(unpatched.is_empty());
    assert!(graph.get("mlp.q8").unwrap().has_adapter("default"));
}

#[test]
fn quantized_targets_get_metadata_carried_over() {
    let mut graph = ModuleGraph::new();
    let weights = Quantized4Bit::quantize(&[0.5; 4]);
    graph.insert(
        "mlp.q4",
        ModuleNode::linear4bit(
            2,
            2,
            Fp4State {
                weights,
                compute_dtype: Precision::Bf16,
                compress_statistics: true,
                quant_type: "nf4".to_string(),
            },
            None,
        ),
    );
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q4"]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    assert_eq!(output.report["mlp.q4"], "Linear4bit");

    let slot = graph.get("mlp.q4").unwrap().adapter("default").unwrap();
    let AdapterVariant::Linear4bit(v) = &slot.variant else {
        panic!("expected 4-bit variant");
    };
    assert_eq!(v.compute_dtype, Precision::Bf16);
    assert!(v.compress_statistics);
    assert_eq!(v.quant_type, "nf4");
}

#[test]
fn merged_linear_variant_selected_by_config() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0)
        .target_suffixes(["q_proj"])
        .with_merged_linear(vec![true, false]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    assert_eq!(output.report["encoder.layer.0.q_proj"], "MergedLinear");
}

#[test]
fn state_dict_keys_carry_slot_marker() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();

    let full = graph.state_dict();
    assert!(full.contains_key("encoder.layer.0.q_proj.adapter_default.lora_A"));
    assert!(full.contains_key("encoder.layer.0.q_proj.adapter_default.lora_B"));

    let subset = output.state_dict(&full).unwrap();
    assert_eq!(subset.len(), 2);
    assert!(subset.keys().all(|k| k.contains("adapter_default")));
}

#[test]
fn state_dict_bias_policies_from_graph() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0)
        .target_qv_projections()
        .with_bias(BiasPolicy::LoraOnly);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();

    let full = graph.state_dict();
    let subset = output.state_dict(&full).unwrap();
    // q_proj has no bias; v_proj's sibling bias rides along
    assert!(subset.contains_key("encoder.layer.0.v_proj.bias"));
    assert!(!subset.contains_key("encoder.layer.0.v_proj.weight"));
    assert_eq!(subset.len(), 5);
}

#[test]
fn mark_trainable_follows_bias_policy() {
    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0)
        .target_qv_projections()
        .with_bias(BiasPolicy::LoraOnly);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();

    output.mark_trainable(&mut graph);
    assert!(graph.get("encoder.layer.0.v_proj").unwrap().bias().unwrap().requires_grad());
}

#[test]
fn checkpoint_round_trip_restores_factors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.json");

    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "encoder.layer.0.q_proj", "default", 0.25, 0.75);

    save_adapter(&graph, &output, &path).unwrap();

    // Fresh graph, fresh patch, then load the saved factors back in
    let mut graph2 = small_graph();
    LoRA::prepare_model(&mut graph2, &config, "default").unwrap();
    let checkpoint = load_adapter(&mut graph2, &path).unwrap();
    assert_eq!(checkpoint.rank(), 2);

    let slot = graph2.get("encoder.layer.0.q_proj").unwrap().adapter("default").unwrap();
    let (a, b) = slot.variant.params().unwrap();
    assert!(a.as_slice().iter().all(|&v| v == 0.25));
    assert!(b.as_slice().iter().all(|&v| v == 0.75));
}

#[test]
fn checkpoint_rejects_shape_drift() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.json");

    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]);
    let output = LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    save_adapter(&graph, &output, &path).unwrap();

    // Patch the same target at a different rank; sizes no longer line up
    let mut graph2 = small_graph();
    let config2 = LoRAConfig::new(4, 4.0).target_suffixes(["q_proj"]);
    LoRA::prepare_model(&mut graph2, &config2, "default").unwrap();
    let err = load_adapter(&mut graph2, &path).unwrap_err();
    assert!(matches!(err, CheckpointError::DimensionMismatch { .. }));
}

#[test]
fn merged_model_export_collects_folded_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merged.safetensors");

    let mut graph = small_graph();
    let config = LoRAConfig::new(2, 4.0).target_suffixes(["q_proj"]);
    LoRA::prepare_model(&mut graph, &config, "default").unwrap();
    seed_factors(&mut graph, "encoder.layer.0.q_proj", "default", 0.3, 0.3);
    LoRA::activate_adapter(&mut graph, "default", true);
    LoRA::unpatch_lora(&mut graph, &config, "default").unwrap();

    let merged = MergedModel::collect(&graph);
    assert!(merged.tensors.contains_key("encoder.layer.0.q_proj.weight"));
    assert_eq!(merged.shapes["encoder.layer.0.q_proj.weight"], vec![4, 4]);
    assert!(merged.param_count() > 0);

    merged.save_safetensors(&path).unwrap();
    let data = std::fs::read(&path).unwrap();
    let loaded = safetensors::SafeTensors::deserialize(&data).unwrap();
    assert!(loaded.names().iter().any(|n| *n == "encoder.layer.0.q_proj.weight"));
}
