//! Module graph nodes
//!
//! A node models one layer of the host network: its runtime kind, weight and
//! bias tensors, optional quantization state, and the ordered list of adapter
//! slots attached by the patch engine. The node owns its tensors; adapters
//! borrow them at call time, so merge/unmerge mutates the one true weight.

use crate::lora::layer::AdapterSlot;
use crate::lora::TunerError;
use crate::precision::Precision;
use crate::quant::{PackedInt4, Quantized4Bit, QuantizedInt8};
use crate::tensor::{matmul_raw, transpose, Tensor};
use std::collections::BTreeMap;
use std::fmt;

/// Conv2d kernel size: the adapter variant only supports square kernels,
/// so the per-axis form exists to be rejected explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelSize {
    Square(usize),
    Rect(usize, usize),
}

impl fmt::Display for KernelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSize::Square(k) => write!(f, "{k}"),
            KernelSize::Rect(kh, kw) => write!(f, "({kh}, {kw})"),
        }
    }
}

/// Runtime kind of a module graph node
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Linear {
        in_features: usize,
        out_features: usize,
        /// Weight stored as [in, out] instead of [out, in]
        fan_in_fan_out: bool,
    },
    Embedding {
        num_embeddings: usize,
        embedding_dim: usize,
    },
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: KernelSize,
        stride: usize,
        padding: usize,
    },
    Linear8bit {
        in_features: usize,
        out_features: usize,
    },
    Linear4bit {
        in_features: usize,
        out_features: usize,
    },
    PackedLinear {
        in_features: usize,
        out_features: usize,
    },
    LayerNorm {
        normalized_shape: usize,
        eps: f32,
    },
}

impl NodeKind {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Linear { .. } => "Linear",
            NodeKind::Embedding { .. } => "Embedding",
            NodeKind::Conv2d { .. } => "Conv2d",
            NodeKind::Linear8bit { .. } => "Linear8bit",
            NodeKind::Linear4bit { .. } => "Linear4bit",
            NodeKind::PackedLinear { .. } => "PackedLinear",
            NodeKind::LayerNorm { .. } => "LayerNorm",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quantization state of an 8-bit dense node (bitsandbytes-style metadata)
#[derive(Clone, Debug)]
pub struct Int8State {
    pub weights: QuantizedInt8,
    pub has_fp16_weights: bool,
    pub memory_efficient_backward: bool,
    pub threshold: f32,
    pub index: Option<usize>,
}

/// Quantization state of a 4-bit dense node
#[derive(Clone, Debug)]
pub struct Fp4State {
    pub weights: Quantized4Bit,
    pub compute_dtype: Precision,
    pub compress_statistics: bool,
    pub quant_type: String,
}

/// Quantization state of a group-wise packed dense node
#[derive(Clone, Debug)]
pub struct PackedState {
    pub weights: PackedInt4,
}

/// Quantization state attached to a node, by backend
#[derive(Clone, Debug)]
pub enum QuantState {
    Int8(Int8State),
    Fp4(Fp4State),
    Packed(PackedState),
}

/// Borrowed view of a node's base pieces, handed to adapter variants
#[derive(Clone, Copy)]
pub struct BaseRefs<'a> {
    pub kind: &'a NodeKind,
    pub weight: Option<&'a Tensor>,
    pub bias: Option<&'a Tensor>,
    pub quant: Option<&'a QuantState>,
}

/// One layer of the module graph
#[derive(Clone, Debug)]
pub struct ModuleNode {
    kind: NodeKind,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    quant: Option<QuantState>,
    adapters: Vec<AdapterSlot>,
}

impl ModuleNode {
    /// Dense layer, weight row-major [out, in] (or [in, out] when fan_in_fan_out)
    pub fn linear(in_features: usize, out_features: usize, weight: Tensor, bias: Option<Tensor>) -> Self {
        assert_eq!(weight.len(), in_features * out_features, "weight size must be in * out");
        Self {
            kind: NodeKind::Linear { in_features, out_features, fan_in_fan_out: false },
            weight: Some(weight),
            bias,
            quant: None,
            adapters: Vec::new(),
        }
    }

    /// Dense layer whose weight is stored transposed, [in, out]
    pub fn linear_fan_in_fan_out(in_features: usize, out_features: usize, weight: Tensor, bias: Option<Tensor>) -> Self {
        let mut node = Self::linear(in_features, out_features, weight, bias);
        node.kind = NodeKind::Linear { in_features, out_features, fan_in_fan_out: true };
        node
    }

    /// Embedding table, weight row-major [num_embeddings, embedding_dim]
    pub fn embedding(num_embeddings: usize, embedding_dim: usize, weight: Tensor) -> Self {
        assert_eq!(weight.len(), num_embeddings * embedding_dim, "weight size must match table");
        Self {
            kind: NodeKind::Embedding { num_embeddings, embedding_dim },
            weight: Some(weight),
            bias: None,
            quant: None,
            adapters: Vec::new(),
        }
    }

    /// 2D convolution, weight [out, in, kh, kw] flattened
    pub fn conv2d(
        in_channels: usize,
        out_channels: usize,
        kernel_size: KernelSize,
        stride: usize,
        padding: usize,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> Self {
        let (kh, kw) = match kernel_size {
            KernelSize::Square(k) => (k, k),
            KernelSize::Rect(kh, kw) => (kh, kw),
        };
        assert_eq!(weight.len(), out_channels * in_channels * kh * kw, "kernel size mismatch");
        Self {
            kind: NodeKind::Conv2d { in_channels, out_channels, kernel_size, stride, padding },
            weight: Some(weight),
            bias,
            quant: None,
            adapters: Vec::new(),
        }
    }

    /// 8-bit quantized dense layer
    pub fn linear8bit(state: Int8State, bias: Option<Tensor>) -> Self {
        let (out_features, in_features) = (state.weights.rows(), state.weights.cols());
        Self {
            kind: NodeKind::Linear8bit { in_features, out_features },
            weight: None,
            bias,
            quant: Some(QuantState::Int8(state)),
            adapters: Vec::new(),
        }
    }

    /// 4-bit block-quantized dense layer
    pub fn linear4bit(in_features: usize, out_features: usize, state: Fp4State, bias: Option<Tensor>) -> Self {
        assert_eq!(state.weights.len(), in_features * out_features, "quantized weight size mismatch");
        Self {
            kind: NodeKind::Linear4bit { in_features, out_features },
            weight: None,
            bias,
            quant: Some(QuantState::Fp4(state)),
            adapters: Vec::new(),
        }
    }

    /// Group-wise packed quantized dense layer with its own compute path
    pub fn packed_linear(state: PackedState, bias: Option<Tensor>) -> Self {
        let (out_features, in_features) = (state.weights.rows(), state.weights.cols());
        Self {
            kind: NodeKind::PackedLinear { in_features, out_features },
            weight: None,
            bias,
            quant: Some(QuantState::Packed(state)),
            adapters: Vec::new(),
        }
    }

    /// Layer normalization (no adapter variant; exercises the skip path)
    pub fn layer_norm(normalized_shape: usize, weight: Tensor, bias: Option<Tensor>) -> Self {
        assert_eq!(weight.len(), normalized_shape);
        Self {
            kind: NodeKind::LayerNorm { normalized_shape, eps: 1e-5 },
            weight: Some(weight),
            bias,
            quant: None,
            adapters: Vec::new(),
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn weight_mut(&mut self) -> Option<&mut Tensor> {
        self.weight.as_mut()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Tensor> {
        self.bias.as_mut()
    }

    pub fn quant(&self) -> Option<&QuantState> {
        self.quant.as_ref()
    }

    /// Borrowed view for adapter forward calls
    pub fn base_refs(&self) -> BaseRefs<'_> {
        BaseRefs {
            kind: &self.kind,
            weight: self.weight.as_ref(),
            bias: self.bias.as_ref(),
            quant: self.quant.as_ref(),
        }
    }

    /// Attached adapter slots, in attachment order
    pub fn adapters(&self) -> &[AdapterSlot] {
        &self.adapters
    }

    pub fn has_adapter(&self, adapter_name: &str) -> bool {
        self.adapters.iter().any(|s| s.adapter_name() == adapter_name)
    }

    pub fn adapter(&self, adapter_name: &str) -> Option<&AdapterSlot> {
        self.adapters.iter().find(|s| s.adapter_name() == adapter_name)
    }

    pub fn adapter_mut(&mut self, adapter_name: &str) -> Option<&mut AdapterSlot> {
        self.adapters.iter_mut().find(|s| s.adapter_name() == adapter_name)
    }

    pub(crate) fn attach_adapter(&mut self, slot: AdapterSlot) {
        self.adapters.push(slot);
    }

    pub(crate) fn remove_adapter(&mut self, adapter_name: &str) -> Option<AdapterSlot> {
        let idx = self.adapters.iter().position(|s| s.adapter_name() == adapter_name)?;
        Some(self.adapters.remove(idx))
    }

    /// Flip the activation flag on the named adapter, if attached
    pub fn set_adapter_activation(&mut self, adapter_name: &str, activate: bool) {
        if let Some(slot) = self.adapter_mut(adapter_name) {
            slot.variant.set_activation(activate);
        }
    }

    /// Fold the named adapter's delta into the base weight, regardless of its
    /// merge_weights setting. No-op for quantized variants.
    pub(crate) fn force_merge_adapter(&mut self, adapter_name: &str) {
        let Self { weight, adapters, .. } = self;
        if let Some(slot) = adapters.iter_mut().find(|s| s.adapter_name() == adapter_name) {
            slot.variant.force_merge(weight.as_mut());
        }
    }

    /// Toggle train/eval mode on every attached adapter (merge transitions
    /// happen here when merge_weights is set)
    pub fn set_train(&mut self, mode: bool) {
        let Self { weight, adapters, .. } = self;
        for slot in adapters.iter_mut() {
            slot.variant.set_train(mode, weight.as_mut());
        }
    }

    /// Forward for feature-vector nodes (dense family and layer norm).
    ///
    /// Dispatcher: slots are scanned in attachment order and the first
    /// activated adapter handles the call; otherwise the base layer runs.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor, TunerError> {
        for slot in &self.adapters {
            if slot.variant.is_activated() {
                return slot.variant.forward(self.base_refs(), x);
            }
        }
        base_feature_forward(&self.base_refs(), x)
    }

    /// Forward for embedding nodes (token indices in, rows out)
    pub fn forward_ids(&self, ids: &[usize]) -> Result<Tensor, TunerError> {
        for slot in &self.adapters {
            if slot.variant.is_activated() {
                return slot.variant.forward_ids(self.base_refs(), ids);
            }
        }
        base_embedding_forward(&self.base_refs(), ids)
    }

    /// Forward for conv2d nodes; `x` is [in_channels, h, w] flattened
    pub fn forward_image(&self, x: &Tensor, h: usize, w: usize) -> Result<Tensor, TunerError> {
        for slot in &self.adapters {
            if slot.variant.is_activated() {
                return slot.variant.forward_image(self.base_refs(), x, h, w);
            }
        }
        base_conv2d_forward(&self.base_refs(), x, h, w)
    }

    /// Contribute this node's parameters to a flat state dict
    pub(crate) fn collect_state(&self, path: &str, out: &mut BTreeMap<String, Tensor>) {
        if let Some(w) = &self.weight {
            out.insert(format!("{path}.weight"), w.clone());
        }
        if let Some(b) = &self.bias {
            out.insert(format!("{path}.bias"), b.clone());
        }
        for slot in &self.adapters {
            if let Some((a, b)) = slot.variant.params() {
                out.insert(format!("{path}.{}.lora_A", slot.slot_key()), a.clone());
                out.insert(format!("{path}.{}.lora_B", slot.slot_key()), b.clone());
            }
        }
    }
}

/// Base forward for dense-family nodes and layer norm
pub(crate) fn base_feature_forward(base: &BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
    match *base.kind {
        NodeKind::Linear { in_features, out_features, fan_in_fan_out } => {
            let weight = require_weight(base)?;
            check_input(x.len(), in_features)?;
            let wbuf = if fan_in_fan_out {
                transpose(weight.as_slice(), in_features, out_features)
            } else {
                weight.as_slice().to_vec()
            };
            Ok(dense(&wbuf, base.bias, x, out_features, in_features))
        }
        NodeKind::Linear8bit { in_features, out_features } => {
            let Some(QuantState::Int8(state)) = base.quant else {
                return Err(TunerError::Validation("8-bit node missing int8 state".into()));
            };
            check_input(x.len(), in_features)?;
            let wbuf = state.weights.dequantize();
            Ok(dense(&wbuf, base.bias, x, out_features, in_features))
        }
        NodeKind::Linear4bit { in_features, out_features } => {
            let Some(QuantState::Fp4(state)) = base.quant else {
                return Err(TunerError::Validation("4-bit node missing fp4 state".into()));
            };
            check_input(x.len(), in_features)?;
            let wbuf: Vec<f32> = state
                .weights
                .dequantize()
                .into_iter()
                .map(|v| state.compute_dtype.round_trip(v))
                .collect();
            Ok(dense(&wbuf, base.bias, x, out_features, in_features))
        }
        NodeKind::PackedLinear { in_features, .. } => {
            let Some(QuantState::Packed(state)) = base.quant else {
                return Err(TunerError::Validation("packed node missing packed state".into()));
            };
            check_input(x.len(), in_features)?;
            let mut y = state.weights.matvec(x.as_slice());
            if let Some(b) = base.bias {
                for (yv, bv) in y.iter_mut().zip(b.data().iter()) {
                    *yv += bv;
                }
            }
            Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
        }
        NodeKind::LayerNorm { normalized_shape, eps } => {
            let weight = require_weight(base)?;
            check_input(x.len(), normalized_shape)?;
            let n = normalized_shape as f32;
            let mean = x.as_slice().iter().sum::<f32>() / n;
            let var = x.as_slice().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let inv = 1.0 / (var + eps).sqrt();
            let mut y: Vec<f32> = x
                .as_slice()
                .iter()
                .zip(weight.data().iter())
                .map(|(v, g)| (v - mean) * inv * g)
                .collect();
            if let Some(b) = base.bias {
                for (yv, bv) in y.iter_mut().zip(b.data().iter()) {
                    *yv += bv;
                }
            }
            Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
        }
        NodeKind::Embedding { .. } | NodeKind::Conv2d { .. } => Err(TunerError::Validation(format!(
            "{} nodes do not take feature-vector input",
            base.kind.name()
        ))),
    }
}

/// Base forward for embedding nodes
pub(crate) fn base_embedding_forward(base: &BaseRefs<'_>, ids: &[usize]) -> Result<Tensor, TunerError> {
    let NodeKind::Embedding { num_embeddings, embedding_dim } = *base.kind else {
        return Err(TunerError::Validation(format!("{} is not an embedding", base.kind.name())));
    };
    let weight = require_weight(base)?;
    let mut out = Vec::with_capacity(ids.len() * embedding_dim);
    for &id in ids {
        if id >= num_embeddings {
            return Err(TunerError::Validation(format!(
                "index {id} out of range for embedding table of {num_embeddings}"
            )));
        }
        out.extend_from_slice(&weight.as_slice()[id * embedding_dim..(id + 1) * embedding_dim]);
    }
    Ok(Tensor::from_vec(out, false))
}

/// Base forward for conv2d nodes
pub(crate) fn base_conv2d_forward(base: &BaseRefs<'_>, x: &Tensor, h: usize, w: usize) -> Result<Tensor, TunerError> {
    let NodeKind::Conv2d { in_channels, out_channels, kernel_size, stride, padding } = *base.kind else {
        return Err(TunerError::Validation(format!("{} is not a conv2d", base.kind.name())));
    };
    let weight = require_weight(base)?;
    check_input(x.len(), in_channels * h * w)?;
    let (kh, kw) = match kernel_size {
        KernelSize::Square(k) => (k, k),
        KernelSize::Rect(kh, kw) => (kh, kw),
    };
    let y = conv2d_raw(
        weight.as_slice(),
        base.bias.map(|b| b.as_slice()),
        x.as_slice(),
        in_channels,
        out_channels,
        (kh, kw),
        (h, w),
        stride,
        padding,
    );
    Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
}

/// Output spatial size of a convolution along one axis
pub fn conv_out_size(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}

/// Naive direct convolution; weight is [out, in, kh, kw] flattened
#[allow(clippy::too_many_arguments)]
pub(crate) fn conv2d_raw(
    weight: &[f32],
    bias: Option<&[f32]>,
    x: &[f32],
    in_channels: usize,
    out_channels: usize,
    (kh, kw): (usize, usize),
    (h, w): (usize, usize),
    stride: usize,
    padding: usize,
) -> Vec<f32> {
    let oh = conv_out_size(h, kh, stride, padding);
    let ow = conv_out_size(w, kw, stride, padding);
    let mut out = vec![0.0f32; out_channels * oh * ow];

    for oc in 0..out_channels {
        let b = bias.map_or(0.0, |b| b[oc]);
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = b;
                for ic in 0..in_channels {
                    for ky in 0..kh {
                        let iy = (oy * stride + ky) as isize - padding as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * stride + kx) as isize - padding as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let wv = weight[((oc * in_channels + ic) * kh + ky) * kw + kx];
                            let xv = x[(ic * h + iy as usize) * w + ix as usize];
                            acc += wv * xv;
                        }
                    }
                }
                out[(oc * oh + oy) * ow + ox] = acc;
            }
        }
    }
    out
}

fn dense(wbuf: &[f32], bias: Option<&Tensor>, x: &Tensor, out_features: usize, in_features: usize) -> Tensor {
    let mut y = matmul_raw(wbuf, x.as_slice(), out_features, in_features, 1);
    if let Some(b) = bias {
        for (yv, bv) in y.iter_mut().zip(b.data().iter()) {
            *yv += bv;
        }
    }
    Tensor::from_vec(y, false).with_precision(x.precision())
}

fn require_weight<'a>(base: &BaseRefs<'a>) -> Result<&'a Tensor, TunerError> {
    base.weight
        .ok_or_else(|| TunerError::Validation(format!("{} node has no weight tensor", base.kind.name())))
}

fn check_input(got: usize, expected: usize) -> Result<(), TunerError> {
    if got != expected {
        return Err(TunerError::Validation(format!(
            "input size {got} does not match expected {expected}"
        )));
    }
    Ok(())
}
