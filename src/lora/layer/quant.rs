//! Quantized adapter variants
//!
//! The low-rank delta stays in f32 beside the quantized base weight. These
//! variants never merge: folding an f32 delta into a quantized buffer would
//! corrupt the stored weight, so merge_weights is forced off and set_train
//! only tracks the mode flag.

use super::activation::ActivationState;
use super::core::LoraParams;
use crate::graph::{base_feature_forward, BaseRefs};
use crate::lora::TunerError;
use crate::precision::Precision;
use crate::tensor::{matmul_raw, Tensor};

fn adapter_delta(params: &LoraParams, x: &[f32], in_features: usize, out_features: usize) -> Vec<f32> {
    let xd = params.dropout(x);
    let after_a = matmul_raw(params.lora_a().as_slice(), &xd, params.r(), in_features, 1);
    matmul_raw(params.lora_b().as_slice(), &after_a, out_features, params.r(), 1)
}

fn add_scaled(base_out: &Tensor, delta: &[f32], scaling: f32) -> Vec<f32> {
    base_out
        .as_slice()
        .iter()
        .zip(delta.iter())
        .map(|(b, d)| b + d * scaling)
        .collect()
}

/// LoRA over an 8-bit quantized dense layer
#[derive(Clone, Debug)]
pub struct LoRA8bitLinear {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_features: usize,
    out_features: usize,
    /// Quantization knobs mirrored from the replaced layer
    pub has_fp16_weights: bool,
    pub memory_efficient_backward: bool,
    pub threshold: f32,
    pub index: Option<usize>,
}

impl LoRA8bitLinear {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_features: usize,
        out_features: usize,
        r: usize,
        alpha: f32,
        dropout: f32,
        has_fp16_weights: bool,
        memory_efficient_backward: bool,
        threshold: f32,
        index: Option<usize>,
    ) -> Self {
        let params = LoraParams::new(r, alpha, dropout, false, false, (r, in_features), (out_features, r));
        Self {
            params,
            state: ActivationState::new(),
            in_features,
            out_features,
            has_fp16_weights,
            memory_efficient_backward,
            threshold,
            index,
        }
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        let base_out = base_feature_forward(&base, x)?;
        if self.params.r() == 0 || !self.state.is_activated() {
            return Ok(base_out);
        }
        let delta = adapter_delta(&self.params, x.as_slice(), self.in_features, self.out_features);
        let y = add_scaled(&base_out, &delta, self.params.scaling());
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    pub(crate) fn set_train(&mut self, mode: bool) {
        self.params.set_training(mode);
    }
}

/// LoRA over a 4-bit block-quantized dense layer
#[derive(Clone, Debug)]
pub struct LoRA4bitLinear {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_features: usize,
    out_features: usize,
    pub compute_dtype: Precision,
    pub compress_statistics: bool,
    pub quant_type: String,
}

impl LoRA4bitLinear {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_features: usize,
        out_features: usize,
        r: usize,
        alpha: f32,
        dropout: f32,
        compute_dtype: Precision,
        compress_statistics: bool,
        quant_type: String,
    ) -> Self {
        let params = LoraParams::new(r, alpha, dropout, false, false, (r, in_features), (out_features, r));
        Self {
            params,
            state: ActivationState::new(),
            in_features,
            out_features,
            compute_dtype,
            compress_statistics,
            quant_type,
        }
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        let base_out = base_feature_forward(&base, x)?;
        if self.params.r() == 0 || !self.state.is_activated() {
            return Ok(base_out);
        }
        let delta = adapter_delta(&self.params, x.as_slice(), self.in_features, self.out_features);
        let y = add_scaled(&base_out, &delta, self.params.scaling());
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    pub(crate) fn set_train(&mut self, mode: bool) {
        self.params.set_training(mode);
    }
}

/// LoRA over a group-wise packed dense layer whose compute kernel is opaque
#[derive(Clone, Debug)]
pub struct LoRAPackedLinear {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_features: usize,
    out_features: usize,
}

impl LoRAPackedLinear {
    pub fn new(in_features: usize, out_features: usize, r: usize, alpha: f32, dropout: f32) -> Self {
        let params = LoraParams::new(r, alpha, dropout, false, false, (r, in_features), (out_features, r));
        Self { params, state: ActivationState::new(), in_features, out_features }
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        let base_out = base_feature_forward(&base, x)?;
        if self.params.r() == 0 || !self.state.is_activated() {
            return Ok(base_out);
        }
        let delta = adapter_delta(&self.params, x.as_slice(), self.in_features, self.out_features);
        let y = add_scaled(&base_out, &delta, self.params.scaling());
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    pub(crate) fn set_train(&mut self, mode: bool) {
        self.params.set_training(mode);
    }
}
