//! Dense adapter variant
//!
//! Forward (rank > 0, active, unmerged):
//! `y = base_linear(x) + scaling * (B @ (A @ dropout(x)))`
//! computed in f32 and cast back to the input's precision. Merged or
//! inactive, the base layer output is returned unchanged.

use super::activation::ActivationState;
use super::core::LoraParams;
use crate::graph::{base_feature_forward, BaseRefs};
use crate::lora::TunerError;
use crate::tensor::{matmul_raw, transpose, Tensor};

/// LoRA over a plain dense layer
#[derive(Clone, Debug)]
pub struct LoRALinear {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_features: usize,
    out_features: usize,
}

impl LoRALinear {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_features: usize,
        out_features: usize,
        r: usize,
        alpha: f32,
        dropout: f32,
        merge_weights: bool,
        fan_in_fan_out: bool,
    ) -> Self {
        let params = LoraParams::new(
            r,
            alpha,
            dropout,
            merge_weights,
            fan_in_fan_out,
            (r, in_features),
            (out_features, r),
        );
        Self { params, state: ActivationState::new(), in_features, out_features }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        let base_out = base_feature_forward(&base, x)?;
        if self.params.r() == 0 || self.params.merged() || !self.state.is_activated() {
            return Ok(base_out);
        }

        let xd = self.params.dropout(x.as_slice());
        let after_a = matmul_raw(self.params.lora_a().as_slice(), &xd, self.params.r(), self.in_features, 1);
        let after_b = matmul_raw(
            self.params.lora_b().as_slice(),
            &after_a,
            self.out_features,
            self.params.r(),
            1,
        );

        let scaling = self.params.scaling();
        let y: Vec<f32> = base_out
            .as_slice()
            .iter()
            .zip(after_b.iter())
            .map(|(b, d)| b + d * scaling)
            .collect();
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    /// Scaled delta in the base weight's storage layout
    pub(crate) fn transformed_delta(&self) -> Vec<f32> {
        let d = self.params.delta_matrix(); // [out, in]
        if self.params.fan_in_fan_out() {
            transpose(&d, self.out_features, self.in_features)
        } else {
            d
        }
    }

    pub(crate) fn set_train(&mut self, mode: bool, weight: Option<&mut Tensor>) {
        self.params.set_training(mode);
        if mode {
            if self.params.merge_weights() && self.params.merged() {
                if self.params.r() > 0 {
                    if let Some(weight) = weight {
                        let cached = self.params.take_cached_delta();
                        let delta = cached.unwrap_or_else(|| self.transformed_delta());
                        self.params.apply_unmerge(weight, delta);
                    }
                } else {
                    self.params.set_merged(false);
                }
            }
        } else if self.params.merge_weights() && !self.params.merged() {
            if self.params.r() > 0 {
                if let Some(weight) = weight {
                    let delta = self.transformed_delta();
                    self.params.apply_merge(weight, delta);
                }
            } else {
                self.params.set_merged(true);
            }
        }
    }
}
