//! Grouped/selective dense adapter variant
//!
//! The rank decomposition only touches output channels whose group is
//! enabled by the `enable_lora` mask: output width is split into
//! `mask.len()` equal groups, the low-rank delta is computed per enabled
//! group (grouped conv1d equivalent, kernel size 1), and scattered into the
//! full output width through a zero-padding projection.

use super::activation::ActivationState;
use super::core::LoraParams;
use crate::graph::{base_feature_forward, BaseRefs};
use crate::lora::TunerError;
use crate::tensor::{matmul_raw, transpose, Tensor};

/// LoRA restricted to a masked subset of output channel groups
#[derive(Clone, Debug)]
pub struct MergedLinear {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_features: usize,
    out_features: usize,
    enable_lora: Vec<bool>,
    /// Per-output-row flag: true where a delta row lands
    lora_ind: Vec<bool>,
}

impl MergedLinear {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_features: usize,
        out_features: usize,
        r: usize,
        alpha: f32,
        dropout: f32,
        enable_lora: Vec<bool>,
        merge_weights: bool,
        fan_in_fan_out: bool,
    ) -> Result<Self, TunerError> {
        if enable_lora.is_empty() || out_features % enable_lora.len() != 0 {
            return Err(TunerError::MaskMismatch {
                mask_len: enable_lora.len(),
                out_features,
            });
        }

        let groups = enable_lora.len();
        let group_size = out_features / groups;
        let active = enable_lora.iter().filter(|&&e| e).count();

        let params = if r > 0 && active > 0 {
            LoraParams::new(
                r,
                alpha,
                dropout,
                merge_weights,
                fan_in_fan_out,
                (r * active, in_features),
                (group_size * active, r),
            )
        } else {
            // No enabled group behaves like a zero-rank adapter
            LoraParams::new(0, alpha, dropout, merge_weights, fan_in_fan_out, (0, 0), (0, 0))
        };

        let mut lora_ind = vec![false; out_features];
        for (g, &enabled) in enable_lora.iter().enumerate() {
            if enabled {
                lora_ind[g * group_size..(g + 1) * group_size].fill(true);
            }
        }

        Ok(Self {
            params,
            state: ActivationState::new(),
            in_features,
            out_features,
            enable_lora,
            lora_ind,
        })
    }

    pub fn enable_lora(&self) -> &[bool] {
        &self.enable_lora
    }

    fn group_size(&self) -> usize {
        self.out_features / self.enable_lora.len()
    }

    fn active_groups(&self) -> usize {
        self.enable_lora.iter().filter(|&&e| e).count()
    }

    /// Scatter `packed` rows (enabled groups only) into the full output width
    fn zero_pad(&self, packed: &[f32], cols: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.out_features * cols];
        let mut src_row = 0;
        for (row, &enabled) in self.lora_ind.iter().enumerate() {
            if enabled {
                out[row * cols..(row + 1) * cols]
                    .copy_from_slice(&packed[src_row * cols..(src_row + 1) * cols]);
                src_row += 1;
            }
        }
        out
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        let base_out = base_feature_forward(&base, x)?;
        if self.params.r() == 0 || self.params.merged() || !self.state.is_activated() {
            return Ok(base_out);
        }

        let r = self.params.r();
        let gs = self.group_size();
        let active = self.active_groups();

        // A @ dropout(x): [r * active]
        let xd = self.params.dropout(x.as_slice());
        let after_a = matmul_raw(self.params.lora_a().as_slice(), &xd, r * active, self.in_features, 1);

        // Grouped B application: each enabled group maps its r slice to gs rows
        let b = self.params.lora_b().as_slice();
        let mut packed = Vec::with_capacity(gs * active);
        for g in 0..active {
            let b_g = &b[g * gs * r..(g + 1) * gs * r];
            let a_g = &after_a[g * r..(g + 1) * r];
            packed.extend(matmul_raw(b_g, a_g, gs, r, 1));
        }

        let padded = self.zero_pad(&packed, 1);
        let scaling = self.params.scaling();
        let y: Vec<f32> = base_out
            .as_slice()
            .iter()
            .zip(padded.iter())
            .map(|(bv, d)| bv + d * scaling)
            .collect();
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    /// Scaled, scattered delta in the base weight's storage layout
    pub(crate) fn transformed_delta(&self) -> Vec<f32> {
        let r = self.params.r();
        let gs = self.group_size();
        let active = self.active_groups();
        let a = self.params.lora_a().as_slice();
        let b = self.params.lora_b().as_slice();
        let scaling = self.params.scaling();

        // Per-group B_g @ A_g: [gs * active, in]
        let mut packed = Vec::with_capacity(gs * active * self.in_features);
        for g in 0..active {
            let b_g = &b[g * gs * r..(g + 1) * gs * r];
            let a_g = &a[g * r * self.in_features..(g + 1) * r * self.in_features];
            packed.extend(matmul_raw(b_g, a_g, gs, r, self.in_features));
        }
        for v in &mut packed {
            *v *= scaling;
        }

        let full = self.zero_pad(&packed, self.in_features);
        if self.params.fan_in_fan_out() {
            transpose(&full, self.out_features, self.in_features)
        } else {
            full
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
