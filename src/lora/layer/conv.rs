//! Conv2d adapter variant
//!
//! Only square kernels are supported: A is [r*k, in*k], B is [out*k, r*k],
//! and `B @ A` flattens exactly onto the [out, in, k, k] kernel, so merging
//! is a plain elementwise add on the stored kernel. The unmerged path builds
//! the effective kernel `W + delta` and convolves once.

use super::activation::ActivationState;
use super::core::LoraParams;
use crate::graph::{base_conv2d_forward, conv2d_raw, BaseRefs};
use crate::lora::TunerError;
use crate::tensor::Tensor;

/// LoRA over a square-kernel 2D convolution
#[derive(Clone, Debug)]
pub struct LoRAConv2d {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl LoRAConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        r: usize,
        alpha: f32,
        dropout: f32,
        merge_weights: bool,
    ) -> Self {
        let params = LoraParams::new(
            r,
            alpha,
            dropout,
            merge_weights,
            false,
            (r * kernel, in_channels * kernel),
            (out_channels * kernel, r * kernel),
        );
        Self {
            params,
            state: ActivationState::new(),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
        }
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn forward_image(
        &self,
        base: BaseRefs<'_>,
        x: &Tensor,
        h: usize,
        w: usize,
    ) -> Result<Tensor, TunerError> {
        if self.params.r() == 0 || self.params.merged() || !self.state.is_activated() {
            return base_conv2d_forward(&base, x, h, w);
        }

        let weight = base.weight.ok_or_else(|| {
            TunerError::Validation("conv2d node has no weight tensor".into())
        })?;
        if x.len() != self.in_channels * h * w {
            return Err(TunerError::Validation(format!(
                "input size {} does not match expected {}",
                x.len(),
                self.in_channels * h * w
            )));
        }

        // Effective kernel W + delta, then one convolution
        let delta = self.transformed_delta();
        let eff: Vec<f32> = weight
            .as_slice()
            .iter()
            .zip(delta.iter())
            .map(|(wv, d)| wv + d)
            .collect();
        let y = conv2d_raw(
            &eff,
            base.bias.map(|b| b.as_slice()),
            x.as_slice(),
            self.in_channels,
            self.out_channels,
            (self.kernel, self.kernel),
            (h, w),
            self.stride,
            self.padding,
        );
        let y = self.params.cast_output(y, x.precision());
        Ok(Tensor::from_vec(y, false).with_precision(x.precision()))
    }

    /// Scaled `B @ A` reinterpreted as the flat [out, in, k, k] kernel
    pub(crate) fn transformed_delta(&self) -> Vec<f32> {
        // [out*k, r*k] @ [r*k, in*k] = [out*k, in*k], same element count and
        // the same flat ordering as the stored kernel
        self.params.delta_matrix()
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
