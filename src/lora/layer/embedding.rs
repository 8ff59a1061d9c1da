//! Embedding adapter variant
//!
//! A is [r, num_embeddings], B is [embedding_dim, r]. For each looked-up
//! token the delta row is `B @ A[:, id]`, scaled. Init differs from the
//! dense variant: A starts at zero, B Gaussian, so the initial delta is
//! still exactly zero.

use super::activation::ActivationState;
use super::core::LoraParams;
use crate::graph::{base_embedding_forward, BaseRefs};
use crate::lora::TunerError;
use crate::tensor::{transpose, Tensor};

/// LoRA over an embedding table
#[derive(Clone, Debug)]
pub struct LoRAEmbedding {
    pub(crate) params: LoraParams,
    pub(crate) state: ActivationState,
    num_embeddings: usize,
    embedding_dim: usize,
}

impl LoRAEmbedding {
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        r: usize,
        alpha: f32,
        merge_weights: bool,
    ) -> Self {
        let mut params = LoraParams::new(
            r,
            alpha,
            0.0,
            merge_weights,
            false,
            (r, num_embeddings),
            (embedding_dim, r),
        );
        params.reset_for_embedding();
        Self { params, state: ActivationState::new(), num_embeddings, embedding_dim }
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn forward_ids(&self, base: BaseRefs<'_>, ids: &[usize]) -> Result<Tensor, TunerError> {
        let base_out = base_embedding_forward(&base, ids)?;
        if self.params.r() == 0 || self.params.merged() || !self.state.is_activated() {
            return Ok(base_out);
        }

        let r = self.params.r();
        let a = self.params.lora_a().as_slice();
        let b = self.params.lora_b().as_slice();
        let scaling = self.params.scaling();

        let mut y = base_out.as_slice().to_vec();
        for (tok, &id) in ids.iter().enumerate() {
            for dim in 0..self.embedding_dim {
                let mut acc = 0.0f32;
                for k in 0..r {
                    // A[:, id] gathered column; B row `dim`
                    acc += b[dim * r + k] * a[k * self.num_embeddings + id];
                }
                y[tok * self.embedding_dim + dim] += acc * scaling;
            }
        }
        Ok(Tensor::from_vec(y, false))
    }

    /// Scaled `(B @ A)^T`, matching the [num_embeddings, embedding_dim] table
    pub(crate) fn transformed_delta(&self) -> Vec<f32> {
        let d = self.params.delta_matrix(); // [embedding_dim, num_embeddings]
        transpose(&d, self.embedding_dim, self.num_embeddings)
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
