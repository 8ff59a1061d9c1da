//! Shared low-rank adapter state
//!
//! `LoraParams` holds the pieces every variant needs: the two factor
//! matrices, the alpha/r scaling, dropout, and the merge state machine. The
//! merge/unmerge transition caches the folded delta so the unmerge subtracts
//! exactly what the merge added, keeping repeated cycles stable.
//!
//! Variants compute their own shape transform of the delta (transpose,
//! zero-pad scatter, kernel reshape) and hand the final buffer to
//! `apply_merge`/`apply_unmerge`.

use crate::precision::Precision;
use crate::tensor::{matmul_raw, Tensor};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};

/// Dropout over the adapter input, active only in train mode
#[derive(Clone, Debug)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        assert!((0.0..1.0).contains(&p), "dropout probability must be in [0, 1)");
        Self { p }
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    /// Apply inverted dropout; identity in eval mode or when p == 0
    pub fn apply(&self, x: &[f32], training: bool) -> Vec<f32> {
        if !training || self.p == 0.0 {
            return x.to_vec();
        }
        let mut rng = rand::thread_rng();
        let keep = 1.0 - self.p;
        x.iter()
            .map(|&v| if rng.gen::<f32>() < keep { v / keep } else { 0.0 })
            .collect()
    }
}

/// Low-rank factor state shared by every adapter variant
#[derive(Debug)]
pub struct LoraParams {
    r: usize,
    alpha: f32,
    scaling: f32,
    a_shape: (usize, usize),
    b_shape: (usize, usize),
    lora_a: Tensor,
    lora_b: Tensor,
    dropout: Dropout,
    merged: bool,
    merge_weights: bool,
    fan_in_fan_out: bool,
    training: bool,
    cached_delta: Option<Vec<f32>>,
    precision_warned: AtomicBool,
}

impl Clone for LoraParams {
    fn clone(&self) -> Self {
        Self {
            r: self.r,
            alpha: self.alpha,
            scaling: self.scaling,
            a_shape: self.a_shape,
            b_shape: self.b_shape,
            lora_a: self.lora_a.clone(),
            lora_b: self.lora_b.clone(),
            dropout: self.dropout.clone(),
            merged: self.merged,
            merge_weights: self.merge_weights,
            fan_in_fan_out: self.fan_in_fan_out,
            training: self.training,
            cached_delta: self.cached_delta.clone(),
            precision_warned: AtomicBool::new(self.precision_warned.load(Ordering::Relaxed)),
        }
    }
}

impl LoraParams {
    /// Create adapter parameters with linear-style init: Kaiming-uniform A,
    /// zero B, so the initial delta is exactly zero.
    ///
    /// `a_shape`/`b_shape` are the factor shapes chosen by the variant; a
    /// zero-rank adapter carries no parameters and is a no-op pass-through.
    pub fn new(
        r: usize,
        alpha: f32,
        dropout: f32,
        merge_weights: bool,
        fan_in_fan_out: bool,
        a_shape: (usize, usize),
        b_shape: (usize, usize),
    ) -> Self {
        let (lora_a, lora_b, scaling) = if r > 0 {
            let a = kaiming_uniform(a_shape.0 * a_shape.1, a_shape.1);
            let b = Tensor::zeros(b_shape.0 * b_shape.1, true);
            (a, b, alpha / r as f32)
        } else {
            (Tensor::zeros(0, false), Tensor::zeros(0, false), 0.0)
        };

        Self {
            r,
            alpha,
            scaling,
            a_shape,
            b_shape,
            lora_a,
            lora_b,
            dropout: Dropout::new(dropout),
            merged: false,
            merge_weights,
            fan_in_fan_out,
            training: true,
            cached_delta: None,
            precision_warned: AtomicBool::new(false),
        }
    }

    /// Switch to embedding-style init: zero A, Gaussian B
    pub(crate) fn reset_for_embedding(&mut self) {
        if self.r == 0 {
            return;
        }
        self.lora_a = Tensor::zeros(self.a_shape.0 * self.a_shape.1, true);
        self.lora_b = gaussian(self.b_shape.0 * self.b_shape.1);
        self.cached_delta = None;
    }

    pub fn r(&self) -> usize {
        self.r
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn scaling(&self) -> f32 {
        self.scaling
    }

    pub fn merged(&self) -> bool {
        self.merged
    }

    pub fn merge_weights(&self) -> bool {
        self.merge_weights
    }

    pub(crate) fn set_merge_weights(&mut self, merge_weights: bool) {
        self.merge_weights = merge_weights;
    }

    pub fn fan_in_fan_out(&self) -> bool {
        self.fan_in_fan_out
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub(crate) fn set_training(&mut self, mode: bool) {
        self.training = mode;
    }

    pub(crate) fn set_merged(&mut self, merged: bool) {
        self.merged = merged;
    }

    pub fn lora_a(&self) -> &Tensor {
        &self.lora_a
    }

    /// Mutable access to A; drops the cached merge delta
    pub fn lora_a_mut(&mut self) -> &mut Tensor {
        self.cached_delta = None;
        &mut self.lora_a
    }

    pub fn lora_b(&self) -> &Tensor {
        &self.lora_b
    }

    /// Mutable access to B; drops the cached merge delta
    pub fn lora_b_mut(&mut self) -> &mut Tensor {
        self.cached_delta = None;
        &mut self.lora_b
    }

    /// Both factors mutably; drops the cached merge delta
    pub(crate) fn factors_mut(&mut self) -> (&mut Tensor, &mut Tensor) {
        self.cached_delta = None;
        (&mut self.lora_a, &mut self.lora_b)
    }

    pub fn a_shape(&self) -> (usize, usize) {
        self.a_shape
    }

    pub fn b_shape(&self) -> (usize, usize) {
        self.b_shape
    }

    /// Apply dropout to the adapter input
    pub(crate) fn dropout(&self, x: &[f32]) -> Vec<f32> {
        self.dropout.apply(x, self.training)
    }

    pub fn dropout_p(&self) -> f32 {
        self.dropout.p()
    }

    /// Scaled `B @ A` as a flat [b_rows, a_cols] buffer
    pub(crate) fn delta_matrix(&self) -> Vec<f32> {
        debug_assert_eq!(self.b_shape.1, self.a_shape.0, "factor inner dims must agree");
        let mut d = matmul_raw(
            self.lora_b.as_slice(),
            self.lora_a.as_slice(),
            self.b_shape.0,
            self.b_shape.1,
            self.a_shape.1,
        );
        for v in &mut d {
            *v *= self.scaling;
        }
        d
    }

    pub(crate) fn take_cached_delta(&mut self) -> Option<Vec<f32>> {
        self.cached_delta.take()
    }

    /// Fold a variant-shaped delta into the base weight and cache it
    pub(crate) fn apply_merge(&mut self, weight: &mut Tensor, delta: Vec<f32>) {
        debug_assert_eq!(weight.len(), delta.len(), "delta must match base weight");
        for (w, d) in weight.data_mut().iter_mut().zip(delta.iter()) {
            *w += d;
        }
        self.cached_delta = Some(delta);
        self.merged = true;
    }

    /// Subtract the (cached) delta back out of the base weight
    pub(crate) fn apply_unmerge(&mut self, weight: &mut Tensor, delta: Vec<f32>) {
        debug_assert_eq!(weight.len(), delta.len(), "delta must match base weight");
        for (w, d) in weight.data_mut().iter_mut().zip(delta.iter()) {
            *w -= d;
        }
        self.merged = false;
    }

    /// Cast an output buffer back to the input's precision, warning once per
    /// adapter on the implicit reduced-precision round trip
    pub(crate) fn cast_output(&self, mut y: Vec<f32>, precision: Precision) -> Vec<f32> {
        if !precision.is_reduced() {
            return y;
        }
        if !self.precision_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                input_precision = %precision,
                "adapter parameters are f32; casting delta output back to input precision"
            );
        }
        for v in &mut y {
            *v = precision.round_trip(*v);
        }
        y
    }
}

/// Kaiming-uniform init over fan_in, matching the reference a = sqrt(5) setup
fn kaiming_uniform(len: usize, fan_in: usize) -> Tensor {
    let bound = 1.0 / (fan_in as f32).sqrt();
    let mut rng = rand::thread_rng();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-bound..bound)).collect();
    Tensor::from_vec(data, true)
}

/// Standard Gaussian init (Box-Muller)
fn gaussian(len: usize) -> Tensor {
    let mut rng = rand::thread_rng();
    let data: Vec<f32> = (0..len)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen::<f32>();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
        })
        .collect();
    Tensor::from_vec(data, true)
}
