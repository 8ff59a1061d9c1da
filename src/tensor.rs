//! Minimal tensor type backing the tuner core
//!
//! Weights are stored as flat 1D f32 arrays with explicit dimensions supplied
//! at each operation, matching how the host framework hands them over. The
//! `requires_grad` flag is the freeze/trainability marker the patch engine
//! flips; no gradient tape lives here (training orchestration is an external
//! collaborator).

use crate::precision::Precision;
use ndarray::Array1;

/// Flat f32 tensor with a trainability flag and a precision tag
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Array1<f32>,
    requires_grad: bool,
    precision: Precision,
}

impl Tensor {
    /// Create a tensor from an ndarray
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self { data, requires_grad, precision: Precision::F32 }
    }

    /// Create a tensor from a Vec
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from_vec(data), requires_grad)
    }

    /// Create a zero-filled tensor
    pub fn zeros(len: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(len), requires_grad)
    }

    /// Tag the tensor with a storage precision (f32 data interpreted as
    /// round-tripped through the given precision by the consumer)
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the data
    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    /// Mutable view of the data
    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Data as a contiguous slice
    pub fn as_slice(&self) -> &[f32] {
        self.data.as_slice().unwrap_or(&[])
    }

    /// Whether this tensor is trainable
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set the trainability flag (freeze/unfreeze)
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Storage precision tag
    pub fn precision(&self) -> Precision {
        self.precision
    }
}

/// Matrix multiply on flat buffers: `a` is [m, k], `b` is [k, n], result [m, n]
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    let out = matmul_raw(a.as_slice(), b.as_slice(), m, k, n);
    Tensor::from_vec(out, a.requires_grad() || b.requires_grad())
}

/// Matrix multiply on raw slices, row-major
pub(crate) fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), m * k, "lhs size must be m * k");
    debug_assert_eq!(b.len(), k * n, "rhs size must be k * n");

    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = a[i * k + p];
            if av == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += av * b[p * n + j];
            }
        }
    }
    out
}

/// Transpose a row-major [rows, cols] buffer into [cols, rows]
pub(crate) fn transpose(w: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(w.len(), rows * cols);
    let mut out = vec![0.0f32; w.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = w[r * cols + c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_matmul_identity() {
        let eye = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], false);
        let x = Tensor::from_vec(vec![3.0, 4.0], false);
        let y = matmul(&eye, &x, 2, 2, 1);
        assert_abs_diff_eq!(y.data()[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data()[1], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [2x3] @ [3x1]
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], false);
        let x = Tensor::from_vec(vec![1.0, 1.0, 1.0], false);
        let y = matmul(&a, &x, 2, 3, 1);
        assert_abs_diff_eq!(y.data()[0], 6.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data()[1], 15.0, epsilon = 1e-6);
    }

    #[test]
    fn test_matmul_propagates_requires_grad() {
        let a = Tensor::from_vec(vec![1.0], false);
        let b = Tensor::from_vec(vec![1.0], true);
        assert!(matmul(&a, &b, 1, 1, 1).requires_grad());

        let c = Tensor::from_vec(vec![1.0], false);
        assert!(!matmul(&a, &c, 1, 1, 1).requires_grad());
    }

    #[test]
    fn test_transpose_round_trip() {
        let w = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // [2, 3]
        let t = transpose(&w, 2, 3);
        assert_eq!(t, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(transpose(&t, 3, 2), w);
    }

    #[test]
    fn test_freeze_flag() {
        let mut t = Tensor::zeros(4, true);
        assert!(t.requires_grad());
        t.set_requires_grad(false);
        assert!(!t.requires_grad());
    }
}
