//! Group-wise packed 4-bit quantized linear weights
//!
//! Stand-in for GPTQ-style quant-linear modules: input columns are assigned
//! to groups via an explicit group index, each (row, group) pair carries its
//! own scale, and the module owns its compute path. The packed adapter
//! variant wraps this opaquely and never unpacks it for merging.

use serde::{Deserialize, Serialize};

/// Packed 4-bit weight matrix with group-wise scales and a column group index
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackedInt4 {
    /// Packed nibbles, row-major, two values per byte (high nibble first)
    qweight: Vec<u8>,
    /// Scales, row-major [rows, num_groups]
    scales: Vec<f32>,
    /// Group id per input column
    group_index: Vec<u32>,
    group_size: usize,
    rows: usize,
    cols: usize,
}

impl PackedInt4 {
    /// Pack a row-major [rows, cols] f32 weight matrix with the given group size
    pub fn pack(values: &[f32], rows: usize, cols: usize, group_size: usize) -> Self {
        assert_eq!(values.len(), rows * cols, "weight size must be rows * cols");
        assert!(group_size > 0, "group size must be positive");

        let num_groups = cols.div_ceil(group_size);
        let group_index: Vec<u32> = (0..cols).map(|c| (c / group_size) as u32).collect();

        // One absmax scale per (row, group)
        let mut scales = vec![1e-8f32; rows * num_groups];
        for r in 0..rows {
            for c in 0..cols {
                let g = group_index[c] as usize;
                let slot = &mut scales[r * num_groups + g];
                *slot = slot.max(values[r * cols + c].abs() / 7.0);
            }
        }

        let mut qweight = vec![0u8; (rows * cols).div_ceil(2)];
        for r in 0..rows {
            for c in 0..cols {
                let g = group_index[c] as usize;
                let scale = scales[r * num_groups + g];
                let val = values[r * cols + c];
                let q = ((val / scale).clamp(-7.0, 7.0).round() as i8 as u8) & 0x0F;
                let flat = r * cols + c;
                if flat % 2 == 0 {
                    qweight[flat / 2] |= q << 4;
                } else {
                    qweight[flat / 2] |= q;
                }
            }
        }

        Self { qweight, scales, group_index, group_size, rows, cols }
    }

    fn value_at(&self, r: usize, c: usize) -> f32 {
        let flat = r * self.cols + c;
        let byte = self.qweight[flat / 2];
        let nibble = if flat % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        let q = if nibble & 0x08 != 0 { (nibble | 0xF0) as i8 } else { nibble as i8 };
        let num_groups = self.cols.div_ceil(self.group_size);
        let scale = self.scales[r * num_groups + self.group_index[c] as usize];
        f32::from(q) * scale
    }

    /// The module's own compute path: y = W x on packed storage
    pub fn matvec(&self, x: &[f32]) -> Vec<f32> {
        assert_eq!(x.len(), self.cols, "input size must match cols");
        let mut out = vec![0.0f32; self.rows];
        for (r, slot) in out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (c, &xv) in x.iter().enumerate() {
                acc += self.value_at(r, c) * xv;
            }
            *slot = acc;
        }
        out
    }

    /// Dequantize to a row-major f32 matrix
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.push(self.value_at(r, c));
            }
        }
        out
    }

    /// Output rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Input columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Quantization group size
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Group id per input column
    pub fn group_index(&self) -> &[u32] {
        &self.group_index
    }
}
