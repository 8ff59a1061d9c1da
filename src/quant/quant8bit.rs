//! Row-wise absmax symmetric int8 quantization
//!
//! Storage backend for 8-bit quantized dense nodes. Each output row of the
//! [rows, cols] weight matrix carries one f32 scale; values are stored as
//! signed bytes in [-127, 127].

use serde::{Deserialize, Serialize};

/// Int8 quantized weight matrix with per-row scale factors
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantizedInt8 {
    /// One scale per output row
    scales: Vec<f32>,
    /// Quantized values, row-major [rows, cols]
    data: Vec<i8>,
    rows: usize,
    cols: usize,
}

impl QuantizedInt8 {
    /// Quantize a row-major [rows, cols] f32 weight matrix
    pub fn quantize(values: &[f32], rows: usize, cols: usize) -> Self {
        assert_eq!(values.len(), rows * cols, "weight size must be rows * cols");

        let mut scales = Vec::with_capacity(rows);
        let mut data = Vec::with_capacity(values.len());

        for row in values.chunks(cols) {
            let max_abs = row.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1e-8 };
            scales.push(scale);
            for &val in row {
                data.push((val / scale).clamp(-127.0, 127.0).round() as i8);
            }
        }

        Self { scales, data, rows, cols }
    }

    /// Dequantize back to a row-major f32 matrix
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.data.len());
        for (r, row) in self.data.chunks(self.cols).enumerate() {
            let scale = self.scales[r];
            out.extend(row.iter().map(|&q| f32::from(q) * scale));
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

    /// Memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.scales.len() * 4 + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_round_trip_close() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 * 0.3).sin()).collect();
        let q = QuantizedInt8::quantize(&values, 4, 8);
        let deq = q.dequantize();

        for (orig, d) in values.iter().zip(deq.iter()) {
            assert_abs_diff_eq!(orig, d, epsilon = 0.01);
        }
    }

    #[test]
    fn test_per_row_scaling() {
        // Rows with very different magnitudes quantize independently
        let mut values = vec![0.001f32; 8];
        values.extend(vec![100.0f32; 8]);
        let q = QuantizedInt8::quantize(&values, 2, 8);
        let deq = q.dequantize();

        assert_abs_diff_eq!(deq[0], 0.001, epsilon = 1e-4);
        assert_abs_diff_eq!(deq[8], 100.0, epsilon = 1.0);
    }

    #[test]
    fn test_zero_row() {
        let q = QuantizedInt8::quantize(&[0.0; 8], 1, 8);
        for v in q.dequantize() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_memory_savings() {
        let q = QuantizedInt8::quantize(&vec![1.0; 1024], 32, 32);
        // ~4x smaller than f32 plus scale overhead
        assert!(q.memory_bytes() < 1024 * 4 / 3);
    }
}
