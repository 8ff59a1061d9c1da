//! Block-wise symmetric 4-bit quantization
//!
//! Storage backend for 4-bit quantized dense nodes. Each 64-element block
//! carries one f32 scale; values are packed two per byte as signed nibbles
//! in [-7, 7].
//!
//! Quantization: q = round(clamp(x / scale, -7, 7))
//! Dequantization: x ≈ q * scale

use serde::{Deserialize, Serialize};

/// Elements per quantization block
pub const BLOCK_SIZE: usize = 64;

/// 4-bit quantized buffer with block-wise scale factors
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quantized4Bit {
    /// One scale per block
    scales: Vec<f32>,
    /// Packed nibbles, two values per byte (first in the high nibble)
    data: Vec<u8>,
    /// Original element count
    len: usize,
}

impl Quantized4Bit {
    /// Quantize an f32 buffer
    pub fn quantize(values: &[f32]) -> Self {
        let len = values.len();
        let mut scales = Vec::with_capacity(len.div_ceil(BLOCK_SIZE));
        let mut data = vec![0u8; len.div_ceil(2)];

        for (block_idx, block) in values.chunks(BLOCK_SIZE).enumerate() {
            let max_abs = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            let scale = if max_abs > 0.0 { max_abs / 7.0 } else { 1e-8 };
            scales.push(scale);

            for (i, &val) in block.iter().enumerate() {
                let flat = block_idx * BLOCK_SIZE + i;
                let q = ((val / scale).clamp(-7.0, 7.0).round() as i8 as u8) & 0x0F;
                if flat % 2 == 0 {
                    data[flat / 2] |= q << 4;
                } else {
                    data[flat / 2] |= q;
                }
            }
        }

        Self { scales, data, len }
    }

    /// Dequantize back to f32
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.len);
        for flat in 0..self.len {
            let byte = self.data[flat / 2];
            let nibble = if flat % 2 == 0 { byte >> 4 } else { byte & 0x0F };
            // Sign-extend the 4-bit value
            let q = if nibble & 0x08 != 0 { (nibble | 0xF0) as i8 } else { nibble as i8 };
            out.push(f32::from(q) * self.scales[flat / BLOCK_SIZE]);
        }
        out
    }

    /// Original element count
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.scales.len() * 4 + self.data.len()
    }

    /// Compression ratio vs f32 storage
    pub fn compression_ratio(&self) -> f32 {
        (self.len * 4) as f32 / self.memory_bytes() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_round_trip_within_quantization_error() {
        let values = vec![1.0, -2.0, 3.5, -4.2, 0.5, -0.8, 2.1, -1.5];
        let q = Quantized4Bit::quantize(&values);
        let deq = q.dequantize();

        assert_eq!(deq.len(), values.len());
        for (orig, d) in values.iter().zip(deq.iter()) {
            let rel = (orig - d).abs() / orig.abs().max(1e-6);
            assert!(rel < 0.3, "relative error too large: {orig} vs {d}");
        }
    }

    #[test]
    fn test_zeros_stay_zero() {
        let q = Quantized4Bit::quantize(&[0.0; 64]);
        for v in q.dequantize() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_multiple_blocks() {
        let values: Vec<f32> = (0..200).map(|i| (i as f32 * 0.1).sin()).collect();
        let q = Quantized4Bit::quantize(&values);
        assert_eq!(q.dequantize().len(), 200);
        assert_eq!(q.scales.len(), 200usize.div_ceil(BLOCK_SIZE));
    }

    #[test]
    fn test_odd_length() {
        let values: Vec<f32> = (0..77).map(|i| i as f32 * 0.5).collect();
        let q = Quantized4Bit::quantize(&values);
        assert_eq!(q.dequantize().len(), 77);
    }

    #[test]
    fn test_compression_ratio() {
        let q = Quantized4Bit::quantize(&vec![1.5; 1024]);
        assert!(q.compression_ratio() > 6.0);
    }
}
