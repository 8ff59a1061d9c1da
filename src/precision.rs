//! Reduced-precision tags and conversions
//!
//! Adapter parameters are kept in f32; inputs may arrive tagged with a
//! reduced precision under mixed-precision training. The dense adapter
//! computes its delta in f32 and casts the result back through the input's
//! precision so merged and unmerged paths see the same rounding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data type precision levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    /// 32-bit floating point (default)
    #[default]
    F32,
    /// 16-bit IEEE half precision
    F16,
    /// 16-bit brain floating point (truncated mantissa)
    Bf16,
}

impl Precision {
    /// Size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::Bf16 => 2,
        }
    }

    /// Whether this is a reduced precision type
    pub fn is_reduced(&self) -> bool {
        matches!(self, Precision::F16 | Precision::Bf16)
    }

    /// Round-trip a value through this precision
    pub fn round_trip(&self, value: f32) -> f32 {
        match self {
            Precision::F32 => value,
            Precision::F16 => f16_to_f32(f32_to_f16(value)),
            Precision::Bf16 => bf16_to_f32(f32_to_bf16(value)),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::Bf16 => "bf16",
        };
        write!(f, "{name}")
    }
}

/// Convert f32 to bf16 (truncated)
///
/// BF16 uses the same exponent as f32 but only 7 mantissa bits.
pub fn f32_to_bf16(value: f32) -> u16 {
    let bits = value.to_bits();
    (bits >> 16) as u16
}

/// Convert bf16 to f32
pub fn bf16_to_f32(value: u16) -> f32 {
    f32::from_bits(u32::from(value) << 16)
}

/// Convert f32 to fp16 (IEEE half precision), round-to-nearest-even
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Inf / NaN
        let payload = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | payload;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        // Overflow to infinity
        return sign | 0x7C00;
    }
    if unbiased >= -14 {
        // Normal half
        let half_exp = ((unbiased + 15) as u16) << 10;
        let half_mant = (mantissa >> 13) as u16;
        let round_bit = (mantissa >> 12) & 1;
        let sticky = mantissa & 0x0FFF;
        let mut half = sign | half_exp | half_mant;
        if round_bit == 1 && (sticky != 0 || half_mant & 1 == 1) {
            half += 1;
        }
        return half;
    }
    if unbiased >= -24 {
        // Subnormal half
        let shift = (-1 - unbiased) as u32; // 13..23
        let full_mant = mantissa | 0x0080_0000;
        let half_mant = (full_mant >> (shift + 1)) as u16;
        let round_bit = (full_mant >> shift) & 1;
        let mut half = sign | half_mant;
        if round_bit == 1 {
            half += 1;
        }
        return half;
    }
    // Underflow to zero
    sign
}

/// Convert fp16 to f32
pub fn f16_to_f32(value: u16) -> f32 {
    let sign = u32::from(value & 0x8000) << 16;
    let exp = u32::from(value >> 10) & 0x1F;
    let mantissa = u32::from(value & 0x03FF);

    let bits = if exp == 0x1F {
        sign | 0x7F80_0000 | (mantissa << 13)
    } else if exp == 0 {
        if mantissa == 0 {
            sign
        } else {
            // Normalize subnormal
            let mut m = mantissa;
            let mut e = -1i32;
            while m & 0x0400 == 0 {
                m <<= 1;
                e -= 1;
            }
            m &= 0x03FF;
            sign | (((112 + e + 1) as u32) << 23) | (m << 13)
        }
    } else {
        sign | ((exp + 112) << 23) | (mantissa << 13)
    };
    f32::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bf16_round_trip_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 2.0, -4.0] {
            assert_abs_diff_eq!(bf16_to_f32(f32_to_bf16(v)), v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bf16_truncates_mantissa() {
        let v = 1.000_123f32;
        let rt = bf16_to_f32(f32_to_bf16(v));
        assert!((rt - v).abs() < 0.01);
        assert_ne!(rt, v);
    }

    #[test]
    fn test_f16_round_trip_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 1024.0, -0.25] {
            assert_abs_diff_eq!(f16_to_f32(f32_to_f16(v)), v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_f16_overflow_to_infinity() {
        assert!(f16_to_f32(f32_to_f16(1e6)).is_infinite());
        assert!(f16_to_f32(f32_to_f16(-1e6)).is_infinite());
    }

    #[test]
    fn test_f16_subnormal() {
        let v = 1e-7f32;
        let rt = f16_to_f32(f32_to_f16(v));
        assert!(rt >= 0.0 && rt < 1e-6);
    }

    #[test]
    fn test_round_trip_idempotent() {
        // A second pass through the same precision must not move the value
        for p in [Precision::F16, Precision::Bf16] {
            let once = p.round_trip(0.337);
            assert_eq!(p.round_trip(once), once);
        }
    }

    #[test]
    fn test_precision_sizes() {
        assert_eq!(Precision::F32.size_bytes(), 4);
        assert_eq!(Precision::F16.size_bytes(), 2);
        assert_eq!(Precision::Bf16.size_bytes(), 2);
        assert!(!Precision::F32.is_reduced());
        assert!(Precision::Bf16.is_reduced());
    }
}
