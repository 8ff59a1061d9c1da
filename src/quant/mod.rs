//! Quantized weight backends for the tuner core
//!
//! The quantization algorithms themselves (bitsandbytes-style int8, NF4-style
//! block quantization, GPTQ packing) are external concerns; these modules are
//! the minimal storage/compute stand-ins the quantized adapter variants wrap.

mod packed;
mod quant4bit;
mod quant8bit;

pub use packed::PackedInt4;
pub use quant4bit::{Quantized4Bit, BLOCK_SIZE};
pub use quant8bit::QuantizedInt8;
