//! Adapter layer variants
//!
//! Each variant wraps one node kind with a low-rank delta. Shared state
//! (factors, scaling, dropout, merge machine) lives in [`LoraParams`]; the
//! activation switch is [`ActivationState`]; [`AdapterVariant`] is the closed
//! dispatch enum the rest of the crate talks to.

mod activation;
mod conv;
mod core;
mod dispatch;
mod embedding;
mod linear;
mod merged;
mod quant;


pub use activation::ActivationState;
pub use conv::LoRAConv2d;
pub use core::{Dropout, LoraParams};
pub use dispatch::{AdapterSlot, AdapterVariant};
pub use embedding::LoRAEmbedding;
pub use linear::LoRALinear;
pub use merged::MergedLinear;
pub use quant::{LoRA4bitLinear, LoRA8bitLinear, LoRAPackedLinear};
