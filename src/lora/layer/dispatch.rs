//! Adapter slot and variant dispatch
//!
//! A slot pairs an adapter name with the variant constructed for the node it
//! wraps. `AdapterVariant` is the closed set of layer adapters; the node
//! dispatcher and the patch engine talk to slots only through this enum, so
//! per-kind behavior stays in one place.

use super::conv::LoRAConv2d;
use super::embedding::LoRAEmbedding;
use super::linear::LoRALinear;
use super::merged::MergedLinear;
use super::quant::{LoRA4bitLinear, LoRA8bitLinear, LoRAPackedLinear};
use crate::graph::BaseRefs;
use crate::lora::TunerError;
use crate::tensor::Tensor;

/// One adapter attached to a module node
#[derive(Clone, Debug)]
pub struct AdapterSlot {
    adapter_name: String,
    pub variant: AdapterVariant,
}

impl AdapterSlot {
    pub fn new(adapter_name: impl Into<String>, variant: AdapterVariant) -> Self {
        Self { adapter_name: adapter_name.into(), variant }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Key segment this slot contributes to state-dict paths
    pub fn slot_key(&self) -> String {
        format!("adapter_{}", self.adapter_name)
    }
}

/// The closed set of adapter layer variants
#[derive(Clone, Debug)]
pub enum AdapterVariant {
    Linear(LoRALinear),
    Merged(MergedLinear),
    Embedding(LoRAEmbedding),
    Conv2d(LoRAConv2d),
    Linear8bit(LoRA8bitLinear),
    Linear4bit(LoRA4bitLinear),
    Packed(LoRAPackedLinear),
}

impl AdapterVariant {
    /// Short name for logs and patch reports
    pub fn kind_name(&self) -> &'static str {
        match self {
            AdapterVariant::Linear(_) => "Linear",
            AdapterVariant::Merged(_) => "MergedLinear",
            AdapterVariant::Embedding(_) => "Embedding",
            AdapterVariant::Conv2d(_) => "Conv2d",
            AdapterVariant::Linear8bit(_) => "Linear8bit",
            AdapterVariant::Linear4bit(_) => "Linear4bit",
            AdapterVariant::Packed(_) => "PackedLinear",
        }
    }

    /// True for variants over a quantized base; these never merge
    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            AdapterVariant::Linear8bit(_) | AdapterVariant::Linear4bit(_) | AdapterVariant::Packed(_)
        )
    }

    pub fn is_activated(&self) -> bool {
        match self {
            AdapterVariant::Linear(v) => v.state.is_activated(),
            AdapterVariant::Merged(v) => v.state.is_activated(),
            AdapterVariant::Embedding(v) => v.state.is_activated(),
            AdapterVariant::Conv2d(v) => v.state.is_activated(),
            AdapterVariant::Linear8bit(v) => v.state.is_activated(),
            AdapterVariant::Linear4bit(v) => v.state.is_activated(),
            AdapterVariant::Packed(v) => v.state.is_activated(),
        }
    }

    pub fn set_activation(&mut self, activate: bool) {
        match self {
            AdapterVariant::Linear(v) => v.state.set_activation(activate),
            AdapterVariant::Merged(v) => v.state.set_activation(activate),
            AdapterVariant::Embedding(v) => v.state.set_activation(activate),
            AdapterVariant::Conv2d(v) => v.state.set_activation(activate),
            AdapterVariant::Linear8bit(v) => v.state.set_activation(activate),
            AdapterVariant::Linear4bit(v) => v.state.set_activation(activate),
            AdapterVariant::Packed(v) => v.state.set_activation(activate),
        }
    }

    pub fn r(&self) -> usize {
        match self {
            AdapterVariant::Linear(v) => v.params.r(),
            AdapterVariant::Merged(v) => v.params.r(),
            AdapterVariant::Embedding(v) => v.params.r(),
            AdapterVariant::Conv2d(v) => v.params.r(),
            AdapterVariant::Linear8bit(v) => v.params.r(),
            AdapterVariant::Linear4bit(v) => v.params.r(),
            AdapterVariant::Packed(v) => v.params.r(),
        }
    }

    pub fn is_merged(&self) -> bool {
        match self {
            AdapterVariant::Linear(v) => v.params.merged(),
            AdapterVariant::Merged(v) => v.params.merged(),
            AdapterVariant::Embedding(v) => v.params.merged(),
            AdapterVariant::Conv2d(v) => v.params.merged(),
            AdapterVariant::Linear8bit(v) => v.params.merged(),
            AdapterVariant::Linear4bit(v) => v.params.merged(),
            AdapterVariant::Packed(v) => v.params.merged(),
        }
    }

    /// The low-rank factor pair, when the variant carries one (r > 0)
    pub fn params(&self) -> Option<(&Tensor, &Tensor)> {
        let p = match self {
            AdapterVariant::Linear(v) => &v.params,
            AdapterVariant::Merged(v) => &v.params,
            AdapterVariant::Embedding(v) => &v.params,
            AdapterVariant::Conv2d(v) => &v.params,
            AdapterVariant::Linear8bit(v) => &v.params,
            AdapterVariant::Linear4bit(v) => &v.params,
            AdapterVariant::Packed(v) => &v.params,
        };
        if p.r() == 0 {
            return None;
        }
        Some((p.lora_a(), p.lora_b()))
    }

    /// Mutable factor pair; drops any cached merge delta
    pub fn params_mut(&mut self) -> Option<(&mut Tensor, &mut Tensor)> {
        let p = match self {
            AdapterVariant::Linear(v) => &mut v.params,
            AdapterVariant::Merged(v) => &mut v.params,
            AdapterVariant::Embedding(v) => &mut v.params,
            AdapterVariant::Conv2d(v) => &mut v.params,
            AdapterVariant::Linear8bit(v) => &mut v.params,
            AdapterVariant::Linear4bit(v) => &mut v.params,
            AdapterVariant::Packed(v) => &mut v.params,
        };
        if p.r() == 0 {
            return None;
        }
        Some(p.factors_mut())
    }

    pub(crate) fn set_train(&mut self, mode: bool, weight: Option<&mut Tensor>) {
        match self {
            AdapterVariant::Linear(v) => v.set_train(mode, weight),
            AdapterVariant::Merged(v) => v.set_train(mode, weight),
            AdapterVariant::Embedding(v) => v.set_train(mode, weight),
            AdapterVariant::Conv2d(v) => v.set_train(mode, weight),
            AdapterVariant::Linear8bit(v) => v.set_train(mode),
            AdapterVariant::Linear4bit(v) => v.set_train(mode),
            AdapterVariant::Packed(v) => v.set_train(mode),
        }
    }

    /// Force the delta into the base weight regardless of the configured
    /// merge_weights flag. Quantized variants are a no-op; the caller decides
    /// whether that is a skip or an error.
    pub(crate) fn force_merge(&mut self, weight: Option<&mut Tensor>) {
        if self.is_quantized() {
            return;
        }
        match self {
            AdapterVariant::Linear(v) => {
                v.params.set_merge_weights(true);
                v.set_train(false, weight);
            }
            AdapterVariant::Merged(v) => {
                v.params.set_merge_weights(true);
                v.set_train(false, weight);
            }
            AdapterVariant::Embedding(v) => {
                v.params.set_merge_weights(true);
                v.set_train(false, weight);
            }
            AdapterVariant::Conv2d(v) => {
                v.params.set_merge_weights(true);
                v.set_train(false, weight);
            }
            _ => {}
        }
    }

    pub fn forward(&self, base: BaseRefs<'_>, x: &Tensor) -> Result<Tensor, TunerError> {
        match self {
            AdapterVariant::Linear(v) => v.forward(base, x),
            AdapterVariant::Merged(v) => v.forward(base, x),
            AdapterVariant::Linear8bit(v) => v.forward(base, x),
            AdapterVariant::Linear4bit(v) => v.forward(base, x),
            AdapterVariant::Packed(v) => v.forward(base, x),
            other => Err(TunerError::Validation(format!(
                "{} adapter does not take feature-vector input",
                other.kind_name()
            ))),
        }
    }

    pub fn forward_ids(&self, base: BaseRefs<'_>, ids: &[usize]) -> Result<Tensor, TunerError> {
        match self {
            AdapterVariant::Embedding(v) => v.forward_ids(base, ids),
            other => Err(TunerError::Validation(format!(
                "{} adapter does not take token indices",
                other.kind_name()
            ))),
        }
    }

    pub fn forward_image(
        &self,
        base: BaseRefs<'_>,
        x: &Tensor,
        h: usize,
        w: usize,
    ) -> Result<Tensor, TunerError> {
        match self {
            AdapterVariant::Conv2d(v) => v.forward_image(base, x, h, w),
            other => Err(TunerError::Validation(format!(
                "{} adapter does not take image input",
                other.kind_name()
            ))),
        }
    }
}
