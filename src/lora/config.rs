//! Tuner configuration
//!
//! Immutable record produced by the caller and consumed by the patch and
//! unpatch engines. Serializes to JSON so a run's tuner settings can be
//! stored next to its adapter checkpoints.

use super::error::TunerError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Target module selector: one regex matched against the entire path, or a
/// list of literal suffixes matched on dotted-path token boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Regex(String),
    Suffixes(Vec<String>),
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::Suffixes(Vec::new())
    }
}

/// Which bias parameters the state-dict filter keeps and the trainable
/// marker unfreezes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasPolicy {
    /// Adapter factors only
    #[default]
    None,
    /// Adapter factors plus every bias in the graph
    All,
    /// Adapter factors plus the biases of adapter-bearing modules
    LoraOnly,
}

impl BiasPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiasPolicy::None => "none",
            BiasPolicy::All => "all",
            BiasPolicy::LoraOnly => "lora_only",
        }
    }
}

impl FromStr for BiasPolicy {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BiasPolicy::None),
            "all" => Ok(BiasPolicy::All),
            "lora_only" => Ok(BiasPolicy::LoraOnly),
            other => Err(TunerError::InvalidBiasPolicy(other.to_string())),
        }
    }
}

/// What the patch engine does with a matched module that has no adapter
/// variant for its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Log a warning and leave the module untouched
    #[default]
    Skip,
    /// Fail the whole patch call
    Error,
}

/// LoRA tuner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Rank of the decomposition; 0 is a legal no-op adapter
    pub r: usize,
    /// Modules to wrap, matched against fully-qualified dotted paths
    #[serde(default)]
    pub target_modules: TargetSpec,
    /// Scaling numerator; effective scaling is `lora_alpha / r`
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    /// Fold the delta into the base weight on eval, restore on train
    #[serde(default)]
    pub merge_weights: bool,
    /// Wrap dense targets with the group-masked variant
    #[serde(default)]
    pub use_merged_linear: bool,
    /// Per-group mask for the group-masked variant
    #[serde(default)]
    pub enable_lora: Vec<bool>,
    /// Base weight stored [in, out] instead of [out, in]
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub bias: BiasPolicy,
    #[serde(default)]
    pub on_unsupported: UnsupportedPolicy,
}

impl LoRAConfig {
    pub fn new(r: usize, lora_alpha: f32) -> Self {
        Self {
            r,
            target_modules: TargetSpec::default(),
            lora_alpha,
            lora_dropout: 0.0,
            merge_weights: false,
            use_merged_linear: false,
            enable_lora: Vec::new(),
            fan_in_fan_out: false,
            bias: BiasPolicy::None,
            on_unsupported: UnsupportedPolicy::Skip,
        }
    }

    /// Match modules whose path ends with one of the given suffixes
    pub fn target_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_modules = TargetSpec::Suffixes(suffixes.into_iter().map(Into::into).collect());
        self
    }

    /// Match modules whose full path matches the regex
    pub fn target_regex(mut self, pattern: impl Into<String>) -> Self {
        self.target_modules = TargetSpec::Regex(pattern.into());
        self
    }

    /// Query and value projections, the minimal attention target set
    pub fn target_qv_projections(self) -> Self {
        self.target_suffixes(["q_proj", "v_proj"])
    }

    /// All four attention projections
    pub fn target_attention_projections(self) -> Self {
        self.target_suffixes(["q_proj", "k_proj", "v_proj", "o_proj"])
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.lora_dropout = dropout;
        self
    }

    pub fn with_merge_weights(mut self, merge_weights: bool) -> Self {
        self.merge_weights = merge_weights;
        self
    }

    /// Use the group-masked dense variant with the given per-group mask
    pub fn with_merged_linear(mut self, enable_lora: Vec<bool>) -> Self {
        self.use_merged_linear = true;
        self.enable_lora = enable_lora;
        self
    }

    pub fn with_fan_in_fan_out(mut self, fan_in_fan_out: bool) -> Self {
        self.fan_in_fan_out = fan_in_fan_out;
        self
    }

    pub fn with_bias(mut self, bias: BiasPolicy) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_unsupported_policy(mut self, policy: UnsupportedPolicy) -> Self {
        self.on_unsupported = policy;
        self
    }

    /// Effective scaling factor, `lora_alpha / r` (0 for a zero-rank adapter)
    pub fn scaling(&self) -> f32 {
        if self.r == 0 {
            0.0
        } else {
            self.lora_alpha / self.r as f32
        }
    }

    /// Reject inconsistent settings before any module is touched
    pub fn validate(&self) -> Result<(), TunerError> {
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(TunerError::Validation(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.use_merged_linear && self.enable_lora.is_empty() {
            return Err(TunerError::Validation(
                "use_merged_linear requires a non-empty enable_lora mask".into(),
            ));
        }
        if !self.use_merged_linear && !self.enable_lora.is_empty() {
            return Err(TunerError::Validation(
                "enable_lora mask is only meaningful with use_merged_linear".into(),
            ));
        }
        Ok(())
    }
}
