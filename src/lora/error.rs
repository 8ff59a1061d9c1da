//! Tuner error taxonomy
//!
//! Configuration errors are fatal and surfaced immediately; unsupported
//! targets and precision mismatches are recoverable and handled at their
//! call sites (logged, then skipped or cast).

use thiserror::Error;

/// Errors raised by the patch/unpatch engines and layer constructors
#[derive(Error, Debug)]
pub enum TunerError {
    #[error("adapter '{adapter}' is already attached to module '{path}'")]
    DuplicateAdapter { path: String, adapter: String },

    #[error("invalid bias policy '{0}' (expected 'none', 'all' or 'lora_only')")]
    InvalidBiasPolicy(String),

    #[error("enable_lora mask length {mask_len} must divide out_features {out_features}")]
    MaskMismatch { mask_len: usize, out_features: usize },

    #[error("conv2d adapter requires a scalar kernel size, module '{path}' has {kernel}")]
    NonScalarKernel { path: String, kernel: String },

    #[error("module '{path}' of kind {kind} has no adapter variant")]
    UnsupportedTarget { path: String, kind: String },

    #[error("invalid target regex: {0}")]
    InvalidTargetRegex(#[from] regex::Error),

    #[error("validation error: {0}")]
    Validation(String),
}
