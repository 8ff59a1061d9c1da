//! Low-rank adaptation tuner core
//!
//! Patches low-rank adapters into a live [`ModuleGraph`](crate::graph::ModuleGraph),
//! manages their activation and merge state across train/eval transitions,
//! and filters state dicts for adapter checkpointing.
//!
//! Typical flow:
//! 1. Build a [`LoRAConfig`] with rank, alpha, and target modules.
//! 2. [`LoRA::prepare_model`] patches the graph and returns a [`TunerOutput`].
//! 3. [`LoRA::activate_adapter`] switches the adapter path on.
//! 4. Train; `graph.set_train(false)` folds weights when `merge_weights` is set.
//! 5. [`TunerOutput::state_dict`] filters parameters for checkpointing, or
//!    [`LoRA::unpatch_lora`] strips the adapters for deployment.

pub mod checkpoint;
mod config;
mod error;
pub mod layer;
mod locate;
mod patch;
mod state_dict;
mod unpatch;

#[cfg(test)]
mod tests;

pub use checkpoint::{
    load_adapter, save_adapter, AdapterCheckpoint, CheckpointError, MergedModel,
};
pub use config::{BiasPolicy, LoRAConfig, TargetSpec, UnsupportedPolicy};
pub use error::TunerError;
pub use locate::find_target_modules;
pub use patch::{LoRA, TunerOutput};
pub use state_dict::{lora_state_dict, mark_lora_as_trainable};
