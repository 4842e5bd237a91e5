//! # vistune-core
//!
//! Configuration, launch planning and dataset tooling for LoRA fine-tuning of
//! vision-language models. The training engine and the merge utility are
//! external Python programs; this crate builds and validates their invocation,
//! runs them, and records what happened.
//!
//! The two stages:
//! 1. **Fine-tune**: [`finetune::FinetunePlan`] derives accumulation steps and pixel
//!    bounds, then wraps the trainer script in a distributed launcher.
//! 2. **Merge**: [`merge::MergePlan`] folds the trained adapter into its base checkpoint.
//!
//! [`pipeline::Pipeline`] chains them, handing the fine-tune output directory to the merge.

pub mod config;
pub mod dataset;
pub mod derive;
pub mod doctor;
pub mod env;
pub mod error;
pub mod finetune;
pub mod launcher;
pub mod manifest;
pub mod merge;
pub mod pipeline;

pub use config::{VistuneConfig, load_config};
pub use derive::{DerivedValues, PixelBounds, gradient_accumulation_steps, pixel_bounds};
pub use error::VistuneError;
pub use finetune::FinetunePlan;
pub use launcher::{LaunchCommand, ProcessRunner, TokioRunner};
pub use merge::MergePlan;
pub use pipeline::Pipeline;
