//! # Text-to-image diffusion pipeline
//!
//! Stable Diffusion inference in Rust over TorchScript checkpoints, using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs). The schedulers follow Hugging Face's
//! [diffusers](https://github.com/huggingface/diffusers) Python api.
//!
//! This library includes:
//! - A CLIP tokenizer and the text encoder, unet and vae decoder wrappers.
//! - A linear multistep and an ancestral Euler scheduler.
//! - A generation pipeline with classifier-free guidance, progress reporting and
//!   cooperative cancellation.
//!
//! The checkpoints are TorchScript exports of the Python models, see the
//! `stable-diffusion` demo for the expected layout.

pub mod config;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod tensor_ops;
pub mod transformers;
pub mod utils;

pub use config::{ExecutionTarget, GenerationParams, PipelineConfig, SchedulerKind};
pub use error::{Error, ErrorKind, Result};
pub use models::vae::GeneratedImage;
pub use pipelines::registry::ModelRegistry;
pub use pipelines::stable_diffusion::{
    CancellationToken, GenerationRequest, GenerationResult, Phase, Progress,
    StableDiffusionPipeline,
};
