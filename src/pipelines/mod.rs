//! # Pipelines

pub mod registry;
pub mod stable_diffusion;
