//! # Models
//!
//! The three networks used in a diffusion loop, each wrapping an inference
//! session with the shape checks of its inputs and outputs.

pub mod session;
pub mod text_encoder;
pub mod unet;
pub mod vae;
