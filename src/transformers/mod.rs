//! # Transformers
//!
//! Prompt tokenization, turning user text into the fixed-length id sequence
//! the text encoder consumes.
use crate::error::Result;

pub mod clip;

/// Converts text to a sequence of exactly `max_length()` token ids.
pub trait Tokenize: Send + Sync {
    /// Starts with the start-of-text id, ends with the end-of-text id, and is
    /// right-padded. Longer inputs are truncated.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    fn max_length(&self) -> usize;
}
