//! Prompt encoding: tokenization followed by the text encoder session.
use tch::Tensor;

use super::session::{InferenceSession, NamedInput};
use crate::error::{Error, Result};
use crate::tensor_ops::{create_int_tensor, expect_dims};
use crate::transformers::Tokenize;

pub const INPUT_IDS: &str = "input_ids";

pub struct TextProcessor {
    tokenizer: Box<dyn Tokenize>,
    session: Box<dyn InferenceSession>,
    hidden_size: i64,
}

impl TextProcessor {
    pub fn new(
        tokenizer: Box<dyn Tokenize>,
        session: Box<dyn InferenceSession>,
        hidden_size: i64,
    ) -> Self {
        Self { tokenizer, session, hidden_size }
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    pub fn sequence_length(&self) -> i64 {
        self.tokenizer.max_length() as i64
    }

    /// Returns the `[1, N]` int64 token ids for `text`.
    pub fn tokenize(&self, text: &str) -> Result<Tensor> {
        if text.trim().is_empty() {
            return Err(Error::config("prompt cannot be empty"));
        }
        let ids = self.tokenizer.encode(text)?;
        create_int_tensor(&ids, &[1, self.sequence_length()])
    }

    /// Runs the text encoder on token ids, producing a `[1, N, hidden]` embedding.
    pub fn encode_ids(&self, ids: &Tensor) -> Result<Tensor> {
        let n = self.sequence_length();
        expect_dims("token ids", ids, &[1, n])?;
        let embedding = self.session.run(&[NamedInput::new(INPUT_IDS, ids)])?;
        expect_dims("text embedding", &embedding, &[1, n, self.hidden_size])?;
        tracing::debug!(dims = ?embedding.size(), "encoded prompt");
        Ok(embedding)
    }

    pub fn process_text(&self, text: &str) -> Result<Tensor> {
        let ids = self.tokenize(text)?;
        self.encode_ids(&ids)
    }
}
