//! CLIP prompt encoder
//!
//! Tokenizes with a `tokenizers` CLIP tokenizer, pads every prompt to a fixed
//! length and runs the candle CLIP text transformer on the whole batch.

use anyhow::{Context, Result};
use candle_core::{Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use tokenizers::Tokenizer;

use super::{ForwardMode, PromptEncoder};

const END_OF_TEXT: &str = "<|endoftext|>";

pub struct ClipPromptEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_length: usize,
    pad_id: u32,
    eos_id: u32,
    device: Device,
}

impl ClipPromptEncoder {
    /// `max_length` is the tokenizer's model length, 77 for SD 1.x.
    pub fn new(tokenizer: Tokenizer, model: ClipTextTransformer, max_length: usize, device: Device) -> Result<Self> {
        let eos_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .with_context(|| format!("tokenizer has no {} token", END_OF_TEXT))?;

        Ok(Self {
            tokenizer,
            model,
            max_length,
            pad_id: eos_id,
            eos_id,
            device,
        })
    }

    /// Pad with a different token, e.g. `!` for the SD 2.x text encoder.
    pub fn with_pad_token(mut self, token: &str) -> Result<Self> {
        self.pad_id = self
            .tokenizer
            .token_to_id(token)
            .with_context(|| format!("tokenizer has no {} token", token))?;
        Ok(self)
    }

    /// Token ids padded or truncated to `max_length`.
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize prompt: {}", e))?;

        Ok(pad_tokens(encoding.get_ids().to_vec(), self.max_length, self.pad_id, self.eos_id))
    }
}

fn pad_tokens(mut tokens: Vec<u32>, max_length: usize, pad_id: u32, eos_id: u32) -> Vec<u32> {
    if tokens.len() > max_length {
        tokens.truncate(max_length);
        if let Some(last) = tokens.last_mut() {
            *last = eos_id;
        }
    }
    tokens.resize(max_length, pad_id);
    tokens
}

impl PromptEncoder for ClipPromptEncoder {
    fn encode(&self, prompts: &[String], mode: ForwardMode) -> Result<Tensor> {
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let tokens = self.tokenize(prompt)?;
            rows.push(Tensor::new(tokens.as_slice(), &self.device)?);
        }

        let input_ids = mode.prepare(&Tensor::stack(&rows, 0)?);
        Ok(self.model.forward(&input_ids)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_tokens_pads_short_prompts() {
        assert_eq!(pad_tokens(vec![1, 5, 2], 6, 0, 2), vec![1, 5, 2, 0, 0, 0]);
    }

    #[test]
    fn test_pad_tokens_truncates_and_keeps_eos() {
        assert_eq!(pad_tokens(vec![1, 5, 6, 7, 8, 2], 4, 0, 2), vec![1, 5, 6, 2]);
    }
}
