//! Lightweight stand-ins for the neural collaborators
//!
//! Clones of a mock share their call records, so a test can keep one clone
//! and hand the other to a pipeline.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};

use crate::generator::NoiseGenerator;
use crate::models::{ForwardMode, ImageDecoder, ImageEncoder, NoisePredictor, PromptEncoder, SafetyChecker};

pub const EMBED_SEQ_LEN: usize = 77;
pub const EMBED_DIM: usize = 8;

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> crate::error::Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Encodes by 8x average pooling plus a mean channel; decodes by nearest
/// upsampling of the first three channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolingAutoencoder;

impl ImageEncoder for PoolingAutoencoder {
    fn encode(&self, pixels: &Tensor, _generator: &mut NoiseGenerator, _mode: ForwardMode) -> Result<Tensor> {
        let pooled = pixels.avg_pool2d(8)?;
        let mean = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &mean], 1)?)
    }
}

impl ImageDecoder for PoolingAutoencoder {
    fn decode(&self, latents: &Tensor, _mode: ForwardMode) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents.narrow(1, 0, 3)?.upsample_nearest2d(h * 8, w * 8)?)
    }
}

/// `0.5 * latents` shifted by the mean of each row's embeddings.
#[derive(Debug, Default, Clone)]
pub struct EmbeddingShiftPredictor {
    calls: Arc<Mutex<Vec<usize>>>,
}

impl EmbeddingShiftPredictor {
    /// Batch size of every call so far.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

impl NoisePredictor for EmbeddingShiftPredictor {
    fn in_channels(&self) -> usize {
        4
    }

    fn predict(
        &self,
        latents: &Tensor,
        _timestep: f64,
        encoder_hidden_states: &Tensor,
        _mode: ForwardMode,
    ) -> Result<Tensor> {
        let batch_size = latents.dim(0)?;
        if encoder_hidden_states.dim(0)? != batch_size {
            bail!(
                "embedding batch {} does not match latent batch {}",
                encoder_hidden_states.dim(0)?,
                batch_size
            );
        }
        self.calls.lock().unwrap().push(batch_size);

        let shift = encoder_hidden_states
            .flatten_from(1)?
            .mean_keepdim(1)?
            .reshape((batch_size, 1, 1, 1))?;
        Ok((latents * 0.5)?.broadcast_add(&shift)?)
    }
}

/// Deterministic embeddings derived from the prompt bytes; the empty prompt
/// encodes to zeros.
#[derive(Debug, Clone)]
pub struct BytePromptEncoder {
    device: Device,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Default for BytePromptEncoder {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            calls: Arc::default(),
        }
    }
}

impl BytePromptEncoder {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl PromptEncoder for BytePromptEncoder {
    fn encode(&self, prompts: &[String], _mode: ForwardMode) -> Result<Tensor> {
        self.calls.lock().unwrap().push(prompts.to_vec());

        let mut data = Vec::with_capacity(prompts.len() * EMBED_SEQ_LEN * EMBED_DIM);
        for prompt in prompts {
            let bytes = prompt.as_bytes();
            for i in 0..EMBED_SEQ_LEN * EMBED_DIM {
                let value = if bytes.is_empty() {
                    0.0
                } else {
                    (bytes[i % bytes.len()] as f32 / 255.0) - 0.5
                };
                data.push(value);
            }
        }
        Ok(Tensor::from_vec(data, (prompts.len(), EMBED_SEQ_LEN, EMBED_DIM), &self.device)?)
    }
}

/// Flags and blacks out the image at `index`.
#[derive(Debug, Clone, Copy)]
pub struct FlagIndexSafetyChecker {
    pub index: usize,
}

impl SafetyChecker for FlagIndexSafetyChecker {
    fn check(&self, images: &Tensor, _mode: ForwardMode) -> Result<(Tensor, Vec<bool>)> {
        let batch_size = images.dim(0)?;
        let flags: Vec<bool> = (0..batch_size).map(|i| i == self.index).collect();

        let rows = (0..batch_size)
            .map(|i| {
                let row = images.narrow(0, i, 1)?;
                if flags[i] {
                    row.zeros_like()
                } else {
                    Ok(row)
                }
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((Tensor::cat(&rows, 0)?.to_dtype(DType::F32)?, flags))
    }
}
