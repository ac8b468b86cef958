//! Contracts for the neural collaborators driven by the pipeline
//!
//! The pipeline never looks inside these models. Each trait is the narrow
//! surface the sampling loop needs; adapters for the candle Stable Diffusion
//! models live in the submodules. Collaborators are `Send + Sync` so one
//! pipeline can serve requests from several threads.

pub mod clip_encoder;
pub mod sd_unet;
pub mod sd_vae;

pub use clip_encoder::ClipPromptEncoder;
pub use sd_unet::SdUNet;

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::generator::NoiseGenerator;

/// Whether a forward pass may record gradients.
///
/// Sampling always runs with `Inference`; adapters detach their inputs so no
/// autograd graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Inference,
    Training,
}

impl ForwardMode {
    pub fn prepare(self, tensor: &Tensor) -> Tensor {
        match self {
            ForwardMode::Inference => tensor.detach(),
            ForwardMode::Training => tensor.clone(),
        }
    }
}

/// Text to `(batch, sequence_length, hidden_dim)` embeddings.
pub trait PromptEncoder: Send + Sync {
    fn encode(&self, prompts: &[String], mode: ForwardMode) -> Result<Tensor>;
}

/// Pixel tensor `(b, 3, H, W)` in `[-1, 1]` to an unscaled latent sample.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, pixels: &Tensor, generator: &mut NoiseGenerator, mode: ForwardMode) -> Result<Tensor>;
}

/// Unscaled latent to a pixel tensor `(b, 3, H, W)` in roughly `[-1, 1]`.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, latents: &Tensor, mode: ForwardMode) -> Result<Tensor>;
}

// One autoencoder usually serves as both encoder and decoder.
impl<T: ImageEncoder + ?Sized> ImageEncoder for Arc<T> {
    fn encode(&self, pixels: &Tensor, generator: &mut NoiseGenerator, mode: ForwardMode) -> Result<Tensor> {
        (**self).encode(pixels, generator, mode)
    }
}

impl<T: ImageDecoder + ?Sized> ImageDecoder for Arc<T> {
    fn decode(&self, latents: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        (**self).decode(latents, mode)
    }
}

/// The noise-prediction network.
pub trait NoisePredictor: Send + Sync {
    /// Latent channels the network expects.
    fn in_channels(&self) -> usize;

    /// Inputs are cast to this dtype before the forward pass.
    fn dtype(&self) -> DType {
        DType::F32
    }

    fn predict(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        mode: ForwardMode,
    ) -> Result<Tensor>;
}

/// Content-safety classifier over decoded images.
///
/// Receives NHWC f32 images in `[0, 1]` and returns the images, redacted
/// according to the classifier's own policy, with one flag per image.
pub trait SafetyChecker: Send + Sync {
    fn check(&self, images: &Tensor, mode: ForwardMode) -> Result<(Tensor, Vec<bool>)>;
}

/// Safety checker that flags nothing, for callers without a classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSafetyChecker;

impl SafetyChecker for PassthroughSafetyChecker {
    fn check(&self, images: &Tensor, _mode: ForwardMode) -> Result<(Tensor, Vec<bool>)> {
        let batch_size = images.dim(0)?;
        Ok((images.clone(), vec![false; batch_size]))
    }
}
