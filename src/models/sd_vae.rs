//! Image encoder/decoder contracts for the candle Stable Diffusion VAE

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;

use super::{ForwardMode, ImageDecoder, ImageEncoder};
use crate::generator::NoiseGenerator;

// The candle posterior draws its own noise, so the request generator is not
// used here and seeded image-to-image runs are only reproducible up to it.
impl ImageEncoder for AutoEncoderKL {
    fn encode(&self, pixels: &Tensor, _generator: &mut NoiseGenerator, mode: ForwardMode) -> Result<Tensor> {
        let posterior = AutoEncoderKL::encode(self, &mode.prepare(pixels))?;
        Ok(posterior.sample()?)
    }
}

impl ImageDecoder for AutoEncoderKL {
    fn decode(&self, latents: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        Ok(AutoEncoderKL::decode(self, &mode.prepare(latents))?)
    }
}
