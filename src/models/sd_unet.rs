//! Noise predictor contract for the candle SD UNet

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;

use super::{ForwardMode, NoisePredictor};

/// UNet plus the metadata the pipeline needs but the model does not expose.
pub struct SdUNet {
    unet: UNet2DConditionModel,
    in_channels: usize,
    dtype: DType,
}

impl SdUNet {
    pub fn new(unet: UNet2DConditionModel, in_channels: usize, dtype: DType) -> Self {
        Self { unet, in_channels, dtype }
    }
}

impl NoisePredictor for SdUNet {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn predict(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        mode: ForwardMode,
    ) -> Result<Tensor> {
        let encoder_hidden_states = mode.prepare(encoder_hidden_states).to_dtype(self.dtype)?;
        Ok(self
            .unet
            .forward(&mode.prepare(latents), timestep, &encoder_hidden_states)?)
    }
}
