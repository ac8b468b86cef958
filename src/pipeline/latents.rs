//! Initial latents for text-to-image and image-to-image generation

use candle_core::{Device, Tensor};
use image::DynamicImage;
use log::debug;

use crate::error::Result;
use crate::generator::NoiseGenerator;
use crate::models::{ForwardMode, ImageEncoder};
use crate::schedulers::Scheduler;

/// Empirical normalization factor of the SD 1.x VAE latent space.
pub const LATENT_SCALE: f64 = 0.18215;

/// Seed image for image-to-image generation.
pub enum InitImage {
    /// Any color image; preprocessed before encoding.
    Image(DynamicImage),
    /// Pixel tensor `(1, 3, H, W)` in `[-1, 1]`, encoded as-is.
    Tensor(Tensor),
}

/// Starting latent plus the schedule position the loop starts at.
#[derive(Debug)]
pub struct InitialLatents {
    pub latents: Tensor,
    pub t_start: usize,
}

/// Number of trailing schedule entries re-walked for a seed image.
pub fn init_timestep(num_inference_steps: usize, init_strength: f64, offset: usize) -> usize {
    let init_timestep = (num_inference_steps as f64 * init_strength) as usize + offset;
    init_timestep.min(num_inference_steps)
}

/// First schedule position walked for a seed image, clamped to the schedule.
pub fn start_step(num_inference_steps: usize, init_timestep: usize, offset: usize, schedule_len: usize) -> usize {
    (num_inference_steps + offset)
        .saturating_sub(init_timestep)
        .min(schedule_len)
}

/// Pure-noise latent of shape `(batch, channels, height / 8, width / 8)`.
///
/// Variance-exploding integrators get the noise scaled by their first sigma.
pub fn noise_latents(
    scheduler: &dyn Scheduler,
    batch_size: usize,
    in_channels: usize,
    height: usize,
    width: usize,
    generator: &mut NoiseGenerator,
    device: &Device,
) -> Result<InitialLatents> {
    let shape = [batch_size, in_channels, height / 8, width / 8];
    let latents = generator.randn(&shape, device)?;

    let latents = if scheduler.is_variance_exploding() {
        (latents * scheduler.init_noise_sigma())?
    } else {
        latents
    };

    Ok(InitialLatents { latents, t_start: 0 })
}

/// Encode a preprocessed seed image and noise it to the level matching
/// `init_strength`.
pub fn image_latents(
    scheduler: &dyn Scheduler,
    encoder: &dyn ImageEncoder,
    pixels: &Tensor,
    batch_size: usize,
    num_inference_steps: usize,
    init_strength: f64,
    generator: &mut NoiseGenerator,
) -> Result<InitialLatents> {
    let encoded = encoder.encode(pixels, generator, ForwardMode::Inference)?;
    let encoded = (encoded * LATENT_SCALE)?;
    let init_latents = encoded.repeat((batch_size, 1, 1, 1))?;

    let offset = scheduler.kind().offset();
    let init_timestep = init_timestep(num_inference_steps, init_strength, offset);
    let schedule_len = scheduler.timesteps().len();
    let noise_index = schedule_len.saturating_sub(init_timestep);
    let t_start = start_step(num_inference_steps, init_timestep, offset, schedule_len);
    debug!(
        "Seed image: init_timestep={} noise_index={} t_start={}",
        init_timestep, noise_index, t_start
    );

    let noise = generator.randn_like(&init_latents)?;
    let latents = if init_timestep == 0 {
        init_latents
    } else {
        scheduler.add_noise(&init_latents, &noise, noise_index)?
    };

    Ok(InitialLatents { latents, t_start })
}
