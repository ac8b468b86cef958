//! Text-to-image and image-to-image generation
//!
//! `StableDiffusionPipeline::generate` validates the request, encodes the
//! prompts, prepares the initial latent, walks the denoising loop and decodes
//! the result. The pipeline holds no per-request state, so one instance can
//! serve independent requests.

pub mod decode;
pub mod guidance;
pub mod latents;
pub mod preprocess;
pub mod sampling;

pub use decode::{GeneratedImages, PipelineOutput};
pub use guidance::GuidedNoisePredictor;
pub use latents::{InitImage, InitialLatents, LATENT_SCALE};
pub use sampling::{LoopState, SamplingLoop};

use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use log::{info, warn};

use crate::config::{parse_device, GenerationConfig};
use crate::error::{PipelineError, Result};
use crate::generator::NoiseGenerator;
use crate::models::{
    ClipPromptEncoder, ForwardMode, ImageDecoder, ImageEncoder, NoisePredictor, PassthroughSafetyChecker,
    PromptEncoder, SafetyChecker, SdUNet,
};
use crate::schedulers::NoiseScheduleConfig;

pub struct StableDiffusionPipeline {
    prompt_encoder: Box<dyn PromptEncoder>,
    image_encoder: Box<dyn ImageEncoder>,
    image_decoder: Box<dyn ImageDecoder>,
    noise_predictor: Box<dyn NoisePredictor>,
    safety_checker: Box<dyn SafetyChecker>,
    schedule: NoiseScheduleConfig,
    device: Device,
}

impl StableDiffusionPipeline {
    /// The collaborators are expected to already live on `device`.
    pub fn new(
        prompt_encoder: Box<dyn PromptEncoder>,
        image_encoder: Box<dyn ImageEncoder>,
        image_decoder: Box<dyn ImageDecoder>,
        noise_predictor: Box<dyn NoisePredictor>,
        safety_checker: Box<dyn SafetyChecker>,
        device: Device,
    ) -> Self {
        Self {
            prompt_encoder,
            image_encoder,
            image_decoder,
            noise_predictor,
            safety_checker,
            schedule: NoiseScheduleConfig::default(),
            device,
        }
    }

    /// Pipeline over the candle Stable Diffusion models, without a safety
    /// classifier.
    pub fn from_candle(clip: ClipPromptEncoder, vae: AutoEncoderKL, unet: SdUNet, device: Device) -> Self {
        let vae = Arc::new(vae);
        Self::new(
            Box::new(clip),
            Box::new(vae.clone()),
            Box::new(vae),
            Box::new(unet),
            Box::new(PassthroughSafetyChecker),
            device,
        )
    }

    /// Replace the training noise schedule; fails with `Config` if the
    /// integrators cannot be built from it.
    pub fn with_schedule(mut self, schedule: NoiseScheduleConfig) -> Result<Self> {
        schedule.validate()?;
        self.schedule = schedule;
        Ok(self)
    }

    pub fn with_safety_checker(mut self, safety_checker: Box<dyn SafetyChecker>) -> Self {
        self.safety_checker = safety_checker;
        self
    }

    /// Bind the pipeline to `device`; latents and seed images are created
    /// there from now on.
    pub fn to(&mut self, device: Device) -> &mut Self {
        self.device = device;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn generate(
        &self,
        config: &GenerationConfig,
        init_image: Option<InitImage>,
        generator: &mut NoiseGenerator,
    ) -> Result<PipelineOutput> {
        let prompt = config.validate(init_image.is_some())?;
        let output_type = config.output_type()?;
        let kind = config.scheduler_kind()?;

        let device = match &config.torch_device {
            Some(name) => {
                warn!(
                    "`torch_device` is deprecated and will be removed; \
                     bind the pipeline with `StableDiffusionPipeline::to` instead"
                );
                parse_device(name.as_deref())?
            }
            None => self.device.clone(),
        };

        // Seed image problems are input errors, so surface them before any model runs.
        let pixels = match init_image {
            Some(InitImage::Image(image)) => Some(preprocess::preprocess(&image, config.init_max_pixels, &device)?),
            Some(InitImage::Tensor(tensor)) => Some(checked_pixels(tensor, &device)?),
            None => None,
        };

        let batch_size = prompt.batch_size();
        info!("Encoding {} prompt(s)...", batch_size);
        let cond = self.prompt_encoder.encode(prompt.texts(), ForwardMode::Inference)?;
        let text_embeddings = if config.do_classifier_free_guidance() {
            let uncond = self
                .prompt_encoder
                .encode(&prompt.unconditional(), ForwardMode::Inference)?;
            guidance::concat_embeddings(&uncond, &cond)?
        } else {
            cond
        };

        let scheduler = kind.build(&self.schedule, config.num_inference_steps);

        info!("Preparing latents ({:?} scheduler)...", kind);
        let init = match &pixels {
            Some(pixels) => latents::image_latents(
                scheduler.as_ref(),
                self.image_encoder.as_ref(),
                pixels,
                batch_size,
                config.num_inference_steps,
                config.init_strength,
                generator,
            )?,
            None => latents::noise_latents(
                scheduler.as_ref(),
                batch_size,
                self.noise_predictor.in_channels(),
                config.height,
                config.width,
                generator,
                &device,
            )?,
        };

        let predictor = GuidedNoisePredictor::new(self.noise_predictor.as_ref(), config.guidance_scale);
        let latents = SamplingLoop::new(scheduler, predictor, text_embeddings, init, config.eta)?.run(generator)?;

        let output = decode::decode_latents(
            self.image_decoder.as_ref(),
            self.safety_checker.as_ref(),
            &latents,
            output_type,
        )?;
        info!("Generated {} image(s)", output.images.len());
        Ok(output)
    }
}

/// Accept a caller-encoded `(1, 3, H, W)` pixel tensor as the seed image.
fn checked_pixels(tensor: Tensor, device: &Device) -> Result<Tensor> {
    match tensor.dims() {
        [1, 3, h, w] if *h > 0 && *w > 0 => Ok(tensor.to_device(device)?),
        dims => Err(PipelineError::ShapeMismatch {
            what: "seed image tensor",
            expected: vec![1, 3, 0, 0],
            got: dims.to_vec(),
        }),
    }
}
