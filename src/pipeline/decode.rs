//! Latent decoding, safety screening and output conversion

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use image::RgbImage;
use log::{info, warn};

use super::latents::LATENT_SCALE;
use crate::config::OutputType;
use crate::error::{PipelineError, Result};
use crate::models::{ForwardMode, ImageDecoder, SafetyChecker};

/// Decoded images in the representation the caller asked for.
#[derive(Debug)]
pub enum GeneratedImages {
    Pil(Vec<RgbImage>),
    /// NHWC f32 in `[0, 1]`.
    Array(Tensor),
}

impl GeneratedImages {
    pub fn len(&self) -> usize {
        match self {
            GeneratedImages::Pil(images) => images.len(),
            GeneratedImages::Array(tensor) => tensor.dims().first().copied().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub images: GeneratedImages,
    /// One flag per image, in prompt order.
    pub nsfw_content_detected: Vec<bool>,
}

/// Map decoder output from `[-1, 1]` to `[0, 1]` and reorder to NHWC.
pub fn decoder_output_to_images(decoded: &Tensor) -> Result<Tensor> {
    let images = ((decoded.to_dtype(DType::F32)? / 2.0)? + 0.5)?;
    let images = images.clamp(0f32, 1f32)?;
    Ok(images.permute((0, 2, 3, 1))?.contiguous()?)
}

/// NHWC `[0, 1]` tensor to 8-bit RGB images.
pub fn to_rgb_images(images: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch_size, height, width, channels) = images.dims4()?;
    if channels != 3 {
        return Err(PipelineError::ShapeMismatch {
            what: "decoded images",
            expected: vec![batch_size, height, width, 3],
            got: images.dims().to_vec(),
        });
    }

    // Round to nearest before the truncating cast.
    let pixels = images.affine(255.0, 0.5)?.clamp(0f32, 255f32)?.to_dtype(DType::U8)?;

    let mut out = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let data = pixels.get(i)?.flatten_all()?.to_vec1::<u8>()?;
        let image = RgbImage::from_raw(width as u32, height as u32, data).ok_or(
            PipelineError::ShapeMismatch {
                what: "image buffer",
                expected: vec![height, width, 3],
                got: vec![height * width * 3],
            },
        )?;
        out.push(image);
    }
    Ok(out)
}

/// Decode the final latent, run the safety checker and convert to
/// `output_type`.
pub fn decode_latents(
    decoder: &dyn ImageDecoder,
    safety_checker: &dyn SafetyChecker,
    latents: &Tensor,
    output_type: OutputType,
) -> Result<PipelineOutput> {
    info!("Decoding latents...");
    let batch_size = latents.dim(0)?;

    let latents = (latents / LATENT_SCALE)?;
    let decoded = decoder.decode(&latents, ForwardMode::Inference)?;
    let images = decoder_output_to_images(&decoded)?;

    let (images, nsfw_content_detected) = safety_checker.check(&images, ForwardMode::Inference)?;
    if nsfw_content_detected.len() != batch_size {
        return Err(PipelineError::ShapeMismatch {
            what: "safety flags",
            expected: vec![batch_size],
            got: vec![nsfw_content_detected.len()],
        });
    }
    for (i, _) in nsfw_content_detected.iter().enumerate().filter(|(_, flagged)| **flagged) {
        warn!("Image {} was flagged by the safety checker", i);
    }

    let images = match output_type {
        OutputType::Pil => GeneratedImages::Pil(to_rgb_images(&images)?),
        OutputType::Array => GeneratedImages::Array(images),
    };

    Ok(PipelineOutput {
        images,
        nsfw_content_detected,
    })
}

/// Save images as `{prefix}_{index}.png` under `dir`.
pub fn save_images<P: AsRef<Path>>(images: &[RgbImage], dir: P, prefix: &str) -> anyhow::Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let path = dir.join(format!("{}_{}.png", prefix, i));
        image.save_with_format(&path, image::ImageFormat::Png)?;
        info!("Saved {}", path.display());
        paths.push(path);
    }
    Ok(paths)
}
