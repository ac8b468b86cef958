//! Seed image preprocessing for image-to-image generation

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::{PipelineError, Result};

pub const DEFAULT_MAX_PIXELS: u64 = 262_144;

/// The image encoder downsamples by a stride that needs this alignment.
const DIMENSION_MULTIPLE: u32 = 64;

/// Scale `image` down so it has at most `max_pixels` pixels, keeping its
/// aspect ratio. Images already within budget are returned unchanged.
pub fn scale_image(image: DynamicImage, max_pixels: u64) -> DynamicImage {
    let (w, h) = image.dimensions();
    let area = w as f64 * h as f64;
    if area == 0.0 {
        return image;
    }

    let scale = (max_pixels as f64 / area).sqrt();
    if scale < 1.0 {
        let new_w = ((w as f64 * scale) as u32).max(1);
        let new_h = ((h as f64 * scale) as u32).max(1);
        image.resize_exact(new_w, new_h, FilterType::Lanczos3)
    } else {
        image
    }
}

/// Turn a user image into a `(1, 3, H, W)` tensor in `[-1, 1]` with `H` and
/// `W` multiples of 64 and `H * W <= max_pixels`.
pub fn preprocess(image: &DynamicImage, max_pixels: u64, device: &Device) -> Result<Tensor> {
    let (orig_w, orig_h) = image.dimensions();

    // Drop any alpha channel.
    let image = DynamicImage::ImageRgb8(image.to_rgb8());
    let image = scale_image(image, max_pixels);

    let (w, h) = image.dimensions();
    let (w, h) = (w - w % DIMENSION_MULTIPLE, h - h % DIMENSION_MULTIPLE);
    if w == 0 || h == 0 {
        return Err(PipelineError::DegenerateImage {
            width: orig_w,
            height: orig_h,
        });
    }

    let image = if image.dimensions() != (w, h) {
        image.resize_exact(w, h, FilterType::Lanczos3)
    } else {
        image
    };

    let data = image.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?
        .unsqueeze(0)?;

    Ok(tensor)
}
