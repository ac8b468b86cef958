//! Classifier-free guidance around the noise predictor
//!
//! With guidance active the conditional and unconditional branches run as
//! one doubled batch, embeddings ordered `[unconditional; conditional]`.

use candle_core::Tensor;

use crate::error::{PipelineError, Result};
use crate::models::{ForwardMode, NoisePredictor};

/// `uncond + scale * (cond - uncond)`
pub fn combine_guidance(uncond: &Tensor, cond: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let diff = (cond - uncond)?;
    Ok((uncond + (diff * guidance_scale)?)?)
}

/// Concatenate `[uncond; cond]` after checking both share sequence length
/// and hidden size.
pub fn concat_embeddings(uncond: &Tensor, cond: &Tensor) -> Result<Tensor> {
    let (_, cond_seq, cond_hidden) = cond.dims3()?;
    let (uncond_batch, uncond_seq, uncond_hidden) = uncond.dims3()?;
    if (uncond_seq, uncond_hidden) != (cond_seq, cond_hidden) {
        return Err(PipelineError::ShapeMismatch {
            what: "unconditional embeddings",
            expected: vec![uncond_batch, cond_seq, cond_hidden],
            got: uncond.dims().to_vec(),
        });
    }

    Ok(Tensor::cat(&[uncond, cond], 0)?)
}

pub struct GuidedNoisePredictor<'a> {
    predictor: &'a dyn NoisePredictor,
    guidance_scale: f64,
}

impl<'a> GuidedNoisePredictor<'a> {
    pub fn new(predictor: &'a dyn NoisePredictor, guidance_scale: f64) -> Self {
        Self {
            predictor,
            guidance_scale,
        }
    }

    pub fn do_classifier_free_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    /// Noise prediction shaped like `latents`.
    ///
    /// `text_embeddings` holds `[uncond; cond]` when guidance is active and
    /// only the conditional rows otherwise. `sigma` is set for
    /// variance-exploding integrators and rescales the network input only.
    pub fn predict(
        &self,
        latents: &Tensor,
        timestep: f64,
        sigma: Option<f64>,
        text_embeddings: &Tensor,
    ) -> Result<Tensor> {
        let guided = self.do_classifier_free_guidance();

        let latent_model_input = if guided {
            Tensor::cat(&[latents, latents], 0)?
        } else {
            latents.clone()
        };

        // Continuous-ODE input scaling for sigma-based integrators
        let latent_model_input = match sigma {
            Some(sigma) => (latent_model_input / (sigma * sigma + 1.0).sqrt())?,
            None => latent_model_input,
        };
        let latent_model_input = latent_model_input.to_dtype(self.predictor.dtype())?;

        let noise_pred = self
            .predictor
            .predict(&latent_model_input, timestep, text_embeddings, ForwardMode::Inference)?
            .to_dtype(latents.dtype())?;

        if guided {
            let batch_size = latents.dim(0)?;
            let noise_pred_uncond = noise_pred.narrow(0, 0, batch_size)?;
            let noise_pred_text = noise_pred.narrow(0, batch_size, batch_size)?;
            combine_guidance(&noise_pred_uncond, &noise_pred_text, self.guidance_scale)
        } else {
            Ok(noise_pred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::NoiseGenerator;
    use crate::test_utils::{max_abs_diff, EmbeddingShiftPredictor};
    use candle_core::Device;

    fn inputs() -> Result<(Tensor, Tensor, Tensor)> {
        let device = Device::Cpu;
        let mut generator = NoiseGenerator::new(21);
        let latents = generator.randn(&[2, 4, 8, 8], &device)?;
        let cond = generator.randn(&[2, 7, 16], &device)?;
        let uncond = Tensor::zeros((2, 7, 16), candle_core::DType::F32, &device)?;
        Ok((latents, cond, uncond))
    }

    #[test]
    fn test_combine_guidance() -> Result<()> {
        let device = Device::Cpu;
        let uncond = Tensor::new(&[1f32, 2.0], &device)?;
        let cond = Tensor::new(&[3f32, 2.0], &device)?;
        let out = combine_guidance(&uncond, &cond, 7.5)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![16.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_scale_one_is_conditional_only() -> Result<()> {
        let (latents, cond, _) = inputs()?;
        let predictor = EmbeddingShiftPredictor::default();
        let guided = GuidedNoisePredictor::new(&predictor, 1.0);

        let out = guided.predict(&latents, 500.0, None, &cond)?;
        assert_eq!(predictor.calls(), vec![2]);

        let direct = predictor.predict(&latents, 500.0, &cond, ForwardMode::Inference)?;
        assert_eq!(max_abs_diff(&out, &direct)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_guided_prediction_uses_one_doubled_call() -> Result<()> {
        let (latents, cond, uncond) = inputs()?;
        let predictor = EmbeddingShiftPredictor::default();
        let guided = GuidedNoisePredictor::new(&predictor, 7.5);

        let embeddings = concat_embeddings(&uncond, &cond)?;
        let out = guided.predict(&latents, 500.0, None, &embeddings)?;
        assert_eq!(predictor.calls(), vec![4]);
        assert_eq!(out.dims(), latents.dims());

        let pred_uncond = predictor.predict(&latents, 500.0, &uncond, ForwardMode::Inference)?;
        let pred_cond = predictor.predict(&latents, 500.0, &cond, ForwardMode::Inference)?;
        let expected = combine_guidance(&pred_uncond, &pred_cond, 7.5)?;
        assert!(max_abs_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_sigma_rescales_network_input_only() -> Result<()> {
        let (latents, cond, _) = inputs()?;
        let predictor = EmbeddingShiftPredictor::default();
        let guided = GuidedNoisePredictor::new(&predictor, 1.0);

        let sigma = 3.0f64;
        let out = guided.predict(&latents, 10.0, Some(sigma), &cond)?;

        let scaled = (&latents / (sigma * sigma + 1.0).sqrt())?;
        let expected = predictor.predict(&scaled, 10.0, &cond, ForwardMode::Inference)?;
        assert!(max_abs_diff(&out, &expected)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_concat_embeddings_order_and_mismatch() -> Result<()> {
        let (_, cond, uncond) = inputs()?;
        let embeddings = concat_embeddings(&uncond, &cond)?;
        assert_eq!(embeddings.dims(), &[4, 7, 16]);
        assert_eq!(max_abs_diff(&embeddings.narrow(0, 0, 2)?, &uncond)?, 0.0);
        assert_eq!(max_abs_diff(&embeddings.narrow(0, 2, 2)?, &cond)?, 0.0);

        let short = Tensor::zeros((2, 5, 16), candle_core::DType::F32, &Device::Cpu)?;
        let err = concat_embeddings(&short, &cond).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        Ok(())
    }
}
