//! The denoising loop
//!
//! Walks the integrator's schedule from `t_start` to the end, one guided
//! noise prediction and one integrator step per position. Each step consumes
//! the previous latent, so the loop is strictly sequential.

use candle_core::Tensor;
use log::{debug, info};

use super::guidance::GuidedNoisePredictor;
use super::latents::InitialLatents;
use crate::error::{PipelineError, Result};
use crate::generator::NoiseGenerator;
use crate::schedulers::{Scheduler, StepOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    /// Next schedule position to run.
    Running(usize),
    Completed,
}

pub struct SamplingLoop<'a> {
    scheduler: Box<dyn Scheduler>,
    predictor: GuidedNoisePredictor<'a>,
    text_embeddings: Tensor,
    latents: Tensor,
    t_start: usize,
    eta: f64,
    state: LoopState,
}

impl<'a> SamplingLoop<'a> {
    /// Fails with `ShapeMismatch` if the embeddings do not cover the latent
    /// batch (twice over when guidance is active).
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        predictor: GuidedNoisePredictor<'a>,
        text_embeddings: Tensor,
        init: InitialLatents,
        eta: f64,
    ) -> Result<Self> {
        let batch_size = init.latents.dims4()?.0;
        let expected_rows = if predictor.do_classifier_free_guidance() {
            batch_size * 2
        } else {
            batch_size
        };

        let embedding_dims = text_embeddings.dims();
        if embedding_dims.len() != 3 || embedding_dims[0] != expected_rows {
            let mut expected = embedding_dims.to_vec();
            expected.resize(3, 0);
            expected[0] = expected_rows;
            return Err(PipelineError::ShapeMismatch {
                what: "text embeddings",
                expected,
                got: embedding_dims.to_vec(),
            });
        }

        Ok(Self {
            scheduler,
            predictor,
            text_embeddings,
            latents: init.latents,
            t_start: init.t_start,
            eta,
            state: LoopState::NotStarted,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn latents(&self) -> &Tensor {
        &self.latents
    }

    /// Steps left before the loop completes.
    pub fn remaining_steps(&self) -> usize {
        let len = self.scheduler.timesteps().len();
        match self.state {
            LoopState::NotStarted => len.saturating_sub(self.t_start),
            LoopState::Running(index) => len.saturating_sub(index),
            LoopState::Completed => 0,
        }
    }

    /// Run one denoising step and return the new state.
    pub fn step(&mut self, generator: &mut NoiseGenerator) -> Result<LoopState> {
        let step_index = match self.state {
            LoopState::NotStarted => self.t_start,
            LoopState::Running(index) => index,
            LoopState::Completed => return Ok(LoopState::Completed),
        };

        let num_steps = self.scheduler.timesteps().len();
        if step_index >= num_steps {
            self.state = LoopState::Completed;
            return Ok(self.state);
        }

        let timestep = self.scheduler.timesteps()[step_index];
        let sigma = if self.scheduler.is_variance_exploding() {
            self.scheduler.sigma_at(step_index)
        } else {
            None
        };
        debug!("Step {}/{} (t={})", step_index + 1, num_steps, timestep);

        let noise_pred = self
            .predictor
            .predict(&self.latents, timestep, sigma, &self.text_embeddings)?;

        let options = StepOptions {
            eta: self.scheduler.kind().accepts_eta().then_some(self.eta),
            generator,
        };
        self.latents = self
            .scheduler
            .step(&noise_pred, step_index, &self.latents, options)?;

        self.state = if step_index + 1 < num_steps {
            LoopState::Running(step_index + 1)
        } else {
            LoopState::Completed
        };
        Ok(self.state)
    }

    /// Run to completion and return the final latent.
    pub fn run(mut self, generator: &mut NoiseGenerator) -> Result<Tensor> {
        let total = self.remaining_steps();
        info!("Running denoising loop ({} steps)...", total);

        #[cfg(feature = "progress-bar")]
        let progress = indicatif::ProgressBar::new(total as u64);

        while self.step(generator)? != LoopState::Completed {
            #[cfg(feature = "progress-bar")]
            progress.inc(1);
        }

        #[cfg(feature = "progress-bar")]
        progress.finish_and_clear();

        Ok(self.latents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::latents::noise_latents;
    use crate::schedulers::{NoiseScheduleConfig, SchedulerKind};
    use crate::test_utils::{max_abs_diff, EmbeddingShiftPredictor};
    use candle_core::{DType, Device};

    fn setup(
        kind: SchedulerKind,
        steps: usize,
        seed: u64,
    ) -> Result<(Box<dyn Scheduler>, InitialLatents)> {
        let scheduler = kind.build(&NoiseScheduleConfig::default(), steps);
        let init = noise_latents(scheduler.as_ref(), 1, 4, 32, 32, &mut NoiseGenerator::new(seed), &Device::Cpu)?;
        Ok((scheduler, init))
    }

    fn embeddings(rows: usize) -> Result<Tensor> {
        Ok(NoiseGenerator::new(77).randn(&[rows, 7, 16], &Device::Cpu)?)
    }

    #[test]
    fn test_state_transitions() -> Result<()> {
        let predictor = EmbeddingShiftPredictor::default();
        let (scheduler, init) = setup(SchedulerKind::Ddim, 3, 0)?;
        let mut sampling = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 1.0), embeddings(1)?, init, 0.0)?;
        let mut generator = NoiseGenerator::new(0);

        assert_eq!(sampling.state(), LoopState::NotStarted);
        assert_eq!(sampling.remaining_steps(), 3);
        assert_eq!(sampling.step(&mut generator)?, LoopState::Running(1));
        assert_eq!(sampling.step(&mut generator)?, LoopState::Running(2));
        assert_eq!(sampling.step(&mut generator)?, LoopState::Completed);
        assert_eq!(sampling.step(&mut generator)?, LoopState::Completed);
        assert_eq!(predictor.calls().len(), 3);
        Ok(())
    }

    #[test]
    fn test_exhausted_schedule_completes_without_prediction() -> Result<()> {
        let predictor = EmbeddingShiftPredictor::default();
        let (scheduler, mut init) = setup(SchedulerKind::Ddim, 5, 0)?;
        init.t_start = 5;
        let before = init.latents.clone();

        let sampling = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 1.0), embeddings(1)?, init, 0.0)?;
        let latents = sampling.run(&mut NoiseGenerator::new(0))?;
        assert!(predictor.calls().is_empty());
        assert_eq!(max_abs_diff(&latents, &before)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_guided_run_is_deterministic() -> Result<()> {
        let mut finals = Vec::new();
        for _ in 0..2 {
            let predictor = EmbeddingShiftPredictor::default();
            let (scheduler, init) = setup(SchedulerKind::Ddim, 8, 42)?;
            let sampling = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 7.5), embeddings(2)?, init, 0.5)?;
            let latents = sampling.run(&mut NoiseGenerator::new(42))?;
            finals.push(latents.flatten_all()?.to_vec1::<f32>()?);
        }
        assert_eq!(finals[0], finals[1]);
        Ok(())
    }

    #[test]
    fn test_lms_walk_passes_fractional_timesteps() -> Result<()> {
        let predictor = EmbeddingShiftPredictor::default();
        let (scheduler, init) = setup(SchedulerKind::LmsDiscrete, 6, 1)?;
        let sampling = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 7.5), embeddings(2)?, init, 0.0)?;
        let latents = sampling.run(&mut NoiseGenerator::new(1))?;

        assert_eq!(predictor.calls(), vec![2; 6]);
        let values: Vec<f32> = latents.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_embedding_batch_mismatch_fails_before_loop() -> Result<()> {
        let predictor = EmbeddingShiftPredictor::default();
        let (scheduler, init) = setup(SchedulerKind::Pndm, 4, 0)?;
        // Guidance needs two rows per latent.
        let result = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 7.5), embeddings(1)?, init, 0.0);
        assert!(matches!(result, Err(PipelineError::ShapeMismatch { .. })));
        assert!(predictor.calls().is_empty());

        let (scheduler, init) = setup(SchedulerKind::Pndm, 4, 0)?;
        let flat = Tensor::zeros((1, 16), DType::F32, &Device::Cpu)?;
        let result = SamplingLoop::new(scheduler, GuidedNoisePredictor::new(&predictor, 1.0), flat, init, 0.0);
        assert!(matches!(result, Err(PipelineError::ShapeMismatch { .. })));
        Ok(())
    }
}
