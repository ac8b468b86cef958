//! DDIM integrator
//!
//! Deterministic for `eta = 0`; positive `eta` adds noise drawn from the
//! request generator at every step.

use candle_core::Tensor;

use super::{add_noise_alpha, NoiseScheduleConfig, Scheduler, SchedulerKind, StepOptions};
use crate::error::Result;

pub struct DdimScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    num_train_timesteps: usize,
    num_inference_steps: usize,
    timesteps: Vec<f64>,
}

impl DdimScheduler {
    pub fn new(config: &NoiseScheduleConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        // set_alpha_to_one = false
        let final_alpha_cumprod = alphas_cumprod[0];

        Self {
            alphas_cumprod,
            final_alpha_cumprod,
            num_train_timesteps: config.num_train_timesteps,
            num_inference_steps: 0,
            timesteps: Vec::new(),
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize, offset: usize) {
        let step_ratio = self.step_ratio_for(num_inference_steps);
        self.num_inference_steps = num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .rev()
            .map(|i| (i * step_ratio + offset) as f64)
            .collect();
    }

    fn step_ratio_for(&self, num_inference_steps: usize) -> usize {
        self.num_train_timesteps / num_inference_steps.max(1)
    }

    fn alpha_at(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(self.alphas_cumprod.len() - 1)]
    }
}

impl Scheduler for DdimScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Ddim
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn sigma_at(&self, _step_index: usize) -> Option<f64> {
        None
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, schedule_index: usize) -> Result<Tensor> {
        match self.timesteps.get(schedule_index) {
            Some(&timestep) => add_noise_alpha(original, noise, self.alpha_at(timestep as usize)),
            None => Ok(original.clone()),
        }
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        options: StepOptions<'_>,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[step_index] as usize;
        let prev_timestep = timestep as i64 - self.step_ratio_for(self.num_inference_steps) as i64;

        let alpha_prod_t = self.alpha_at(timestep);
        let alpha_prod_t_prev = if prev_timestep >= 0 {
            self.alpha_at(prev_timestep as usize)
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        // x_0 = (x_t - sqrt(beta_t) * eps) / sqrt(alpha_t)
        let pred_original_sample =
            ((sample - (model_output * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?;

        let eta = options.eta.unwrap_or(0.0);
        let variance = (beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = eta * variance.max(0.0).sqrt();

        let direction_coeff = (1.0 - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.0).sqrt();
        let pred_sample_direction = (model_output * direction_coeff)?;

        // x_t-1 = sqrt(alpha_t-1) * x_0 + sqrt(1 - alpha_t-1 - std^2) * eps + std * z
        let prev_sample = ((pred_original_sample * alpha_prod_t_prev.sqrt())? + pred_sample_direction)?;

        if std_dev_t > 0.0 {
            let variance_noise = options.generator.randn_like(model_output)?;
            Ok((prev_sample + (variance_noise * std_dev_t)?)?)
        } else {
            Ok(prev_sample)
        }
    }
}
