//! PNDM integrator, pseudo linear multistep (PLMS) steps only
//!
//! The Runge-Kutta warm-up is skipped: the first step is an Euler step which
//! is corrected on the repeated second timestep, after which up to four past
//! noise predictions are combined with Adams-Bashforth weights.

use candle_core::Tensor;

use super::{add_noise_alpha, NoiseScheduleConfig, Scheduler, SchedulerKind, StepOptions};
use crate::error::Result;

const MAX_HISTORY: usize = 4;

pub struct PndmScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    num_train_timesteps: usize,
    num_inference_steps: usize,
    timesteps: Vec<f64>,
    ets: Vec<Tensor>,
    cur_sample: Option<Tensor>,
    counter: usize,
}

impl PndmScheduler {
    pub fn new(config: &NoiseScheduleConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        let final_alpha_cumprod = alphas_cumprod[0];

        Self {
            alphas_cumprod,
            final_alpha_cumprod,
            num_train_timesteps: config.num_train_timesteps,
            num_inference_steps: 0,
            timesteps: Vec::new(),
            ets: Vec::new(),
            cur_sample: None,
            counter: 0,
        }
    }

    /// Descending PLMS schedule of `num_inference_steps + 1` entries, the
    /// second-to-last training timestep appearing twice.
    pub fn set_timesteps(&mut self, num_inference_steps: usize, offset: usize) {
        self.num_inference_steps = num_inference_steps;
        let step_ratio = self.step_ratio();
        let base: Vec<usize> = (0..num_inference_steps)
            .map(|i| i * step_ratio + offset)
            .collect();

        let mut plms = Vec::with_capacity(base.len() + 1);
        if base.len() >= 2 {
            plms.extend_from_slice(&base[..base.len() - 1]);
            plms.push(base[base.len() - 2]);
        }
        plms.extend(base.last().copied());

        self.timesteps = plms.into_iter().rev().map(|t| t as f64).collect();
        self.ets.clear();
        self.cur_sample = None;
        self.counter = 0;
    }

    fn step_ratio(&self) -> usize {
        self.num_train_timesteps / self.num_inference_steps.max(1)
    }

    fn alpha_at(&self, timestep: i64) -> f64 {
        if timestep >= 0 {
            self.alphas_cumprod[(timestep as usize).min(self.alphas_cumprod.len() - 1)]
        } else {
            self.final_alpha_cumprod
        }
    }

    /// Formula (9) of the PNDM paper: x_t -> x_t-delta for the combined eps.
    fn prev_sample(&self, sample: &Tensor, timestep: i64, prev_timestep: i64, model_output: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alpha_at(timestep);
        let alpha_prod_t_prev = self.alpha_at(prev_timestep);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

        let scaled_output = (model_output * ((alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff))?;
        Ok(((sample * sample_coeff)? - scaled_output)?)
    }

    fn history(&self, back: usize) -> &Tensor {
        &self.ets[self.ets.len() - 1 - back]
    }
}

impl Scheduler for PndmScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pndm
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
            Some(&timestep) => add_noise_alpha(original, noise, self.alpha_at(timestep as i64)),
            None => Ok(original.clone()),
        }
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        _options: StepOptions<'_>,
    ) -> Result<Tensor> {
        let step_ratio = self.step_ratio() as i64;
        let mut timestep = self.timesteps[step_index] as i64;
        let mut prev_timestep = timestep - step_ratio;

        if self.counter != 1 {
            self.ets.push(model_output.clone());
            if self.ets.len() > MAX_HISTORY {
                self.ets.remove(0);
            }
        } else {
            prev_timestep = timestep;
            timestep += step_ratio;
        }

        let (combined, base_sample) = match (self.ets.len(), self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                (model_output.clone(), sample.clone())
            }
            (1, 1) => {
                let combined = ((model_output + self.history(0))? / 2.0)?;
                let base = self.cur_sample.take().unwrap_or_else(|| sample.clone());
                (combined, base)
            }
            (2, _) => {
                let combined = (((self.history(0) * 3.0)? - self.history(1))? / 2.0)?;
                (combined, sample.clone())
            }
            (3, _) => {
                let combined = ((((self.history(0) * 23.0)? - (self.history(1) * 16.0)?)?
                    + (self.history(2) * 5.0)?)?
                    / 12.0)?;
                (combined, sample.clone())
            }
            _ => {
                let combined = (((((self.history(0) * 55.0)? - (self.history(1) * 59.0)?)?
                    + (self.history(2) * 37.0)?)?
                    - (self.history(3) * 9.0)?)?
                    / 24.0)?;
                (combined, sample.clone())
            }
        };

        let prev_sample = self.prev_sample(&base_sample, timestep, prev_timestep, &combined)?;
        self.counter += 1;
        Ok(prev_sample)
    }
}
