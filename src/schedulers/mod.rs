//! Step-wise integrators for the denoising loop
//!
//! Every integrator exposes the same [`Scheduler`] capability interface. Which
//! optional parameters an integrator takes (timestep offset, `eta`) and whether
//! it is variance-exploding is declared statically by its [`SchedulerKind`],
//! so the sampling loop branches on capabilities instead of concrete types.

pub mod ddim;
pub mod lms_discrete;
pub mod pndm;

pub use ddim::DdimScheduler;
pub use lms_discrete::LmsDiscreteScheduler;
pub use pndm::PndmScheduler;

use candle_core::Tensor;

use crate::error::{PipelineError, Result};
use crate::generator::NoiseGenerator;

/// Integrator variants and their static capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Ddim,
    Pndm,
    LmsDiscrete,
}

impl SchedulerKind {
    /// Whether timestep setup takes an offset (shifts every timestep by one).
    pub fn accepts_offset(self) -> bool {
        matches!(self, SchedulerKind::Ddim | SchedulerKind::Pndm)
    }

    /// Whether `step` uses `eta` to control stochasticity.
    pub fn accepts_eta(self) -> bool {
        matches!(self, SchedulerKind::Ddim)
    }

    /// Sigma-based integrators scale the latent by their noise level.
    pub fn is_variance_exploding(self) -> bool {
        matches!(self, SchedulerKind::LmsDiscrete)
    }

    pub fn offset(self) -> usize {
        if self.accepts_offset() {
            1
        } else {
            0
        }
    }

    /// Fresh integrator state with timesteps set for `num_inference_steps`.
    ///
    /// `schedule` must pass [`NoiseScheduleConfig::validate`].
    pub fn build(self, schedule: &NoiseScheduleConfig, num_inference_steps: usize) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Ddim => {
                let mut scheduler = DdimScheduler::new(schedule);
                scheduler.set_timesteps(num_inference_steps, self.offset());
                Box::new(scheduler)
            }
            SchedulerKind::Pndm => {
                let mut scheduler = PndmScheduler::new(schedule);
                scheduler.set_timesteps(num_inference_steps, self.offset());
                Box::new(scheduler)
            }
            SchedulerKind::LmsDiscrete => {
                let mut scheduler = LmsDiscreteScheduler::new(schedule);
                scheduler.set_timesteps(num_inference_steps);
                Box::new(scheduler)
            }
        }
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ddim" => Ok(SchedulerKind::Ddim),
            "pndm" | "plms" => Ok(SchedulerKind::Pndm),
            "lms" | "lms_discrete" | "k_lms" => Ok(SchedulerKind::LmsDiscrete),
            _ => Err(PipelineError::UnknownScheduler(s.to_string())),
        }
    }
}

/// Optional per-step parameters.
pub struct StepOptions<'a> {
    /// Only forwarded to integrators that accept it.
    pub eta: Option<f64>,
    pub generator: &'a mut NoiseGenerator,
}

/// Capability interface every integrator implements.
pub trait Scheduler {
    fn kind(&self) -> SchedulerKind;

    /// Ordered timesteps to feed the noise predictor, fixed by `set_timesteps`.
    fn timesteps(&self) -> &[f64];

    /// Factor applied to pure-noise latents before the first step.
    fn init_noise_sigma(&self) -> f64;

    /// Noise level at a schedule position, for variance-exploding integrators.
    fn sigma_at(&self, step_index: usize) -> Option<f64>;

    /// Noise `original` to the level of schedule position `schedule_index`.
    /// A position past the end of the schedule leaves the sample clean.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, schedule_index: usize) -> Result<Tensor>;

    /// Advance `sample` from schedule position `step_index` to the next one.
    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        options: StepOptions<'_>,
    ) -> Result<Tensor>;

    fn is_variance_exploding(&self) -> bool {
        self.kind().is_variance_exploding()
    }
}

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

/// Training noise schedule shared by all integrators.
#[derive(Debug, Clone)]
pub struct NoiseScheduleConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
        }
    }
}

impl NoiseScheduleConfig {
    /// Reject schedules the integrators cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps == 0 {
            return Err(PipelineError::Config(
                "noise schedule needs at least one training timestep".to_string(),
            ));
        }

        let valid_beta = |beta: f64| (0.0..1.0).contains(&beta);
        if !valid_beta(self.beta_start) || !valid_beta(self.beta_end) {
            return Err(PipelineError::Config(format!(
                "noise schedule betas must lie in [0, 1) but are {} and {}",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }

    pub fn betas(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let frac = |i: usize| if n > 1 { i as f64 / (n as f64 - 1.0) } else { 0.0 };

        match self.beta_schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| self.beta_start + (self.beta_end - self.beta_start) * frac(i))
                .collect(),
            BetaSchedule::ScaledLinear => {
                let start = self.beta_start.sqrt();
                let end = self.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let beta = start + (end - start) * frac(i);
                        beta * beta
                    })
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => {
                let max_beta = 0.999;
                let alpha_bar =
                    |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
                    })
                    .collect()
            }
        }
    }

    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut cumprod = 1.0;
        self.betas()
            .into_iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect()
    }
}

/// `sqrt(a) * original + sqrt(1 - a) * noise`, shared by the alpha-based integrators.
pub(crate) fn add_noise_alpha(original: &Tensor, noise: &Tensor, alpha_prod: f64) -> Result<Tensor> {
    let scaled_original = (original * alpha_prod.sqrt())?;
    let scaled_noise = (noise * (1.0 - alpha_prod).sqrt())?;
    Ok((scaled_original + scaled_noise)?)
}
