//! Seeded random source threaded through a generation request

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::Result;

/// Explicit generator handle; the same seed reproduces the same noise.
///
/// Noise is drawn on the host and then moved to the target device so the
/// sequence does not depend on the backend.
pub struct NoiseGenerator {
    rng: StdRng,
    seed: u64,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn from_entropy() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Standard normal f32 tensor of the given shape.
    pub fn randn(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let num_elements: usize = shape.iter().product();
        let data: Vec<f32> = (0..num_elements)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();

        Ok(Tensor::from_vec(data, shape, device)?)
    }

    pub fn randn_like(&mut self, tensor: &Tensor) -> Result<Tensor> {
        let noise = self.randn(tensor.dims(), tensor.device())?;
        Ok(noise.to_dtype(tensor.dtype())?)
    }
}

impl std::fmt::Debug for NoiseGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseGenerator").field("seed", &self.seed).finish()
    }
}
