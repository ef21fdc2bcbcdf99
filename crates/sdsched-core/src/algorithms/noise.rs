//! Seeded Gaussian noise for stochastic algorithms.

use candle_core::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::Result;

/// Deterministic standard-normal source; one per algorithm instance.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: ChaCha8Rng,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// F32 noise with the shape and device of `like`.
    pub fn sample_like(&mut self, like: &Tensor) -> Result<Tensor> {
        let count = like.elem_count();
        let values: Vec<f32> = (0..count)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(values, like.dims(), like.device())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn same_seed_same_noise() {
        let like = Tensor::zeros((1, 4, 2, 2), DType::F16, &Device::Cpu).unwrap();
        let a = NoiseGenerator::new(7).sample_like(&like).unwrap();
        let b = NoiseGenerator::new(7).sample_like(&like).unwrap();
        assert_eq!(a.dims(), &[1, 4, 2, 2]);
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn successive_draws_differ() {
        let like = Tensor::zeros(16, DType::F32, &Device::Cpu).unwrap();
        let mut gen = NoiseGenerator::new(1);
        let a = gen.sample_like(&like).unwrap().to_vec1::<f32>().unwrap();
        let b = gen.sample_like(&like).unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(a, b);
    }
}
