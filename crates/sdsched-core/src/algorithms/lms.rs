//! Linear multistep sampler over the sigma schedule (Karras et al., 2022).
//!
//! Up to four prior derivatives are combined with Lagrange coefficients
//! integrated between consecutive sigmas.

use candle_core::Tensor;

use super::euler::{init_sigma, scale_by_sigma, sigma_original, SigmaSchedule};
use super::schedule;
use super::{axpby, check_same_shape, to_f32, Algorithm, AlgorithmConfig, Progress};
use crate::error::Result;

const LMS_ORDER: usize = 4;

pub struct LmsDiscreteAlgorithm {
    config: AlgorithmConfig,
    sigmas: SigmaSchedule,
    init_noise_sigma: f64,
    progress: Progress,
    /// `(x - x0) / sigma` of recent steps, newest last.
    derivatives: Vec<Tensor>,
}

impl LmsDiscreteAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let sigmas = SigmaSchedule::new(&config);
        Ok(Self {
            config,
            sigmas,
            init_noise_sigma: 1.0,
            progress: Progress::default(),
            derivatives: Vec::with_capacity(LMS_ORDER),
        })
    }

    /// Integral over `[sigma_t, sigma_t+1]` of the Lagrange basis polynomial
    /// through `sigma_t, .., sigma_t-order+1` that is one at `sigma_t-current`.
    fn lms_coefficient(&self, order: usize, t: usize, current: usize) -> f64 {
        let sigmas = &self.sigmas.sigmas;
        let basis = |tau: f64| -> f64 {
            (0..order)
                .filter(|k| *k != current)
                .map(|k| (tau - sigmas[t - k]) / (sigmas[t - current] - sigmas[t - k]))
                .product()
        };
        // Two-point Gauss-Legendre is exact up to the cubic basis of order four.
        let (from, to) = (sigmas[t], sigmas[t + 1]);
        let half = (to - from) / 2.0;
        let mid = (from + to) / 2.0;
        let node = half / 3f64.sqrt();
        half * (basis(mid - node) + basis(mid + node))
    }
}

impl Algorithm for LmsDiscreteAlgorithm {
    fn name(&self) -> &'static str {
        "LMSDiscrete"
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let spaced = schedule::spaced_timesteps(&self.config, num_inference_steps)?;
        let timesteps = self.sigmas.fit(spaced, self.config.use_karras_sigmas);
        self.init_noise_sigma = init_sigma(&self.config, self.sigmas.max_sigma());
        self.derivatives.clear();
        self.progress.reset(timesteps);
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.progress.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor> {
        scale_by_sigma(
            self.name(),
            &self.progress,
            &self.sigmas.sigmas,
            sample,
            timestep,
        )
    }

    fn set_step_index(&mut self, index: usize) {
        self.progress.step_index = Some(index);
    }

    fn step_index(&self) -> Option<usize> {
        self.progress.step_index
    }

    fn step(&mut self, noise_pred: &Tensor, timestep: f64, sample: &Tensor) -> Result<Tensor> {
        let index = self.progress.resolve_index(self.name(), timestep)?;
        check_same_shape(noise_pred, sample)?;
        let model_output = to_f32(noise_pred)?;
        let sample = to_f32(sample)?;

        let sigma = self.sigmas.sigmas[index];
        let original = sigma_original(self.config.prediction_type, &model_output, &sample, sigma)?;
        let derivative = axpby(&sample, 1.0 / sigma, &original, -1.0 / sigma)?;
        if self.derivatives.len() == LMS_ORDER {
            self.derivatives.remove(0);
        }
        self.derivatives.push(derivative);

        let order = (index + 1).min(LMS_ORDER).min(self.derivatives.len());
        let mut prev_sample = sample;
        for (current, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
            let coeff = self.lms_coefficient(order, index, current);
            prev_sample = axpby(&prev_sample, 1.0, derivative, coeff)?;
        }
        Ok(prev_sample)
    }
}
