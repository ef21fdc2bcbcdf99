//! Denoising Diffusion Probabilistic Models (Ho et al., 2020) with
//! fixed-small posterior variance.

use candle_core::Tensor;

use super::noise::NoiseGenerator;
use super::schedule;
use super::{
    axpby, check_same_shape, split_prediction, to_f32, Algorithm, AlgorithmConfig, Progress,
};
use crate::error::Result;

pub struct DdpmAlgorithm {
    config: AlgorithmConfig,
    alphas_cumprod: Vec<f64>,
    progress: Progress,
    noise: NoiseGenerator,
}

impl DdpmAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let alphas_cumprod = schedule::alphas_cumprod(&schedule::betas(&config));
        let noise = NoiseGenerator::new(config.seed);
        Ok(Self {
            config,
            alphas_cumprod,
            progress: Progress::default(),
            noise,
        })
    }
}

impl Algorithm for DdpmAlgorithm {
    fn name(&self) -> &'static str {
        "DDPM"
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let timesteps = schedule::spaced_timesteps(&self.config, num_inference_steps)?
            .into_iter()
            .map(f64::round_ties_even)
            .collect();
        self.progress.reset(timesteps);
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.progress.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: &Tensor, _timestep: f64) -> Result<Tensor> {
        self.progress.ensure_ready(self.name())?;
        Ok(sample.clone())
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

        let train = self.config.num_train_timesteps;
        let t = schedule::train_index(timestep, train)?;
        // The next scheduled timestep, or none on the final step.
        let alpha_prod_prev = match self.progress.timesteps.get(index + 1) {
            Some(prev_t) => self.alphas_cumprod[schedule::train_index(*prev_t, train)?],
            None => 1.0,
        };

        let alpha_prod_t = self.alphas_cumprod[t];
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (mut original, _) = split_prediction(
            self.config.prediction_type,
            &model_output,
            &sample,
            alpha_prod_t,
        )?;
        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            original = original.clamp(-range, range)?;
        }

        let original_coef = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let current_coef = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mean = axpby(&original, original_coef, &sample, current_coef)?;

        if t == 0 {
            return Ok(mean);
        }
        let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
        let noise = self.noise.sample_like(&mean)?;
        Ok((mean + noise.affine(variance.sqrt(), 0.0)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{PredictionType, TimestepSpacing};
    use super::*;

    fn prepared(seed: u64) -> DdpmAlgorithm {
        let mut ddpm = DdpmAlgorithm::new(AlgorithmConfig::default().with_seed(seed)).unwrap();
        ddpm.set_timesteps(10).unwrap();
        ddpm
    }

    #[test]
    fn stochastic_step_is_seed_deterministic() {
        let sample = ramp((1, 4, 4, 4));
        let eps = sample.affine(0.1, 0.0).unwrap();

        let mut a = prepared(42);
        let mut b = prepared(42);
        let mut c = prepared(43);
        a.set_step_index(0);
        b.set_step_index(0);
        c.set_step_index(0);

        let t = a.timesteps()[0];
        let out_a = a.step(&eps, t, &sample).unwrap();
        let out_b = b.step(&eps, t, &sample).unwrap();
        let out_c = c.step(&eps, t, &sample).unwrap();
        assert_eq!(values(&out_a), values(&out_b));
        assert_ne!(values(&out_a), values(&out_c));
    }

    #[test]
    fn timestep_zero_adds_no_noise() {
        let config = AlgorithmConfig {
            steps_offset: 0,
            ..Default::default()
        };
        let mut a = DdpmAlgorithm::new(config.clone().with_seed(1)).unwrap();
        let mut b = DdpmAlgorithm::new(config.with_seed(2)).unwrap();
        a.set_timesteps(10).unwrap();
        b.set_timesteps(10).unwrap();
        assert_eq!(*a.timesteps().last().unwrap(), 0.0);

        let sample = ramp((1, 1, 2, 2));
        let eps = sample.affine(0.3, 0.0).unwrap();
        a.set_step_index(9);
        b.set_step_index(9);
        let out_a = a.step(&eps, 0.0, &sample).unwrap();
        let out_b = b.step(&eps, 0.0, &sample).unwrap();
        assert_eq!(values(&out_a), values(&out_b));
    }

    #[test]
    fn trailing_spacing_steps_toward_next_scheduled_timestep() {
        let config = AlgorithmConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..Default::default()
        }
        .with_seed(11);
        let mut ddpm = DdpmAlgorithm::new(config.clone()).unwrap();
        ddpm.set_timesteps(3).unwrap();
        assert_eq!(ddpm.timesteps(), &[999.0, 666.0, 332.0]);

        let sample = ramp((1, 2, 4, 4));
        let eps = sample.affine(0.2, 0.05).unwrap();
        ddpm.set_step_index(1);
        let out = ddpm.step(&eps, 666.0, &sample).unwrap();

        let acp = schedule::alphas_cumprod(&schedule::betas(&config));
        let (a_t, a_prev) = (acp[666], acp[332]);
        let current_alpha = a_t / a_prev;
        let current_beta = 1.0 - current_alpha;
        let (original, _) =
            split_prediction(PredictionType::Epsilon, &eps, &sample, a_t).unwrap();
        let mean = axpby(
            &original,
            a_prev.sqrt() * current_beta / (1.0 - a_t),
            &sample,
            current_alpha.sqrt() * (1.0 - a_prev) / (1.0 - a_t),
        )
        .unwrap();
        let variance = (1.0 - a_prev) / (1.0 - a_t) * current_beta;
        let noise = NoiseGenerator::new(11).sample_like(&mean).unwrap();
        let expected = (mean + noise.affine(variance.sqrt(), 0.0).unwrap()).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-5);
    }

    #[test]
    fn final_index_uses_unit_alpha() {
        let config = AlgorithmConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..Default::default()
        };
        let mut a = DdpmAlgorithm::new(config.clone().with_seed(1)).unwrap();
        let mut b = DdpmAlgorithm::new(config.with_seed(2)).unwrap();
        a.set_timesteps(3).unwrap();
        b.set_timesteps(3).unwrap();

        // alpha_prev = 1 makes the posterior variance zero on the last step.
        let sample = ramp((1, 1, 2, 2));
        let eps = sample.affine(0.3, 0.0).unwrap();
        a.set_step_index(2);
        b.set_step_index(2);
        let out_a = a.step(&eps, 332.0, &sample).unwrap();
        let out_b = b.step(&eps, 332.0, &sample).unwrap();
        assert!(max_abs_diff(&out_a, &out_b) < 1e-6);
    }
}
