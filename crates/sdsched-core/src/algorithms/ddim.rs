//! Denoising Diffusion Implicit Models (Song et al., 2020).

use candle_core::Tensor;

use super::noise::NoiseGenerator;
use super::schedule;
use super::{
    axpby, check_same_shape, split_prediction, to_f32, Algorithm, AlgorithmConfig, Progress,
};
use crate::error::Result;

pub struct DdimAlgorithm {
    config: AlgorithmConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    progress: Progress,
    noise: NoiseGenerator,
}

impl DdimAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let alphas_cumprod = schedule::alphas_cumprod(&schedule::betas(&config));
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        let noise = NoiseGenerator::new(config.seed);
        Ok(Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            progress: Progress::default(),
            noise,
        })
    }

    fn alpha_prod(&self, timestep: f64) -> Result<f64> {
        if timestep < 0.0 {
            return Ok(self.final_alpha_cumprod);
        }
        let index = schedule::train_index(timestep, self.config.num_train_timesteps)?;
        Ok(self.alphas_cumprod[index])
    }
}

impl Algorithm for DdimAlgorithm {
    fn name(&self) -> &'static str {
        "DDIM"
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
        let steps = self.progress.ensure_ready(self.name())?;
        check_same_shape(noise_pred, sample)?;
        let model_output = to_f32(noise_pred)?;
        let sample = to_f32(sample)?;

        let prev_timestep = timestep - (self.config.num_train_timesteps / steps) as f64;
        let alpha_prod_t = self.alpha_prod(timestep)?;
        let alpha_prod_prev = self.alpha_prod(prev_timestep)?;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;

        let (mut original, mut epsilon) = split_prediction(
            self.config.prediction_type,
            &model_output,
            &sample,
            alpha_prod_t,
        )?;

        if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            original = original.clamp(-range, range)?;
            epsilon = axpby(
                &sample,
                1.0 / beta_prod_t.sqrt(),
                &original,
                -alpha_prod_t.sqrt() / beta_prod_t.sqrt(),
            )?;
        }

        let variance = (beta_prod_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_prev);
        let std_dev = self.config.eta * variance.max(0.0).sqrt();
        let direction_coef = (1.0 - alpha_prod_prev - std_dev * std_dev).max(0.0).sqrt();

        let prev_sample = axpby(&original, alpha_prod_prev.sqrt(), &epsilon, direction_coef)?;
        if std_dev > 0.0 {
            let noise = self.noise.sample_like(&prev_sample)?;
            return Ok((prev_sample + noise.affine(std_dev, 0.0)?)?);
        }
        Ok(prev_sample)
    }
}
