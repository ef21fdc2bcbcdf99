//! Latent Consistency Model multistep sampler (Luo et al., 2023).

use candle_core::Tensor;

use super::noise::NoiseGenerator;
use super::schedule;
use super::{
    axpby, check_same_shape, split_prediction, to_f32, Algorithm, AlgorithmConfig, Progress,
};
use crate::error::{Error, Result};

const TIMESTEP_SCALING: f64 = 10.0;
const SIGMA_DATA: f64 = 0.5;

pub struct LcmAlgorithm {
    config: AlgorithmConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    progress: Progress,
    noise: NoiseGenerator,
}

impl LcmAlgorithm {
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

    /// `(c_skip, c_out)` consistency boundary scalings.
    fn boundary_scalings(timestep: f64) -> (f64, f64) {
        let scaled = timestep * TIMESTEP_SCALING;
        let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
        (SIGMA_DATA * SIGMA_DATA / denom, scaled / denom.sqrt())
    }
}

impl Algorithm for LcmAlgorithm {
    fn name(&self) -> &'static str {
        "LCMScheduler"
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let original_steps = self.config.original_inference_steps;
        if num_inference_steps == 0 || num_inference_steps > original_steps {
            return Err(Error::ConfigError(format!(
                "LCM supports 1..={original_steps} inference steps, got {num_inference_steps}"
            )));
        }
        // Distillation schedule, descending: k*i - 1 for i = original_steps..1
        let k = self.config.num_train_timesteps / original_steps;
        let origin: Vec<f64> = (1..=original_steps)
            .rev()
            .map(|i| (i * k - 1) as f64)
            .collect();

        let timesteps = (0..num_inference_steps)
            .map(|i| origin[i * original_steps / num_inference_steps])
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

        let final_step = index + 1 == self.progress.timesteps.len();
        let prev_timestep = if final_step {
            timestep
        } else {
            self.progress.timesteps[index + 1]
        };

        let train = self.config.num_train_timesteps;
        let t = schedule::train_index(timestep, train)?;
        let alpha_prod_t = self.alphas_cumprod[t];
        let alpha_prod_prev = if prev_timestep >= 0.0 {
            self.alphas_cumprod[schedule::train_index(prev_timestep, train)?]
        } else {
            self.final_alpha_cumprod
        };

        let (c_skip, c_out) = Self::boundary_scalings(timestep.round());
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
        let denoised = axpby(&original, c_out, &sample, c_skip)?;

        if final_step {
            return Ok(denoised);
        }
        let noise = self.noise.sample_like(&denoised)?;
        axpby(
            &denoised,
            alpha_prod_prev.sqrt(),
            &noise,
            (1.0 - alpha_prod_prev).sqrt(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn four_step_schedule_skips_through_origin() {
        let mut lcm = LcmAlgorithm::new(AlgorithmConfig::default()).unwrap();
        lcm.set_timesteps(4).unwrap();
        // origin = [999, 979, ..., 19]; indices 0, 12, 25, 37
        assert_eq!(lcm.timesteps(), &[999.0, 759.0, 499.0, 259.0]);
    }

    #[test]
    fn rejects_more_steps_than_distilled() {
        let mut lcm = LcmAlgorithm::new(AlgorithmConfig::default()).unwrap();
        assert!(lcm.set_timesteps(51).is_err());
    }

    #[test]
    fn boundary_scalings_favor_prediction_at_high_noise() {
        let (c_skip, c_out) = LcmAlgorithm::boundary_scalings(999.0);
        assert!(c_skip < 1e-6);
        assert!((c_out - 1.0).abs() < 1e-6);
    }

    #[test]
    fn final_step_is_deterministic() {
        let run = |seed: u64| {
            let mut lcm = LcmAlgorithm::new(AlgorithmConfig::default().with_seed(seed)).unwrap();
            lcm.set_timesteps(2).unwrap();
            lcm.set_step_index(1);
            let sample = ramp((1, 1, 2, 2));
            let t = lcm.timesteps()[1];
            values(&lcm.step(&sample, t, &sample).unwrap())
        };
        assert_eq!(run(3), run(4));
    }
}
