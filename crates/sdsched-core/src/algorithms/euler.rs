//! Euler discrete samplers (Karras et al., 2022), deterministic and ancestral.

use candle_core::Tensor;

use super::config::{PredictionType, TimestepSpacing};
use super::noise::NoiseGenerator;
use super::schedule;
use super::{axpby, check_same_shape, to_f32, Algorithm, AlgorithmConfig, Progress};
use crate::error::{Error, Result};

/// Sigma table shared by the sigma-parameterized samplers.
#[derive(Debug, Clone)]
pub(crate) struct SigmaSchedule {
    train_sigmas: Vec<f64>,
    log_sigmas: Vec<f64>,
    /// Per-step sigmas with a trailing zero.
    pub sigmas: Vec<f64>,
}

impl SigmaSchedule {
    pub fn new(config: &AlgorithmConfig) -> Self {
        let alphas_cumprod = schedule::alphas_cumprod(&schedule::betas(config));
        let train_sigmas = schedule::train_sigmas(&alphas_cumprod);
        let log_sigmas = train_sigmas.iter().map(|s| s.ln()).collect();
        Self {
            train_sigmas,
            log_sigmas,
            sigmas: Vec::new(),
        }
    }

    /// Returns the timesteps matching `timesteps`' sigmas, Karras-respaced when asked.
    pub fn fit(&mut self, timesteps: Vec<f64>, use_karras: bool) -> Vec<f64> {
        let mut sigmas = schedule::sigmas_at(&timesteps, &self.train_sigmas);
        let timesteps = if use_karras {
            let sigma_max = sigmas.first().copied().unwrap_or_default();
            let sigma_min = sigmas.last().copied().unwrap_or_default();
            sigmas = schedule::karras_sigmas(sigma_min, sigma_max, sigmas.len());
            sigmas
                .iter()
                .map(|s| schedule::sigma_to_t(*s, &self.log_sigmas))
                .collect()
        } else {
            timesteps
        };
        sigmas.push(0.0);
        self.sigmas = sigmas;
        timesteps
    }

    pub fn max_sigma(&self) -> f64 {
        self.sigmas.iter().copied().fold(0.0, f64::max)
    }
}

pub(crate) fn scale_by_sigma(
    name: &str,
    progress: &Progress,
    sigmas: &[f64],
    sample: &Tensor,
    timestep: f64,
) -> Result<Tensor> {
    progress.ensure_ready(name)?;
    let index = schedule::index_for_timestep(&progress.timesteps, timestep).ok_or_else(|| {
        Error::BackendError(format!("{name}: timestep {timestep} is not in the schedule"))
    })?;
    let sigma = sigmas[index];
    Ok(sample.affine(1.0 / (sigma * sigma + 1.0).sqrt(), 0.0)?)
}

pub(crate) fn init_sigma(config: &AlgorithmConfig, max_sigma: f64) -> f64 {
    match config.timestep_spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
        TimestepSpacing::Leading => (max_sigma * max_sigma + 1.0).sqrt(),
    }
}

/// Clean-sample estimate for sigma-parameterized algorithms.
pub(crate) fn sigma_original(
    prediction_type: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    sigma: f64,
) -> Result<Tensor> {
    match prediction_type {
        PredictionType::Epsilon => axpby(sample, 1.0, model_output, -sigma),
        PredictionType::VPrediction => {
            let denom = sigma * sigma + 1.0;
            axpby(model_output, -sigma / denom.sqrt(), sample, 1.0 / denom)
        }
        PredictionType::Sample => Ok(model_output.clone()),
    }
}

/// `x + (x - x0) / sigma * dt`
fn euler_update(sample: &Tensor, original: &Tensor, sigma: f64, dt: f64) -> Result<Tensor> {
    let ratio = dt / sigma;
    axpby(sample, 1.0 + ratio, original, -ratio)
}

pub struct EulerAlgorithm {
    config: AlgorithmConfig,
    sigmas: SigmaSchedule,
    init_noise_sigma: f64,
    progress: Progress,
}

impl EulerAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let sigmas = SigmaSchedule::new(&config);
        Ok(Self {
            config,
            sigmas,
            init_noise_sigma: 1.0,
            progress: Progress::default(),
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas.sigmas
    }
}

impl Algorithm for EulerAlgorithm {
    fn name(&self) -> &'static str {
        "EulerDiscrete"
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let spaced = schedule::spaced_timesteps(&self.config, num_inference_steps)?;
        let timesteps = self.sigmas.fit(spaced, self.config.use_karras_sigmas);
        self.init_noise_sigma = init_sigma(&self.config, self.sigmas.max_sigma());
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
        let sigma_next = self.sigmas.sigmas[index + 1];
        let original = sigma_original(self.config.prediction_type, &model_output, &sample, sigma)?;
        euler_update(&sample, &original, sigma, sigma_next - sigma)
    }
}

pub struct EulerAncestralAlgorithm {
    config: AlgorithmConfig,
    sigmas: SigmaSchedule,
    init_noise_sigma: f64,
    progress: Progress,
    noise: NoiseGenerator,
}

impl EulerAncestralAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let sigmas = SigmaSchedule::new(&config);
        let noise = NoiseGenerator::new(config.seed);
        Ok(Self {
            config,
            sigmas,
            init_noise_sigma: 1.0,
            progress: Progress::default(),
            noise,
        })
    }
}

impl Algorithm for EulerAncestralAlgorithm {
    fn name(&self) -> &'static str {
        "EulerAncestralDiscrete"
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let spaced = schedule::spaced_timesteps(&self.config, num_inference_steps)?;
        // Ancestral sampling does not use Karras respacing.
        let timesteps = self.sigmas.fit(spaced, false);
        self.init_noise_sigma = init_sigma(&self.config, self.sigmas.max_sigma());
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

        let sigma_from = self.sigmas.sigmas[index];
        let sigma_to = self.sigmas.sigmas[index + 1];
        let sigma_up = (sigma_to * sigma_to * (sigma_from * sigma_from - sigma_to * sigma_to)
            / (sigma_from * sigma_from))
            .max(0.0)
            .sqrt();
        let sigma_down = (sigma_to * sigma_to - sigma_up * sigma_up).max(0.0).sqrt();

        let original =
            sigma_original(self.config.prediction_type, &model_output, &sample, sigma_from)?;
        let prev_sample = euler_update(&sample, &original, sigma_from, sigma_down - sigma_from)?;

        if sigma_up == 0.0 {
            return Ok(prev_sample);
        }
        let noise = self.noise.sample_like(&prev_sample)?;
        Ok((prev_sample + noise.affine(sigma_up, 0.0)?)?)
    }
}
