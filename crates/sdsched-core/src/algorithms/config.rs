//! Algorithm configuration in `scheduler_config.json` format.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BetaSchedule {
    #[serde(rename = "linear")]
    Linear,
    #[default]
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// What the network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PredictionType {
    #[default]
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "v_prediction")]
    VPrediction,
    #[serde(rename = "sample")]
    Sample,
}

/// How inference timesteps are drawn from the training range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimestepSpacing {
    #[default]
    #[serde(rename = "leading")]
    Leading,
    #[serde(rename = "trailing")]
    Trailing,
    #[serde(rename = "linspace")]
    Linspace,
}

/// Noise-schedule parameters shared by every algorithm.
///
/// Field names follow the diffusers scheduler config so that a checkpoint's
/// `scheduler/scheduler_config.json` deserializes directly. Unknown keys are
/// ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    #[serde(default)]
    pub beta_schedule: BetaSchedule,

    #[serde(default)]
    pub prediction_type: PredictionType,

    #[serde(default)]
    pub timestep_spacing: TimestepSpacing,

    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,

    /// Use alpha_prod = 1 past the final step instead of alphas_cumprod[0]
    #[serde(default)]
    pub set_alpha_to_one: bool,

    #[serde(default)]
    pub clip_sample: bool,

    #[serde(default = "default_clip_sample_range")]
    pub clip_sample_range: f64,

    /// Karras sigma spacing for sigma-based algorithms
    #[serde(default)]
    pub use_karras_sigmas: bool,

    /// Distillation schedule length for LCM
    #[serde(default = "default_original_inference_steps")]
    pub original_inference_steps: usize,

    /// DDIM stochasticity (0 = deterministic)
    #[serde(default)]
    pub eta: f64,

    /// Seed for algorithms that inject noise
    #[serde(default)]
    pub seed: u64,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_steps_offset() -> usize {
    1
}
fn default_clip_sample_range() -> f64 {
    1.0
}
fn default_original_inference_steps() -> usize {
    50
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: BetaSchedule::default(),
            prediction_type: PredictionType::default(),
            timestep_spacing: TimestepSpacing::default(),
            steps_offset: default_steps_offset(),
            set_alpha_to_one: false,
            clip_sample: false,
            clip_sample_range: default_clip_sample_range(),
            use_karras_sigmas: false,
            original_inference_steps: default_original_inference_steps(),
            eta: 0.0,
            seed: 0,
        }
    }
}

impl AlgorithmConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Load `<model_dir>/scheduler/scheduler_config.json`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("scheduler").join("scheduler_config.json");
        info!("Loading scheduler config from {:?}", path);
        Self::from_file(&path)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps < 2 {
            return Err(Error::ConfigError(format!(
                "num_train_timesteps must be at least 2, got {}",
                self.num_train_timesteps
            )));
        }
        if !(self.beta_start > 0.0 && self.beta_end > 0.0 && self.beta_end < 1.0) {
            return Err(Error::ConfigError(format!(
                "beta range must lie in (0, 1), got [{}, {}]",
                self.beta_start, self.beta_end
            )));
        }
        if self.original_inference_steps == 0
            || self.original_inference_steps > self.num_train_timesteps
        {
            return Err(Error::ConfigError(format!(
                "original_inference_steps must be in 1..={}, got {}",
                self.num_train_timesteps, self.original_inference_steps
            )));
        }
        if !(self.eta >= 0.0 && self.eta.is_finite()) {
            return Err(Error::ConfigError(format!(
                "eta must be a non-negative number, got {}",
                self.eta
            )));
        }
        Ok(())
    }
}
