//! Denoising algorithms behind a single scheduling contract.
//!
//! Each algorithm owns its state (timesteps, step index, multistep history)
//! and is driven by the [`SchedulingEngine`](crate::engine::SchedulingEngine).
//! The engine forces the step index before every step; algorithms never
//! advance it themselves.

mod config;
mod ddim;
mod ddpm;
mod dpm_solver;
mod euler;
mod lcm;
mod lms;
pub mod noise;
pub mod schedule;

pub use config::{AlgorithmConfig, BetaSchedule, PredictionType, TimestepSpacing};
pub use ddim::DdimAlgorithm;
pub use ddpm::DdpmAlgorithm;
pub use dpm_solver::DpmSolverMultistepAlgorithm;
pub use euler::{EulerAlgorithm, EulerAncestralAlgorithm};
pub use lcm::LcmAlgorithm;
pub use lms::LmsDiscreteAlgorithm;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Minimal scheduling contract every algorithm variant satisfies.
pub trait Algorithm: Send {
    fn name(&self) -> &'static str;

    /// Populate the timestep sequence and init-noise sigma for `n` steps.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    fn timesteps(&self) -> &[f64];

    fn init_noise_sigma(&self) -> f64;

    /// Algorithm-specific input rescaling; identity for most alpha-based variants.
    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor>;

    fn set_step_index(&mut self, index: usize);

    fn step_index(&self) -> Option<usize>;

    /// Compute the previous (less noisy) sample. Inputs may be any float dtype;
    /// the result is F32.
    fn step(&mut self, noise_pred: &Tensor, timestep: f64, sample: &Tensor) -> Result<Tensor>;
}

/// Timestep sequence and step position shared by all variants.
#[derive(Debug, Clone, Default)]
pub(crate) struct Progress {
    pub timesteps: Vec<f64>,
    pub num_inference_steps: Option<usize>,
    pub step_index: Option<usize>,
}

impl Progress {
    pub fn reset(&mut self, timesteps: Vec<f64>) {
        self.num_inference_steps = Some(timesteps.len());
        self.timesteps = timesteps;
        self.step_index = None;
    }

    pub fn ensure_ready(&self, name: &str) -> Result<usize> {
        self.num_inference_steps.ok_or_else(|| {
            Error::ConfigError(format!("{name}: set_timesteps must be called before stepping"))
        })
    }

    /// The forced index, or the schedule position of `timestep` when none was set.
    pub fn resolve_index(&self, name: &str, timestep: f64) -> Result<usize> {
        let count = self.ensure_ready(name)?;
        let index = match self.step_index {
            Some(index) => index,
            None => schedule::index_for_timestep(&self.timesteps, timestep).ok_or_else(|| {
                Error::BackendError(format!("{name}: timestep {timestep} is not in the schedule"))
            })?,
        };
        if index >= count {
            return Err(Error::StepIndexOutOfRange {
                index,
                step_count: count,
            });
        }
        Ok(index)
    }
}

pub(crate) fn to_f32(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_dtype(DType::F32)?)
}

/// `a * x + b * y`
pub(crate) fn axpby(x: &Tensor, a: f64, y: &Tensor, b: f64) -> Result<Tensor> {
    Ok((x.affine(a, 0.0)? + y.affine(b, 0.0)?)?)
}

pub(crate) fn check_same_shape(noise_pred: &Tensor, sample: &Tensor) -> Result<()> {
    if noise_pred.dims() != sample.dims() {
        return Err(Error::shape("noise_pred", sample.dims(), noise_pred.dims()));
    }
    Ok(())
}

/// Predicted clean sample and noise for alpha-parameterized algorithms.
pub(crate) fn split_prediction(
    prediction_type: PredictionType,
    model_output: &Tensor,
    sample: &Tensor,
    alpha_prod_t: f64,
) -> Result<(Tensor, Tensor)> {
    let sqrt_alpha = alpha_prod_t.sqrt();
    let sqrt_beta = (1.0 - alpha_prod_t).sqrt();
    match prediction_type {
        PredictionType::Epsilon => {
            let original = axpby(sample, 1.0 / sqrt_alpha, model_output, -sqrt_beta / sqrt_alpha)?;
            Ok((original, model_output.clone()))
        }
        PredictionType::Sample => {
            let epsilon = axpby(sample, 1.0 / sqrt_beta, model_output, -sqrt_alpha / sqrt_beta)?;
            Ok((model_output.clone(), epsilon))
        }
        PredictionType::VPrediction => {
            let original = axpby(sample, sqrt_alpha, model_output, -sqrt_beta)?;
            let epsilon = axpby(model_output, sqrt_alpha, sample, sqrt_beta)?;
            Ok((original, epsilon))
        }
    }
}
