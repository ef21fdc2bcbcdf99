//! DPM-Solver++ (2M) multistep sampler (Lu et al., 2022).
//!
//! Second-order midpoint updates after a first-order warmup step, and a
//! first-order final step down to sigma zero.

use candle_core::Tensor;

use super::config::{PredictionType, TimestepSpacing};
use super::euler::SigmaSchedule;
use super::schedule;
use super::{axpby, check_same_shape, to_f32, Algorithm, AlgorithmConfig, Progress};
use crate::error::{Error, Result};

const SOLVER_ORDER: usize = 2;

pub struct DpmSolverMultistepAlgorithm {
    config: AlgorithmConfig,
    sigmas: SigmaSchedule,
    progress: Progress,
    /// Most recent converted model outputs, newest last.
    model_outputs: Vec<Tensor>,
    lower_order_nums: usize,
}

/// `(alpha_t, sigma_t)` of the variance-preserving parameterization.
fn alpha_sigma(sigma: f64) -> (f64, f64) {
    let alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
    (alpha, sigma * alpha)
}

fn lambda(sigma: f64) -> f64 {
    let (alpha, sigma_t) = alpha_sigma(sigma);
    alpha.ln() - sigma_t.ln()
}

impl DpmSolverMultistepAlgorithm {
    pub fn new(config: AlgorithmConfig) -> Result<Self> {
        config.validate()?;
        let sigmas = SigmaSchedule::new(&config);
        Ok(Self {
            config,
            sigmas,
            progress: Progress::default(),
            model_outputs: Vec::with_capacity(SOLVER_ORDER),
            lower_order_nums: 0,
        })
    }

    fn spaced_timesteps(&self, n: usize) -> Result<Vec<f64>> {
        let train = self.config.num_train_timesteps;
        if n == 0 || n > train {
            return Err(Error::ConfigError(format!(
                "num_inference_steps must be in 1..={train}, got {n}"
            )));
        }
        // Drawn from n + 1 points with the last (t = 0) dropped.
        let timesteps: Vec<f64> = match self.config.timestep_spacing {
            TimestepSpacing::Linspace => {
                let mut ts: Vec<f64> = schedule::linspace(0.0, (train - 1) as f64, n + 1)
                    .into_iter()
                    .map(f64::round_ties_even)
                    .collect();
                ts.reverse();
                ts.truncate(n);
                ts
            }
            TimestepSpacing::Leading => {
                let step_ratio = train / (n + 1);
                (1..=n)
                    .rev()
                    .map(|i| (i * step_ratio + self.config.steps_offset) as f64)
                    .collect()
            }
            TimestepSpacing::Trailing => return schedule::spaced_timesteps(&self.config, n),
        };
        if timesteps.iter().any(|t| *t > (train - 1) as f64) {
            return Err(Error::ConfigError(format!(
                "timesteps exceed the training range 0..{train}; check steps_offset"
            )));
        }
        Ok(timesteps)
    }

    /// Data (x0) prediction from the raw model output.
    fn convert_model_output(
        &self,
        model_output: &Tensor,
        sample: &Tensor,
        sigma: f64,
    ) -> Result<Tensor> {
        let (alpha_t, sigma_t) = alpha_sigma(sigma);
        match self.config.prediction_type {
            PredictionType::Epsilon => {
                axpby(sample, 1.0 / alpha_t, model_output, -sigma_t / alpha_t)
            }
            PredictionType::VPrediction => axpby(sample, alpha_t, model_output, -sigma_t),
            PredictionType::Sample => Ok(model_output.clone()),
        }
    }

    fn first_order_update(
        &self,
        original: &Tensor,
        sample: &Tensor,
        index: usize,
    ) -> Result<Tensor> {
        let sigma_s = self.sigmas.sigmas[index];
        let sigma_next = self.sigmas.sigmas[index + 1];
        if sigma_next == 0.0 {
            return Ok(original.clone());
        }
        let (alpha_t, sigma_t) = alpha_sigma(sigma_next);
        let (_, sigma_s_t) = alpha_sigma(sigma_s);
        let h = lambda(sigma_next) - lambda(sigma_s);
        axpby(sample, sigma_t / sigma_s_t, original, -alpha_t * ((-h).exp() - 1.0))
    }

    fn second_order_update(&self, sample: &Tensor, index: usize) -> Result<Tensor> {
        let (m0, m1) = match self.model_outputs.as_slice() {
            [.., m1, m0] => (m0, m1),
            _ => {
                return Err(Error::BackendError(
                    "DPMSolverMultistep: second-order update without history".to_string(),
                ))
            }
        };
        let sigma_t_raw = self.sigmas.sigmas[index + 1];
        let sigma_s0_raw = self.sigmas.sigmas[index];
        let sigma_s1_raw = self.sigmas.sigmas[index - 1];
        if sigma_t_raw == 0.0 {
            return Ok(m0.clone());
        }

        let (alpha_t, sigma_t) = alpha_sigma(sigma_t_raw);
        let (_, sigma_s0) = alpha_sigma(sigma_s0_raw);
        let lambda_t = lambda(sigma_t_raw);
        let lambda_s0 = lambda(sigma_s0_raw);
        let lambda_s1 = lambda(sigma_s1_raw);

        let h = lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let r0 = h_0 / h;
        let phi = (-h).exp() - 1.0;

        // D1 = (m0 - m1) / r0
        let d1 = axpby(m0, 1.0 / r0, m1, -1.0 / r0)?;
        let base = axpby(sample, sigma_t / sigma_s0, m0, -alpha_t * phi)?;
        axpby(&base, 1.0, &d1, -0.5 * alpha_t * phi)
    }
}

impl Algorithm for DpmSolverMultistepAlgorithm {
    fn name(&self) -> &'static str {
        if self.config.use_karras_sigmas {
            "DPMSolverMultistepKarras"
        } else {
            "DPMSolverMultistep"
        }
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let spaced = self.spaced_timesteps(num_inference_steps)?;
        let mut timesteps = self.sigmas.fit(spaced, self.config.use_karras_sigmas);
        if self.config.use_karras_sigmas {
            // Karras timesteps are integral here, unlike Euler's.
            timesteps.iter_mut().for_each(|t| *t = t.round_ties_even());
        }
        self.model_outputs.clear();
        self.lower_order_nums = 0;
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
        let steps = self.progress.timesteps.len();

        let original =
            self.convert_model_output(&model_output, &sample, self.sigmas.sigmas[index])?;
        if self.model_outputs.len() == SOLVER_ORDER {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(original.clone());

        let final_step = index + 1 == steps;
        let use_first_order = final_step
            || self.lower_order_nums < 1
            || index == 0
            || self.model_outputs.len() < SOLVER_ORDER;

        let prev_sample = if use_first_order {
            self.first_order_update(&original, &sample, index)?
        } else {
            self.second_order_update(&sample, index)?
        };

        if self.lower_order_nums < SOLVER_ORDER {
            self.lower_order_nums += 1;
        }
        Ok(prev_sample)
    }
}
