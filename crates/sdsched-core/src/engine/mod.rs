//! Scheduling engine: one algorithm plus one run configuration.
//!
//! The engine is the numeric state machine of a sampling run:
//!
//! ```text
//! initialize(sample) ─► prepare_input(sample, i) ─► network ─► step(noise, t, sample, g, i)
//!                              ▲                                        │
//!                              └─────────────── i + 1 < step_count ─────┘
//! ```
//!
//! Callers drive indices `0..step_count` strictly in order. The engine forces
//! the algorithm's step index to the supplied value before every step rather
//! than letting the algorithm count on its own.

mod conditioning;
mod types;

pub use conditioning::{time_ids, time_ids_row};
pub use types::{EnginePhase, Initialized, PreparedInput};

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::algorithms::{Algorithm, AlgorithmConfig};
use crate::catalog::SchedulerId;
use crate::config::SamplingConfig;
use crate::error::{Error, Result};

pub struct SchedulingEngine {
    config: SamplingConfig,
    algorithm: Box<dyn Algorithm>,
    phase: EnginePhase,
}

impl SchedulingEngine {
    /// Wrap `algorithm` and populate its timesteps for the configured step count.
    pub fn new(config: SamplingConfig, mut algorithm: Box<dyn Algorithm>) -> Result<Self> {
        config.validate()?;
        algorithm.set_timesteps(config.num_inference_steps)?;

        info!(
            "Scheduling engine ready: {} with {} steps, {}x{} batch {} at {}",
            algorithm.name(),
            algorithm.timesteps().len(),
            config.height,
            config.width,
            config.batch_size,
            config.precision
        );

        Ok(Self {
            config,
            algorithm,
            phase: EnginePhase::Created,
        })
    }

    pub fn from_catalog(
        config: SamplingConfig,
        id: SchedulerId,
        algorithm_config: &AlgorithmConfig,
    ) -> Result<Self> {
        Self::new(config, id.create(algorithm_config)?)
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn timesteps(&self) -> &[f64] {
        self.algorithm.timesteps()
    }

    pub fn step_count(&self) -> usize {
        self.algorithm.timesteps().len()
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.algorithm.init_noise_sigma()
    }

    /// The algorithm's current (forced) step index.
    pub fn step_index(&self) -> Option<usize> {
        self.algorithm.step_index()
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    fn dtype(&self) -> DType {
        self.config.dtype()
    }

    /// Scale the initial sample by the init-noise sigma and build the time ids.
    pub fn initialize(&mut self, sample: &Tensor) -> Result<Initialized> {
        if self.phase == EnginePhase::Complete {
            return Err(Error::ConfigError(
                "sampling run is complete; create a new engine to sample again".into(),
            ));
        }
        self.check_sample(sample)?;

        let sigma = self.algorithm.init_noise_sigma();
        let scaled = sample
            .to_dtype(DType::F32)?
            .affine(sigma, 0.0)?
            .to_dtype(self.dtype())?;
        let time_ids = time_ids(&self.config, sample.device())?;
        let step_count = self.step_count();

        self.phase = EnginePhase::Running;
        debug!(
            "Initialized {} run: init_noise_sigma={sigma:.4}, step_count={step_count}",
            self.algorithm.name()
        );

        Ok(Initialized {
            sample: scaled,
            time_ids,
            step_count,
        })
    }

    /// Resolve the timestep at `step_index` and build the network input.
    pub fn prepare_input(&self, sample: &Tensor, step_index: usize) -> Result<PreparedInput> {
        self.ensure_running("prepare_input")?;
        self.check_index(step_index)?;
        self.check_sample(sample)?;

        let timestep = self.algorithm.timesteps()[step_index];
        let latent = if self.config.do_classifier_free_guidance {
            Tensor::cat(&[sample, sample], 0)?
        } else {
            sample.clone()
        };
        let model_input = self
            .algorithm
            .scale_model_input(&latent, timestep)?
            .to_dtype(self.dtype())?;

        debug!("prepare_input: step {step_index}, t={timestep}");
        Ok(PreparedInput {
            model_input,
            timestep,
        })
    }

    /// Apply guidance to `noise_pred` and advance the sample by one step.
    ///
    /// All argument checks run before the algorithm state is touched.
    pub fn step(
        &mut self,
        noise_pred: &Tensor,
        timestep: f64,
        sample: &Tensor,
        guidance_scale: f64,
        step_index: usize,
    ) -> Result<Tensor> {
        self.ensure_running("step")?;
        self.check_index(step_index)?;
        self.check_sample(sample)?;
        self.check_noise_pred(noise_pred)?;

        self.algorithm.set_step_index(step_index);
        let guided = if self.config.do_classifier_free_guidance {
            combine_guidance(noise_pred, guidance_scale)?
        } else {
            noise_pred.clone()
        };
        let refined = self
            .algorithm
            .step(&guided, timestep, sample)?
            .to_dtype(self.dtype())?;

        if step_index + 1 == self.step_count() {
            self.phase = EnginePhase::Complete;
            debug!("{} run complete after step {step_index}", self.algorithm.name());
        } else {
            debug!("step: index {step_index}, t={timestep}, guidance={guidance_scale}");
        }
        Ok(refined)
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        match self.phase {
            EnginePhase::Running => Ok(()),
            EnginePhase::Created => Err(Error::ConfigError(format!(
                "{operation} called before initialize"
            ))),
            EnginePhase::Complete => Err(Error::ConfigError(format!(
                "{operation} called after the final step; the engine is not reusable"
            ))),
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let step_count = self.step_count();
        if index >= step_count {
            return Err(Error::StepIndexOutOfRange { index, step_count });
        }
        Ok(())
    }

    fn check_sample(&self, sample: &Tensor) -> Result<()> {
        let (b, c, h, w) = self.config.latent_shape();
        if sample.dims() != [b, c, h, w] {
            return Err(Error::shape("sample", &[b, c, h, w], sample.dims()));
        }
        Ok(())
    }

    fn check_noise_pred(&self, noise_pred: &Tensor) -> Result<()> {
        let (_, c, h, w) = self.config.latent_shape();
        let expected = [self.config.model_batch(), c, h, w];
        if noise_pred.dims() != expected {
            return Err(Error::shape("noise_pred", &expected, noise_pred.dims()));
        }
        Ok(())
    }
}

/// `uncond + scale * (cond - uncond)` over the two batch halves of `noise_pred`.
///
/// The result is F32 and has half the batch of the input.
pub fn combine_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let dims = noise_pred.dims();
    let batch = dims.first().copied().unwrap_or(0);
    if batch == 0 || batch % 2 != 0 {
        let mut expected = dims.to_vec();
        if let Some(first) = expected.first_mut() {
            *first = (batch + 1) / 2 * 2;
        }
        return Err(Error::shape("noise_pred", &expected, dims));
    }
    let noise_pred = noise_pred.to_dtype(DType::F32)?;
    let uncond = noise_pred.narrow(0, 0, batch / 2)?;
    let cond = noise_pred.narrow(0, batch / 2, batch / 2)?;
    let delta = (cond - &uncond)?.affine(guidance_scale, 0.0)?;
    Ok((uncond + delta)?)
}
