//! Reference step loop around a scheduler adapter.

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::backends::SchedulerAdapter;
use crate::error::{Error, Result};

/// The external generative network: `(latent_input, timestep, time_ids) -> noise_pred`.
pub trait NoisePredictor {
    fn predict(&mut self, model_input: &Tensor, timestep: f64, time_ids: &Tensor) -> Result<Tensor>;
}

impl<F> NoisePredictor for F
where
    F: FnMut(&Tensor, f64, &Tensor) -> Result<Tensor>,
{
    fn predict(
        &mut self,
        model_input: &Tensor,
        timestep: f64,
        time_ids: &Tensor,
    ) -> Result<Tensor> {
        self(model_input, timestep, time_ids)
    }
}

/// Predicts zero noise for every input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNoisePredictor;

impl NoisePredictor for ZeroNoisePredictor {
    fn predict(
        &mut self,
        model_input: &Tensor,
        _timestep: f64,
        _time_ids: &Tensor,
    ) -> Result<Tensor> {
        Ok(model_input.zeros_like()?)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub latent: Tensor,
    pub steps: usize,
    /// Sample after each step, when recording was requested
    pub intermediates: Option<Vec<Tensor>>,
}

#[derive(Debug, Clone)]
pub struct StepPipeline {
    guidance_scale: f64,
    record_intermediates: bool,
}

impl StepPipeline {
    pub fn new(guidance_scale: f64) -> Self {
        Self {
            guidance_scale,
            record_intermediates: false,
        }
    }

    pub fn record_intermediates(mut self, record: bool) -> Self {
        self.record_intermediates = record;
        self
    }

    pub fn run(
        &self,
        adapter: &mut dyn SchedulerAdapter,
        sample: &Tensor,
        network: &mut dyn NoisePredictor,
    ) -> Result<PipelineOutput> {
        let init = adapter.initialize(sample)?;
        info!(
            "Running {} steps on {:?}",
            init.step_count,
            adapter.backend()
        );

        let mut sample = init.sample;
        let mut intermediates = self.record_intermediates.then(Vec::new);
        for i in 0..init.step_count {
            let prepared = adapter.prepare_input(&sample, i)?;
            let noise_pred =
                network.predict(&prepared.model_input, prepared.timestep, &init.time_ids)?;
            sample = adapter.step(
                &noise_pred,
                prepared.timestep,
                &sample,
                self.guidance_scale,
                i,
            )?;
            debug!("Completed step {}/{}", i + 1, init.step_count);
            if let Some(samples) = intermediates.as_mut() {
                samples.push(sample.clone());
            }
        }

        Ok(PipelineOutput {
            latent: sample,
            steps: init.step_count,
            intermediates,
        })
    }
}

/// Largest absolute elementwise difference between two equally shaped tensors.
pub fn largest_error(a: &Tensor, b: &Tensor) -> Result<f32> {
    if a.dims() != b.dims() {
        return Err(Error::shape("comparison", a.dims(), b.dims()));
    }
    let a = a.to_device(&candle_core::Device::Cpu)?.to_dtype(DType::F32)?;
    let b = b.to_device(&candle_core::Device::Cpu)?.to_dtype(DType::F32)?;
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}
