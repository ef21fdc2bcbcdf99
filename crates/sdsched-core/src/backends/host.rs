//! Host-numeric adapter: the engine runs on host tensors.

use candle_core::Tensor;

use super::{ExecutionBackend, SchedulerAdapter};
use crate::engine::{Initialized, PreparedInput, SchedulingEngine};
use crate::error::Result;
use crate::runtime::ExecutionContext;

/// Fetches every input to the host, runs the engine there, and re-wraps
/// results on the context device at the context precision.
pub struct HostAdapter {
    engine: SchedulingEngine,
    context: ExecutionContext,
}

impl HostAdapter {
    pub fn new(engine: SchedulingEngine, context: ExecutionContext) -> Self {
        Self { engine, context }
    }
}

impl SchedulerAdapter for HostAdapter {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::HostNumeric
    }

    fn initialize(&mut self, sample: &Tensor) -> Result<Initialized> {
        let host = self.context.unwrap(sample)?;
        let init = self.engine.initialize(&host)?;
        Ok(Initialized {
            sample: self.context.wrap(&init.sample)?,
            time_ids: self.context.wrap(&init.time_ids)?,
            step_count: init.step_count,
        })
    }

    fn prepare_input(&mut self, sample: &Tensor, step_index: usize) -> Result<PreparedInput> {
        let host = self.context.unwrap(sample)?;
        let prepared = self.engine.prepare_input(&host, step_index)?;
        Ok(PreparedInput {
            model_input: self.context.wrap(&prepared.model_input)?,
            timestep: prepared.timestep,
        })
    }

    fn step(
        &mut self,
        noise_pred: &Tensor,
        timestep: f64,
        sample: &Tensor,
        guidance_scale: f64,
        step_index: usize,
    ) -> Result<Tensor> {
        let noise_pred = self.context.unwrap(noise_pred)?;
        let sample = self.context.unwrap(sample)?;
        let refined = self
            .engine
            .step(&noise_pred, timestep, &sample, guidance_scale, step_index)?;
        self.context.wrap(&refined)
    }
}
