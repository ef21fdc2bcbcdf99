//! Compiled-module adapter: every operation is an entry-point invocation.

use candle_core::{DType, Tensor};

use super::{ExecutionBackend, SchedulerAdapter};
use crate::engine::{Initialized, PreparedInput};
use crate::error::{Error, Result};
use crate::runtime::{CompiledModule, ExecutionContext, RUN_INITIALIZE, RUN_SCALE, RUN_STEP};

/// Tensors cross the boundary already resident on the context device.
pub struct CompiledAdapter {
    module: Box<dyn CompiledModule>,
    context: ExecutionContext,
}

impl CompiledAdapter {
    pub fn new(module: Box<dyn CompiledModule>, context: ExecutionContext) -> Result<Self> {
        for entry in [RUN_INITIALIZE, RUN_SCALE, RUN_STEP] {
            if !module.entry_points().contains(&entry) {
                return Err(Error::BackendError(format!(
                    "Module {} does not export {entry}",
                    module.name()
                )));
            }
        }
        Ok(Self { module, context })
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    fn ensure_resident(&self, argument: &str, tensor: &Tensor) -> Result<()> {
        if !self.context.is_resident(tensor) {
            return Err(Error::BackendError(format!(
                "{argument} is on {:?}, expected the module device {:?}",
                tensor.device().location(),
                self.context.device().location()
            )));
        }
        Ok(())
    }

    fn call<const N: usize>(&mut self, entry: &str, args: &[Tensor]) -> Result<[Tensor; N]> {
        let results = self.module.invoke(entry, args)?;
        let count = results.len();
        results.try_into().map_err(|_| {
            Error::BackendError(format!(
                "{}::{entry} returned {count} results, expected {N}",
                self.module.name()
            ))
        })
    }
}

impl SchedulerAdapter for CompiledAdapter {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::CompiledModule
    }

    fn initialize(&mut self, sample: &Tensor) -> Result<Initialized> {
        self.ensure_resident("sample", sample)?;
        let [sample, time_ids, step_count] = self.call::<3>(RUN_INITIALIZE, &[sample.clone()])?;
        let step_count = step_count.to_dtype(DType::I64)?.to_scalar::<i64>()?;
        let step_count = usize::try_from(step_count).map_err(|_| {
            Error::BackendError(format!("{RUN_INITIALIZE} returned step count {step_count}"))
        })?;
        Ok(Initialized {
            sample,
            time_ids,
            step_count,
        })
    }

    fn prepare_input(&mut self, sample: &Tensor, step_index: usize) -> Result<PreparedInput> {
        self.ensure_resident("sample", sample)?;
        let index = self.context.index(step_index)?;
        let [model_input, timestep] = self.call::<2>(RUN_SCALE, &[sample.clone(), index])?;
        let timestep = timestep.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        Ok(PreparedInput {
            model_input,
            timestep,
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
        self.ensure_resident("noise_pred", noise_pred)?;
        self.ensure_resident("sample", sample)?;
        let args = [
            noise_pred.clone(),
            self.context.scalar(timestep)?,
            sample.clone(),
            self.context.scalar(guidance_scale)?,
            self.context.index(step_index)?,
        ];
        let [refined] = self.call::<1>(RUN_STEP, &args)?;
        Ok(refined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::error::ErrorKind;
    use candle_core::Device;

    /// Module that answers every entry point with `results` copies of its first argument.
    struct CannedModule {
        entry_points: Vec<&'static str>,
        results: usize,
    }

    impl CompiledModule for CannedModule {
        fn name(&self) -> &str {
            "canned"
        }

        fn entry_points(&self) -> &[&'static str] {
            &self.entry_points
        }

        fn invoke(&mut self, _entry: &str, args: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![args[0].clone(); self.results])
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::cpu(Precision::Full)
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let module = CannedModule {
            entry_points: vec![RUN_INITIALIZE, RUN_SCALE],
            results: 3,
        };
        let Err(err) = CompiledAdapter::new(Box::new(module), context()) else {
            panic!("module without run_step was accepted");
        };
        assert_eq!(err.kind(), ErrorKind::BackendExecution);
        assert!(err.to_string().contains(RUN_STEP));
    }

    #[test]
    fn wrong_result_arity_is_rejected() {
        let module = CannedModule {
            entry_points: vec![RUN_INITIALIZE, RUN_SCALE, RUN_STEP],
            results: 2,
        };
        let mut adapter = CompiledAdapter::new(Box::new(module), context()).unwrap();
        assert_eq!(adapter.module_name(), "canned");

        let sample = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let err = adapter.initialize(&sample).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendExecution);
        assert!(err.to_string().contains("returned 2 results, expected 3"));

        let err = adapter.step(&sample, 1.0, &sample, 1.0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendExecution);
    }
}
