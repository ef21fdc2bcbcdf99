//! Compiled scheduler modules and their artifact naming.

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use super::context::ExecutionContext;
use crate::algorithms::AlgorithmConfig;
use crate::catalog::SchedulerId;
use crate::config::{Precision, SamplingConfig};
use crate::engine::SchedulingEngine;
use crate::error::{Error, Result};

pub const RUN_INITIALIZE: &str = "run_initialize";
pub const RUN_SCALE: &str = "run_scale";
pub const RUN_STEP: &str = "run_step";

pub const SCHEDULER_ENTRY_POINTS: &[&str] = &[RUN_INITIALIZE, RUN_SCALE, RUN_STEP];

/// A precompiled executable unit invoked by entry-point name.
///
/// Argument and result layouts of the scheduler entry points:
///
/// | entry            | arguments                                               | results                                   |
/// |------------------|---------------------------------------------------------|-------------------------------------------|
/// | `run_initialize` | `[sample]`                                              | `[sample, time_ids, step_count: i64]`     |
/// | `run_scale`      | `[sample, step_index: i64]`                             | `[model_input, timestep: f32]`            |
/// | `run_step`       | `[noise_pred, timestep, sample, guidance, step_index]`  | `[sample]`                                |
pub trait CompiledModule: Send {
    fn name(&self) -> &str;

    fn entry_points(&self) -> &[&'static str];

    fn invoke(&mut self, entry: &str, args: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Identity of one compiled scheduler module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleArtifact {
    pub scheduler: SchedulerId,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub precision: Precision,
    pub num_inference_steps: usize,
    pub target: String,
    /// Not encoded in the name
    pub do_classifier_free_guidance: bool,
    pub latent_channels: usize,
}

impl ModuleArtifact {
    pub fn new(scheduler: SchedulerId, config: &SamplingConfig, target: impl Into<String>) -> Self {
        Self {
            scheduler,
            batch_size: config.batch_size,
            height: config.height,
            width: config.width,
            precision: config.precision,
            num_inference_steps: config.num_inference_steps,
            target: target.into(),
            do_classifier_free_guidance: config.do_classifier_free_guidance,
            latent_channels: config.latent_channels,
        }
    }

    /// `{Id}Scheduler_bs{b}_{h}x{w}_{precision}_{steps}_{target}`
    pub fn name(&self) -> String {
        format!(
            "{}Scheduler_bs{}_{}x{}_{}_{}_{}",
            self.scheduler.as_str(),
            self.batch_size,
            self.height,
            self.width,
            self.precision,
            self.num_inference_steps,
            self.target
        )
    }

    /// File-system safe name prefixed by the model's repo tail.
    pub fn safe_name(&self, model_id: &str) -> String {
        create_safe_name(model_id, &format!("_{}", self.name()))
    }
}

impl fmt::Display for ModuleArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Last path segment of `model_id` plus `suffix`, with `-` and `.` replaced by `_`.
pub fn create_safe_name(model_id: &str, suffix: &str) -> String {
    let tail = model_id.rsplit('/').next().unwrap_or(model_id).trim();
    format!("{tail}{suffix}").replace(['-', '.'], "_")
}

/// Where compiled modules come from.
pub trait ModuleSource: Send + Sync {
    fn contains(&self, artifact: &ModuleArtifact) -> bool;

    /// A fresh module instance with its own scheduling state.
    fn load(&self, artifact: &ModuleArtifact) -> Result<Box<dyn CompiledModule>>;
}

/// In-process exports: scheduler engines that run entirely on the context device.
#[derive(Debug, Clone)]
pub struct ExportedModules {
    context: ExecutionContext,
    exports: HashMap<ModuleArtifact, AlgorithmConfig>,
}

impl ExportedModules {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            exports: HashMap::new(),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Register `artifact` so later `load` calls can instantiate it.
    pub fn export(&mut self, artifact: &ModuleArtifact, algorithm_config: AlgorithmConfig) {
        info!("Exported scheduler module {artifact}");
        self.exports.insert(artifact.clone(), algorithm_config);
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

impl ModuleSource for ExportedModules {
    fn contains(&self, artifact: &ModuleArtifact) -> bool {
        self.exports.contains_key(artifact)
    }

    fn load(&self, artifact: &ModuleArtifact) -> Result<Box<dyn CompiledModule>> {
        let name = artifact.name();
        let algorithm_config = self
            .exports
            .get(artifact)
            .ok_or_else(|| Error::BackendError(format!("Module {name} has not been exported")))?;
        if artifact.precision != self.context.precision() {
            return Err(Error::ConfigError(format!(
                "Module {name} is {} but the execution context is {}",
                artifact.precision,
                self.context.precision()
            )));
        }
        Ok(Box::new(ExportedSchedulerModule::new(
            artifact,
            algorithm_config,
            self.context.clone(),
        )?))
    }
}

/// A scheduling engine exposed through the three scheduler entry points.
pub struct ExportedSchedulerModule {
    name: String,
    engine: SchedulingEngine,
    context: ExecutionContext,
}

impl ExportedSchedulerModule {
    pub fn new(
        artifact: &ModuleArtifact,
        algorithm_config: &AlgorithmConfig,
        context: ExecutionContext,
    ) -> Result<Self> {
        let config = SamplingConfig {
            height: artifact.height,
            width: artifact.width,
            batch_size: artifact.batch_size,
            precision: artifact.precision,
            num_inference_steps: artifact.num_inference_steps,
            do_classifier_free_guidance: artifact.do_classifier_free_guidance,
            latent_channels: artifact.latent_channels,
            ..Default::default()
        };
        let engine = SchedulingEngine::from_catalog(config, artifact.scheduler, algorithm_config)?;
        Ok(Self {
            name: artifact.name(),
            engine,
            context,
        })
    }

    fn initialize(&mut self, args: &[Tensor]) -> Result<Vec<Tensor>> {
        let [sample] = expect_args::<1>(RUN_INITIALIZE, args)?;
        let init = self.engine.initialize(sample)?;
        let step_count = self.context.index(init.step_count)?;
        Ok(vec![init.sample, init.time_ids, step_count])
    }

    fn scale(&mut self, args: &[Tensor]) -> Result<Vec<Tensor>> {
        let [sample, step_index] = expect_args::<2>(RUN_SCALE, args)?;
        let prepared = self
            .engine
            .prepare_input(sample, read_index(RUN_SCALE, step_index)?)?;
        Ok(vec![prepared.model_input, self.context.scalar(prepared.timestep)?])
    }

    fn step(&mut self, args: &[Tensor]) -> Result<Vec<Tensor>> {
        let [noise_pred, timestep, sample, guidance, step_index] =
            expect_args::<5>(RUN_STEP, args)?;
        let refined = self.engine.step(
            noise_pred,
            read_scalar(timestep)?,
            sample,
            read_scalar(guidance)?,
            read_index(RUN_STEP, step_index)?,
        )?;
        Ok(vec![refined])
    }
}

impl CompiledModule for ExportedSchedulerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_points(&self) -> &[&'static str] {
        SCHEDULER_ENTRY_POINTS
    }

    fn invoke(&mut self, entry: &str, args: &[Tensor]) -> Result<Vec<Tensor>> {
        debug!("{}::{entry} with {} arguments", self.name, args.len());
        match entry {
            RUN_INITIALIZE => self.initialize(args),
            RUN_SCALE => self.scale(args),
            RUN_STEP => self.step(args),
            other => Err(Error::BackendError(format!(
                "Module {} has no entry point {other}",
                self.name
            ))),
        }
    }
}

fn expect_args<'a, const N: usize>(entry: &str, args: &'a [Tensor]) -> Result<&'a [Tensor; N]> {
    args.try_into().map_err(|_| {
        Error::BackendError(format!(
            "{entry} expects {N} arguments, got {}",
            args.len()
        ))
    })
}

fn read_scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

fn read_index(entry: &str, tensor: &Tensor) -> Result<usize> {
    let raw = tensor.to_dtype(DType::I64)?.to_scalar::<i64>()?;
    usize::try_from(raw)
        .map_err(|_| Error::BackendError(format!("{entry}: negative step index {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sampling() -> SamplingConfig {
        SamplingConfig::new(64, 64, 1, 4).with_precision(Precision::Full)
    }

    #[test]
    fn artifact_name_layout() {
        let config = SamplingConfig::new(1024, 1024, 1, 30);
        let artifact = ModuleArtifact::new(SchedulerId::EulerDiscrete, &config, "x86_64-linux-gnu");
        assert_eq!(
            artifact.name(),
            "EulerDiscreteScheduler_bs1_1024x1024_fp16_30_x86_64-linux-gnu"
        );
        assert_eq!(
            artifact.safe_name("stabilityai/stable-diffusion-xl-base-1.0"),
            "stable_diffusion_xl_base_1_0_EulerDiscreteScheduler_bs1_1024x1024_fp16_30_x86_64_linux_gnu"
        );
    }

    #[test]
    fn safe_name_without_namespace() {
        assert_eq!(create_safe_name("sdxl-turbo", "_vae"), "sdxl_turbo_vae");
    }

    #[test]
    fn load_requires_export() {
        let mut modules = ExportedModules::new(ExecutionContext::cpu(Precision::Full));
        let artifact = ModuleArtifact::new(SchedulerId::Ddim, &sampling(), "host");
        assert!(modules.is_empty());
        assert!(!modules.contains(&artifact));
        assert!(modules.load(&artifact).is_err());

        modules.export(&artifact, AlgorithmConfig::default());
        assert_eq!(modules.len(), 1);
        assert!(modules.contains(&artifact));
        let module = modules.load(&artifact).unwrap();
        assert_eq!(module.entry_points(), SCHEDULER_ENTRY_POINTS);
    }

    #[test]
    fn entry_points_follow_layout() {
        let ctx = ExecutionContext::cpu(Precision::Full);
        let artifact = ModuleArtifact::new(SchedulerId::Ddim, &sampling(), "host");
        let mut module =
            ExportedSchedulerModule::new(&artifact, &AlgorithmConfig::default(), ctx.clone())
                .unwrap();

        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let init = module.invoke(RUN_INITIALIZE, &[sample]).unwrap();
        assert_eq!(init.len(), 3);
        assert_eq!(init[1].dims(), &[2, 6]);
        assert_eq!(init[2].to_scalar::<i64>().unwrap(), 4);

        let scaled = module
            .invoke(RUN_SCALE, &[init[0].clone(), ctx.index(0).unwrap()])
            .unwrap();
        assert_eq!(scaled[0].dims(), &[2, 4, 8, 8]);
        assert_eq!(scaled[1].to_scalar::<f32>().unwrap(), 751.0);

        let noise = Tensor::zeros((2, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let out = module
            .invoke(
                RUN_STEP,
                &[
                    noise,
                    scaled[1].clone(),
                    init[0].clone(),
                    ctx.scalar(7.5).unwrap(),
                    ctx.index(0).unwrap(),
                ],
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dims(), &[1, 4, 8, 8]);
    }

    #[test]
    fn unknown_entry_and_bad_arity_fail() {
        let ctx = ExecutionContext::cpu(Precision::Full);
        let artifact = ModuleArtifact::new(SchedulerId::Ddim, &sampling(), "host");
        let mut module =
            ExportedSchedulerModule::new(&artifact, &AlgorithmConfig::default(), ctx).unwrap();
        assert!(module.invoke("run_decode", &[]).is_err());
        let err = module.invoke(RUN_INITIALIZE, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BackendExecution);
    }
}
