//! Backend routing primitives.
//!
//! The pipeline talks to one [`SchedulerAdapter`] and never learns which
//! strategy backs it. Selection is a construction-time decision: if the
//! module source carries a compiled module for the artifact (and compiled
//! modules are enabled), the compiled-module adapter is used; otherwise the
//! engine runs on host numerics.

mod compiled;
mod host;

pub use compiled::CompiledAdapter;
pub use host::HostAdapter;

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::algorithms::AlgorithmConfig;
use crate::catalog::SchedulerId;
use crate::config::{RuntimeConfig, SamplingConfig};
use crate::engine::{Initialized, PreparedInput, SchedulingEngine};
use crate::error::Result;
use crate::runtime::{ExecutionContext, ModuleArtifact, ModuleSource};

/// The three-operation contract shared by both strategies.
///
/// Inputs and outputs are resident on the adapter's execution context at
/// its precision. Both strategies apply the same argument checks and
/// lifecycle rules as [`SchedulingEngine`].
pub trait SchedulerAdapter: Send {
    fn backend(&self) -> ExecutionBackend;

    fn initialize(&mut self, sample: &Tensor) -> Result<Initialized>;

    fn prepare_input(&mut self, sample: &Tensor, step_index: usize) -> Result<PreparedInput>;

    fn step(
        &mut self,
        noise_pred: &Tensor,
        timestep: f64,
        sample: &Tensor,
        guidance_scale: f64,
        step_index: usize,
    ) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionBackend {
    HostNumeric,
    CompiledModule,
}

#[derive(Debug, Clone)]
pub struct BackendPlan {
    pub backend: ExecutionBackend,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BackendRouter {
    compiled_enabled: bool,
    target: String,
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

impl BackendRouter {
    pub fn from_env() -> Self {
        Self::from_runtime(&RuntimeConfig::from_env())
    }

    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            compiled_enabled: runtime.compiled_modules_enabled,
            target: runtime.target.clone(),
        }
    }

    pub fn host_only() -> Self {
        Self {
            compiled_enabled: false,
            ..Self::default()
        }
    }

    pub fn compiled_enabled(&self) -> bool {
        self.compiled_enabled
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn artifact(&self, id: SchedulerId, config: &SamplingConfig) -> ModuleArtifact {
        ModuleArtifact::new(id, config, self.target.clone())
    }

    pub fn select(&self, artifact: &ModuleArtifact, source: &dyn ModuleSource) -> BackendPlan {
        match (self.compiled_enabled, source.contains(artifact)) {
            (true, true) => BackendPlan {
                backend: ExecutionBackend::CompiledModule,
                reason: format!("{artifact} is available as a compiled module"),
            },
            (true, false) => BackendPlan {
                backend: ExecutionBackend::HostNumeric,
                reason: format!("{artifact} has no compiled module; using host numerics"),
            },
            (false, _) => BackendPlan {
                backend: ExecutionBackend::HostNumeric,
                reason: format!(
                    "compiled modules are disabled; running {artifact} on host numerics"
                ),
            },
        }
    }
}

/// Build the adapter the router selects for `id` under `config`.
///
/// The context is re-targeted to the configured precision when the two differ.
pub fn build_adapter(
    router: &BackendRouter,
    id: SchedulerId,
    config: &SamplingConfig,
    algorithm_config: &AlgorithmConfig,
    context: &ExecutionContext,
    source: &dyn ModuleSource,
) -> Result<Box<dyn SchedulerAdapter>> {
    config.validate()?;
    let context = if context.precision() != config.precision {
        warn!(
            "Execution context is {}, sampling config requests {}; using {}",
            context.precision(),
            config.precision,
            config.precision
        );
        context.with_precision(config.precision)
    } else {
        context.clone()
    };

    let artifact = router.artifact(id, config);
    let plan = router.select(&artifact, source);
    info!(
        "Backend plan for {id} on {}: {:?} ({})",
        context.kind().as_str(),
        plan.backend,
        plan.reason
    );

    match plan.backend {
        ExecutionBackend::CompiledModule => {
            let adapter = CompiledAdapter::new(source.load(&artifact)?, context)?;
            debug!("Loaded compiled module {}", adapter.module_name());
            Ok(Box::new(adapter))
        }
        ExecutionBackend::HostNumeric => {
            let engine = SchedulingEngine::from_catalog(config.clone(), id, algorithm_config)?;
            Ok(Box::new(HostAdapter::new(engine, context)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::error::ErrorKind;
    use crate::runtime::ExportedModules;
    use candle_core::{DType, Device};

    fn sampling() -> SamplingConfig {
        SamplingConfig::new(64, 64, 1, 4).with_precision(Precision::Full)
    }

    fn exported(id: SchedulerId, router: &BackendRouter) -> ExportedModules {
        let mut modules = ExportedModules::new(ExecutionContext::cpu(Precision::Full));
        modules.export(&router.artifact(id, &sampling()), AlgorithmConfig::default());
        modules
    }

    #[test]
    fn compiled_module_selected_when_available() {
        let router = BackendRouter::default();
        let modules = exported(SchedulerId::Ddim, &router);
        let plan = router.select(&router.artifact(SchedulerId::Ddim, &sampling()), &modules);
        assert_eq!(plan.backend, ExecutionBackend::CompiledModule);

        let plan = router.select(&router.artifact(SchedulerId::Ddpm, &sampling()), &modules);
        assert_eq!(plan.backend, ExecutionBackend::HostNumeric);
        assert!(plan.reason.contains("no compiled module"));
    }

    #[test]
    fn router_reads_runtime_config() {
        let runtime = RuntimeConfig {
            compiled_modules_enabled: false,
            target: "rocm-gfx942".to_string(),
            ..Default::default()
        };
        let router = BackendRouter::from_runtime(&runtime);
        assert!(!router.compiled_enabled());
        assert_eq!(router.target(), "rocm-gfx942");
        let artifact = router.artifact(SchedulerId::Ddim, &sampling());
        assert!(artifact.name().ends_with("_4_rocm-gfx942"));
        assert!(BackendRouter::default().compiled_enabled());
        assert!(!BackendRouter::host_only().compiled_enabled());
    }

    #[test]
    fn disabled_router_always_uses_host() {
        let router = BackendRouter::host_only();
        let modules = exported(SchedulerId::Ddim, &router);
        let plan = router.select(&router.artifact(SchedulerId::Ddim, &sampling()), &modules);
        assert_eq!(plan.backend, ExecutionBackend::HostNumeric);
        assert!(plan.reason.contains("disabled"));
    }

    #[test]
    fn build_adapter_follows_plan() {
        let router = BackendRouter::default();
        let modules = exported(SchedulerId::Ddim, &router);
        let ctx = ExecutionContext::cpu(Precision::Full);
        let config = sampling();
        let alg = AlgorithmConfig::default();

        let compiled =
            build_adapter(&router, SchedulerId::Ddim, &config, &alg, &ctx, &modules).unwrap();
        assert_eq!(compiled.backend(), ExecutionBackend::CompiledModule);
        let host =
            build_adapter(&router, SchedulerId::EulerDiscrete, &config, &alg, &ctx, &modules)
                .unwrap();
        assert_eq!(host.backend(), ExecutionBackend::HostNumeric);
    }

    #[test]
    fn host_adapter_wraps_at_context_precision() {
        let router = BackendRouter::host_only();
        let modules = ExportedModules::new(ExecutionContext::cpu(Precision::Half));
        let config = SamplingConfig::new(64, 64, 1, 4);
        let ctx = ExecutionContext::cpu(Precision::Half);
        let mut adapter = build_adapter(
            &router,
            SchedulerId::EulerDiscrete,
            &config,
            &AlgorithmConfig::default(),
            &ctx,
            &modules,
        )
        .unwrap();

        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let init = adapter.initialize(&sample).unwrap();
        assert_eq!(init.sample.dtype(), DType::F16);
        assert_eq!(init.time_ids.dtype(), DType::F16);
        let prepared = adapter.prepare_input(&init.sample, 0).unwrap();
        assert_eq!(prepared.model_input.dtype(), DType::F16);
    }

    #[test]
    fn adapters_surface_engine_errors() {
        let router = BackendRouter::default();
        let modules = exported(SchedulerId::Ddim, &router);
        let ctx = ExecutionContext::cpu(Precision::Full);
        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();

        for id in [SchedulerId::Ddim, SchedulerId::Ddpm] {
            let mut adapter = build_adapter(
                &router,
                id,
                &sampling(),
                &AlgorithmConfig::default(),
                &ctx,
                &modules,
            )
            .unwrap();
            let err = adapter.prepare_input(&sample, 0).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{:?}", adapter.backend());
            adapter.initialize(&sample).unwrap();
            let err = adapter.prepare_input(&sample, 4).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IndexRange, "{:?}", adapter.backend());
        }
    }
}
