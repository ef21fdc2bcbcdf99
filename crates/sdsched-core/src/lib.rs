//! sdsched core - diffusion scheduling engine
//!
//! This crate drives the iterative denoising loop of diffusion sampling. A
//! [`SchedulingEngine`] hosts one pluggable algorithm (DDIM, DDPM, Euler,
//! Euler ancestral, DPM-Solver++ 2M, LMS, LCM) and exposes `initialize`,
//! `prepare_input` and `step`. The same three operations run either on host
//! numerics or through a compiled module on a separate execution context.
//!
//! # Architecture
//!
//! ```text
//! StepPipeline ─► SchedulerAdapter ─► SchedulingEngine ─► Algorithm
//!                 ├ HostAdapter       (host tensors, wrap/unwrap)
//!                 └ CompiledAdapter   (run_initialize / run_scale / run_step)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sdsched_core::{build_adapter, BackendRouter, ExecutionContext, ExportedModules};
//! use sdsched_core::{AlgorithmConfig, Precision, SamplingConfig, SchedulerId, StepPipeline};
//! use sdsched_core::ZeroNoisePredictor;
//!
//! let config = SamplingConfig::new(1024, 1024, 1, 30);
//! let context = ExecutionContext::cpu(Precision::Half);
//! let modules = ExportedModules::new(context.clone());
//! let mut adapter = build_adapter(
//!     &BackendRouter::from_env(),
//!     SchedulerId::EulerDiscrete,
//!     &config,
//!     &AlgorithmConfig::default(),
//!     &context,
//!     &modules,
//! )?;
//! let output = StepPipeline::new(config.guidance_scale)
//!     .run(adapter.as_mut(), &latents, &mut ZeroNoisePredictor)?;
//! ```

pub mod algorithms;
pub mod backends;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod runtime;

pub use algorithms::{Algorithm, AlgorithmConfig, BetaSchedule, PredictionType, TimestepSpacing};
pub use backends::{
    build_adapter, BackendPlan, BackendRouter, CompiledAdapter, ExecutionBackend, HostAdapter,
    SchedulerAdapter,
};
pub use catalog::{parse_scheduler_id, SchedulerId};
pub use config::{Precision, RuntimeConfig, SamplingConfig};
pub use engine::{combine_guidance, EnginePhase, Initialized, PreparedInput, SchedulingEngine};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{largest_error, NoisePredictor, PipelineOutput, StepPipeline, ZeroNoisePredictor};
pub use runtime::{
    create_safe_name, CompiledModule, ExecutionContext, ExportedModules, ModuleArtifact,
    ModuleSource,
};
