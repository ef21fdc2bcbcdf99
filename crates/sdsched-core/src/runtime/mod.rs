//! Execution runtime for compiled scheduler modules.
//!
//! An [`ExecutionContext`] owns the destination device and precision. A
//! [`ModuleSource`] hands out [`CompiledModule`]s keyed by [`ModuleArtifact`];
//! [`ExportedModules`] is the in-process source that runs a scheduling engine
//! directly on the context device.

mod context;
mod device;
mod module;

pub use context::ExecutionContext;
pub use device::{DeviceKind, DeviceProfile, DeviceSelector};
pub use module::{
    create_safe_name, CompiledModule, ExportedModules, ExportedSchedulerModule, ModuleArtifact,
    ModuleSource, RUN_INITIALIZE, RUN_SCALE, RUN_STEP, SCHEDULER_ENTRY_POINTS,
};
