//! Values returned by the scheduling engine.

use candle_core::Tensor;

/// Lifecycle of a single sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Timesteps are set; `initialize` has not been called yet.
    Created,
    /// Between `initialize` and the final step.
    Running,
    /// The step at index `step_count - 1` has completed.
    Complete,
}

/// Output of [`SchedulingEngine::initialize`](super::SchedulingEngine::initialize).
#[derive(Debug, Clone)]
pub struct Initialized {
    /// Input sample scaled by the algorithm's init-noise sigma
    pub sample: Tensor,
    /// Time conditioning ids, `(2b, 6)` with guidance else `(b, 6)`
    pub time_ids: Tensor,
    /// Number of steps the caller must drive
    pub step_count: usize,
}

/// Network input for one step.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub model_input: Tensor,
    pub timestep: f64,
}
