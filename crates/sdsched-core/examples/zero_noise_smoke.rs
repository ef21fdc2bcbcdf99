//! Full sampling run with a zero noise predictor on both backends.
//!
//! ```text
//! RUST_LOG=sdsched_core=debug cargo run -p sdsched-core --example zero_noise_smoke -- dpm++2m
//! ```

use anyhow::Result;
use candle_core::{DType, Tensor};
use sdsched_core::{
    build_adapter, largest_error, parse_scheduler_id, AlgorithmConfig, BackendRouter,
    ExecutionContext, ExportedModules, RuntimeConfig, SamplingConfig, StepPipeline,
    ZeroNoisePredictor,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zero_noise_smoke=info,sdsched_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let id = parse_scheduler_id(&std::env::args().nth(1).unwrap_or_else(|| "DDIM".into()))?;
    let runtime = RuntimeConfig::from_env();
    let config = SamplingConfig::new(512, 512, 1, 8);
    let algorithm_config = AlgorithmConfig::default().with_seed(42);

    let context = ExecutionContext::from_runtime(&runtime, config.precision)?;
    let router = BackendRouter::from_runtime(&runtime);
    let mut modules = ExportedModules::new(context.clone());
    modules.export(&router.artifact(id, &config), algorithm_config.clone());

    let (b, c, h, w) = config.latent_shape();
    let latents = context.wrap(&Tensor::randn(0f32, 1.0, (b, c, h, w), context.device())?)?;
    let pipeline = StepPipeline::new(config.guidance_scale);

    let mut compiled = build_adapter(&router, id, &config, &algorithm_config, &context, &modules)?;
    let compiled_out = pipeline.run(compiled.as_mut(), &latents, &mut ZeroNoisePredictor)?;

    let mut host = build_adapter(
        &BackendRouter::host_only(),
        id,
        &config,
        &algorithm_config,
        &context,
        &modules,
    )?;
    let host_out = pipeline.run(host.as_mut(), &latents, &mut ZeroNoisePredictor)?;

    let error = largest_error(&compiled_out.latent, &host_out.latent)?;
    let mean = host_out.latent.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
    info!(
        "{id}: {} steps on {:?} vs {:?}, largest error {error:.3e}, latent mean {mean:.4}",
        host_out.steps,
        compiled.backend(),
        host.backend()
    );
    Ok(())
}
