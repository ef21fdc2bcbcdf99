//! Cross-backend and end-to-end scheduling scenarios.

use candle_core::{DType, Device, Tensor};
use sdsched_core::{
    build_adapter, largest_error, AlgorithmConfig, BackendRouter, ErrorKind, ExecutionBackend,
    ExecutionContext, ExportedModules, Precision, Result, SamplingConfig, SchedulerAdapter,
    SchedulerId, StepPipeline, ZeroNoisePredictor,
};

const HALF_TOLERANCE: f32 = 5e-2;

fn sampling(steps: usize, precision: Precision) -> SamplingConfig {
    SamplingConfig::new(64, 64, 1, steps).with_precision(precision)
}

fn latents(config: &SamplingConfig, context: &ExecutionContext) -> Tensor {
    let (b, c, h, w) = config.latent_shape();
    let values: Vec<f32> = (0..b * c * h * w)
        .map(|i| ((i as f32) * 0.731).sin() * 0.8)
        .collect();
    let host = Tensor::from_vec(values, (b, c, h, w), &Device::Cpu).unwrap();
    context.wrap(&host).unwrap()
}

/// Deterministic stand-in for the network: a damped copy of its input.
fn damped(input: &Tensor, timestep: f64, _time_ids: &Tensor) -> Result<Tensor> {
    let scale = 0.05 + timestep / 20_000.0;
    Ok(input.to_dtype(DType::F32)?.affine(scale, 0.0)?.to_dtype(input.dtype())?)
}

struct Fixture {
    router: BackendRouter,
    context: ExecutionContext,
    modules: ExportedModules,
}

impl Fixture {
    fn new(precision: Precision) -> Self {
        Self {
            router: BackendRouter::default(),
            context: ExecutionContext::cpu(precision),
            modules: ExportedModules::new(ExecutionContext::cpu(precision)),
        }
    }

    fn export(&mut self, id: SchedulerId, config: &SamplingConfig) {
        let artifact = self.router.artifact(id, config);
        self.modules.export(&artifact, AlgorithmConfig::default().with_seed(7));
    }

    fn adapter(&self, id: SchedulerId, config: &SamplingConfig) -> Box<dyn SchedulerAdapter> {
        build_adapter(
            &self.router,
            id,
            config,
            &AlgorithmConfig::default().with_seed(7),
            &self.context,
            &self.modules,
        )
        .unwrap()
    }

    fn host_adapter(&self, id: SchedulerId, config: &SamplingConfig) -> Box<dyn SchedulerAdapter> {
        build_adapter(
            &BackendRouter::host_only(),
            id,
            config,
            &AlgorithmConfig::default().with_seed(7),
            &self.context,
            &self.modules,
        )
        .unwrap()
    }
}

#[test]
fn host_and_compiled_backends_agree_at_half_precision() {
    let config = sampling(6, Precision::Half);
    let mut fixture = Fixture::new(Precision::Half);
    for id in SchedulerId::all() {
        fixture.export(*id, &config);
    }

    for id in SchedulerId::all() {
        let mut host = fixture.host_adapter(*id, &config);
        let mut compiled = fixture.adapter(*id, &config);
        assert_eq!(host.backend(), ExecutionBackend::HostNumeric);
        assert_eq!(compiled.backend(), ExecutionBackend::CompiledModule);

        let sample = latents(&config, &fixture.context);
        let pipeline = StepPipeline::new(config.guidance_scale);
        let from_host = pipeline
            .run(host.as_mut(), &sample, &mut damped)
            .unwrap();
        let from_compiled = pipeline
            .run(compiled.as_mut(), &sample, &mut damped)
            .unwrap();

        assert_eq!(from_host.latent.dtype(), DType::F16);
        assert_eq!(from_compiled.latent.dtype(), DType::F16);
        let error = largest_error(&from_host.latent, &from_compiled.latent).unwrap();
        assert!(error < HALF_TOLERANCE, "{id}: max abs error {error}");
    }
}

#[test]
fn ddim_zero_noise_run_is_bit_reproducible() {
    let config = sampling(4, Precision::Half).with_guidance(true, 7.5);
    let fixture = Fixture::new(Precision::Half);

    let run = || {
        let mut adapter = fixture.host_adapter(SchedulerId::Ddim, &config);
        let sample = latents(&config, &fixture.context);
        StepPipeline::new(config.guidance_scale)
            .record_intermediates(true)
            .run(adapter.as_mut(), &sample, &mut ZeroNoisePredictor)
            .unwrap()
    };
    let bits = |t: &Tensor| -> Vec<u32> {
        t.to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .map(f32::to_bits)
            .collect()
    };

    let first = run();
    let second = run();
    let first_steps = first.intermediates.unwrap();
    let second_steps = second.intermediates.unwrap();
    assert_eq!(first_steps.len(), 4);
    for (a, b) in first_steps.iter().zip(second_steps.iter()) {
        assert_eq!(bits(a), bits(b));
    }
    assert_eq!(bits(&first.latent), bits(&second.latent));
}

#[test]
fn step_count_matches_for_every_scheduler_and_backend() {
    for n in [1, 3, 8] {
        let config = sampling(n, Precision::Full);
        let mut fixture = Fixture::new(Precision::Full);
        for id in SchedulerId::all() {
            fixture.export(*id, &config);
        }
        for id in SchedulerId::all() {
            for mut adapter in [fixture.host_adapter(*id, &config), fixture.adapter(*id, &config)] {
                let sample = latents(&config, &fixture.context);
                let init = adapter.initialize(&sample).unwrap();
                assert_eq!(init.step_count, n, "{id} on {:?}", adapter.backend());
                assert_eq!(init.time_ids.dims(), &[2, 6]);
            }
        }
    }
}

#[test]
fn boundary_index_fails_on_both_backends() {
    let config = sampling(3, Precision::Full);
    let mut fixture = Fixture::new(Precision::Full);
    fixture.export(SchedulerId::EulerDiscrete, &config);

    for mut adapter in [
        fixture.host_adapter(SchedulerId::EulerDiscrete, &config),
        fixture.adapter(SchedulerId::EulerDiscrete, &config),
    ] {
        let sample = latents(&config, &fixture.context);
        let err = adapter.prepare_input(&sample, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let init = adapter.initialize(&sample).unwrap();
        let err = adapter.prepare_input(&init.sample, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexRange);

        let noise = Tensor::zeros((2, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let err = adapter
            .step(&noise, 1.0, &init.sample, 7.5, 3)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexRange);

        let single = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let t = adapter.prepare_input(&init.sample, 0).unwrap().timestep;
        let err = adapter
            .step(&single, t, &init.sample, 7.5, 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_runs_execute_concurrently() {
    let config = sampling(5, Precision::Full);
    let reference = {
        let fixture = Fixture::new(Precision::Full);
        let mut adapter = fixture.host_adapter(SchedulerId::EulerAncestralDiscrete, &config);
        let sample = latents(&config, &fixture.context);
        StepPipeline::new(config.guidance_scale)
            .run(adapter.as_mut(), &sample, &mut damped)
            .unwrap()
            .latent
    };

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                let fixture = Fixture::new(Precision::Full);
                let mut adapter =
                    fixture.host_adapter(SchedulerId::EulerAncestralDiscrete, &config);
                let sample = latents(&config, &fixture.context);
                StepPipeline::new(config.guidance_scale)
                    .run(adapter.as_mut(), &sample, &mut damped)
                    .unwrap()
                    .latent
            })
        })
        .collect();

    for handle in handles {
        let latent = handle.await.unwrap();
        assert_eq!(largest_error(&latent, &reference).unwrap(), 0.0);
    }
}
