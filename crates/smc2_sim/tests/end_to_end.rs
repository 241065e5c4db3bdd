//! End-to-end SMC² runs over simulated AR(1) data.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use smc2_core::kernel::ReductionMode;
use smc2_core::{
    EssResampler, Filter, GaussianAdapter, LocalComm, MarginalSir, MemorySink, ResampleScheme, SamplerConfig,
    Schedule,
};
use smc2_sim::{
    population, simulate, Ar1Model, BootstrapFilter, InitialValues, JsonSink, ModelConfig, RunRecord,
};

const TRUE_THETA: [f64; 3] = [1.0, 0.7, 0.4];

fn setup(n_obs: usize) -> (BootstrapFilter, Schedule) {
    let model = Ar1Model::new(&ModelConfig::default()).unwrap();
    let obs_times: Vec<f64> = (1..=n_obs).map(|t| t as f64).collect();
    let schedule = Schedule::new(0.0, &[], &obs_times).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let sim = simulate(&model, &TRUE_THETA, &schedule, &mut rng).unwrap();
    let filter = BootstrapFilter::new(model, sim.observations, 32, ReductionMode::Serial, vec![0.2, 0.05, 0.05])
        .unwrap();
    (filter, schedule)
}

fn quiet() -> SamplerConfig {
    SamplerConfig {
        progress: false,
        ..SamplerConfig::default()
    }
}

#[test]
fn test_full_run_writes_json() {
    let (filter, schedule) = setup(12);
    let mut pop = population(&filter, 48).unwrap();
    let path = std::env::temp_dir().join(format!("smc2_run_{}.json", std::process::id()));
    let mut sink = JsonSink::new(&path);
    let mut sampler = MarginalSir::new(
        filter,
        GaussianAdapter::default(),
        EssResampler::new(0.5, ResampleScheme::Systematic),
        LocalComm,
        quiet(),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let summary = sampler
        .sample(&mut rng, &schedule, &mut pop, &mut sink, &InitialValues::default())
        .unwrap();

    assert!(summary.log_likelihood.is_finite());
    assert!(summary.ess >= 1.0 - 1e-9 && summary.ess <= 48.0 + 1e-9);
    assert!((0.0..=1.0).contains(&summary.accept_rate));
    assert_eq!(summary.steps, 12);
    assert_eq!(sink.written(), 1);

    let record = RunRecord::read(&path).unwrap();
    assert_eq!(record.summary.thetas.len(), 48);
    assert_eq!(record.times.len(), schedule.len());
    for (theta, path) in record.summary.thetas.iter().zip(&record.paths) {
        assert!(sampler.filter().log_prior(theta).is_finite());
        if !path.is_empty() {
            assert_eq!(path.len(), schedule.len());
        }
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_fixed_initial_values_start_identical() {
    let (filter, schedule) = setup(3);
    let mut pop = population(&filter, 8).unwrap();
    let mut out = MemorySink::new();
    let mut sampler = MarginalSir::new(
        filter,
        GaussianAdapter::default(),
        EssResampler::default(),
        LocalComm,
        quiet(),
    );
    let input = InitialValues {
        theta: Some(TRUE_THETA.to_vec()),
    };
    sampler
        .init(&mut ChaCha8Rng::seed_from_u64(1), schedule.begin(), &mut pop, &mut out, &input)
        .unwrap();
    assert!(pop.particles().iter().all(|p| p.theta == TRUE_THETA));
    assert!(pop.log_weights().iter().all(|w| *w == 0.0));
}

#[test]
fn test_out_of_support_initial_values_fail_init() {
    let (filter, schedule) = setup(2);
    let mut pop = population(&filter, 4).unwrap();
    let mut out = MemorySink::new();
    let mut sampler = MarginalSir::new(
        filter,
        GaussianAdapter::default(),
        EssResampler::default(),
        LocalComm,
        quiet(),
    );
    let input = InitialValues {
        theta: Some(vec![0.0, 2.0, 1.0]),
    };
    let err = sampler
        .sample(&mut ChaCha8Rng::seed_from_u64(1), &schedule, &mut pop, &mut out, &input)
        .unwrap_err();
    assert!(matches!(err, smc2_core::SamplerError::Init { .. }));
}

#[test]
fn test_same_seed_same_estimate() {
    let run = || {
        let (filter, schedule) = setup(6);
        let mut pop = population(&filter, 24).unwrap();
        let mut out = MemorySink::new();
        let mut sampler = MarginalSir::new(
            filter,
            GaussianAdapter::default(),
            EssResampler::default(),
            LocalComm,
            quiet(),
        );
        sampler
            .sample(&mut ChaCha8Rng::seed_from_u64(99), &schedule, &mut pop, &mut out, &InitialValues::default())
            .unwrap()
            .log_likelihood
    };
    assert_eq!(run(), run());
}
