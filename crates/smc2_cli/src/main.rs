pub mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use smc2_core::output::PopulationSummary;
use smc2_core::{EssResampler, GaussianAdapter, LocalComm, MarginalSir, SamplerConfig, Schedule};
use smc2_sim::data::{read_csv, write_csv};
use smc2_sim::{population, simulate, Ar1Model, BootstrapFilter, InitialValues, JsonSink, Observations};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "smc2")]
#[command(about = "SMC² marginal sampler for AR(1) state-space data")]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sampler over simulated or CSV data
    Run {
        /// TOML configuration file. Its [sampler] section replaces the sampler flags.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Parameter particles
        #[arg(long)]
        particles: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Observation CSV (index_obs,time,replicate,value)
        #[arg(long)]
        data: Option<PathBuf>,
        /// Output JSON path
        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        sampler: SamplerConfig,
    },
    /// Print the default configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn resolve(
    config: Option<PathBuf>,
    particles: Option<usize>,
    seed: Option<u64>,
    data: Option<PathBuf>,
    output: Option<PathBuf>,
    sampler: SamplerConfig,
) -> anyhow::Result<Config> {
    let mut cfg = match config {
        Some(path) => Config::load(&path)?,
        None => Config {
            sampler,
            ..Config::default()
        },
    };
    if let Some(n) = particles {
        cfg.run.particles = n;
    }
    if let Some(s) = seed {
        cfg.run.seed = s;
    }
    if data.is_some() {
        cfg.run.data = data;
    }
    if let Some(path) = output {
        cfg.run.output = path;
    }
    Ok(cfg)
}

fn load_data(cfg: &Config, model: &Ar1Model, rng: &mut ChaCha8Rng) -> anyhow::Result<(Schedule, Observations)> {
    if let Some(path) = &cfg.run.data {
        let (times, observations) = read_csv(path).with_context(|| format!("reading {}", path.display()))?;
        let schedule = Schedule::new(cfg.run.start, &[], &times)?;
        if schedule.num_observations() != observations.len() {
            anyhow::bail!(
                "{} holds {} observation indices but only {} distinct times at or after {}",
                path.display(),
                observations.len(),
                schedule.num_observations(),
                cfg.run.start
            );
        }
        info!(path = %path.display(), n_obs = observations.len(), "Loaded observations");
        return Ok((schedule, observations));
    }

    let schedule = Schedule::new(cfg.run.start, &[], &cfg.run.obs_times())?;
    let sim = simulate(model, &cfg.model.true_theta, &schedule, rng)?;
    info!(
        n_obs = sim.observations.len(),
        true_theta = ?cfg.model.true_theta,
        "Simulated observations"
    );
    if let Some(path) = &cfg.run.write_data {
        write_csv(path, &schedule, &sim.observations).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Wrote observations");
    }
    Ok((schedule, sim.observations))
}

fn run(cfg: Config) -> anyhow::Result<()> {
    info!(config = ?cfg, "Starting SMC² run");

    let model = Ar1Model::new(&cfg.model.model_config())?;
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.run.seed);
    let (schedule, observations) = load_data(&cfg, &model, &mut rng)?;

    let filter = BootstrapFilter::new(
        model,
        observations,
        cfg.model.n_latent,
        cfg.sampler.kernel.mode,
        cfg.model.proposal_sd.clone(),
    )?;
    let mut pop = population(&filter, cfg.run.particles)?;
    let mut sink = JsonSink::new(&cfg.run.output);
    let mut sampler = MarginalSir::new(
        filter,
        GaussianAdapter::new(cfg.sampler.adapter_scale, cfg.sampler.adapter_ess_rel),
        EssResampler::new(cfg.sampler.ess_rel, cfg.sampler.scheme),
        LocalComm,
        cfg.sampler.clone(),
    );
    let input = InitialValues {
        theta: cfg.run.initial_theta.clone(),
    };

    let start = Instant::now();
    let summary = sampler.sample(&mut rng, &schedule, &mut pop, &mut sink, &input)?;
    let elapsed = start.elapsed();

    if summary.ess < 0.1 * cfg.run.particles as f64 {
        warn!(ess = summary.ess, "Final ESS is below 10% of the population");
    }
    info!(
        log_likelihood = summary.log_likelihood,
        ess = summary.ess,
        steps = summary.steps,
        resamples = summary.resamples,
        accept_rate = summary.accept_rate,
        duration_secs = elapsed.as_secs_f64(),
        "Sampling Complete"
    );
    info!(
        posterior_mean = ?PopulationSummary::from_population(&pop).posterior_mean(),
        output = %sink.path().display(),
        "Wrote population"
    );
    Ok(())
}

fn print_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let text = Config::default().to_toml()?;
    match output {
        Some(path) => {
            fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Wrote default configuration");
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Structured logging; `log` records from the library crates are bridged in.
    if let Err(e) = tracing_subscriber::fmt()
        .json()
        .with_max_level(cli.log_level)
        .try_init()
    {
        eprintln!("could not install log subscriber: {}", e);
    }

    let result = match cli.command {
        Commands::Run {
            config,
            particles,
            seed,
            data,
            output,
            sampler,
        } => resolve(config, particles, seed, data, output, sampler).and_then(run),
        Commands::Config { output } => print_config(output),
    };

    if let Err(e) = result {
        error!(error = %e, "Fatal Error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "smc2",
            "run",
            "--particles",
            "32",
            "--nmoves",
            "2",
            "--scheme",
            "multinomial",
            "--reduction",
            "barrier",
            "--progress",
            "false",
        ])
        .unwrap();
        let Commands::Run {
            particles, sampler, ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(particles, Some(32));
        assert_eq!(sampler.nmoves, 2);
        assert_eq!(sampler.scheme, smc2_core::ResampleScheme::Multinomial);
        assert_eq!(sampler.kernel.mode, smc2_core::ReductionMode::Barrier);
        assert!(!sampler.progress);
    }

    #[test]
    fn test_gpu_reduction_is_selectable() {
        let cli = Cli::try_parse_from(["smc2", "run", "--reduction", "gpu"]).unwrap();
        let Commands::Run { sampler, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(sampler.kernel.mode, smc2_core::ReductionMode::Gpu);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cfg = resolve(
            None,
            Some(10),
            Some(7),
            None,
            Some(PathBuf::from("out.json")),
            SamplerConfig {
                nmoves: 5,
                ..SamplerConfig::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.run.particles, 10);
        assert_eq!(cfg.run.seed, 7);
        assert_eq!(cfg.run.output, PathBuf::from("out.json"));
        assert_eq!(cfg.sampler.nmoves, 5);
        assert_eq!(cfg.model, config::ModelSection::default());
    }

    #[test]
    fn test_small_run_writes_output() {
        let dir = std::env::temp_dir().join(format!("smc2_cli_{}", std::process::id()));
        let mut cfg = Config::default();
        cfg.sampler.progress = false;
        cfg.model.n_latent = 16;
        cfg.run.particles = 16;
        cfg.run.n_obs = 5;
        cfg.run.output = dir.join("run.json");
        cfg.run.write_data = Some(dir.join("obs.csv"));
        fs::create_dir_all(&dir).unwrap();

        run(cfg.clone()).unwrap();
        let record = smc2_sim::RunRecord::read(&cfg.run.output).unwrap();
        assert_eq!(record.summary.thetas.len(), 16);

        // the written data drives a second run
        cfg.run.data = cfg.run.write_data.take();
        cfg.run.output = dir.join("rerun.json");
        run(cfg.clone()).unwrap();
        assert!(cfg.run.output.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_out_of_order_csv_is_rejected() {
        let dir = std::env::temp_dir().join(format!("smc2_cli_unordered_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let data = dir.join("obs.csv");
        fs::write(
            &data,
            "index_obs,time,replicate,value\n0,2.0,0,100.0\n1,1.0,0,-100.0\n",
        )
        .unwrap();
        let mut cfg = Config::default();
        cfg.sampler.progress = false;
        cfg.model.replicates = 1;
        cfg.run.particles = 4;
        cfg.run.data = Some(data);
        cfg.run.output = dir.join("run.json");

        let err = run(cfg.clone()).unwrap_err();
        assert!(err.chain().any(|e| e.to_string().contains("does not follow")));
        assert!(!cfg.run.output.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
