use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use smc2_core::SamplerConfig;
use smc2_sim::ModelConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub run: RunConfig,
}

/// The AR(1) model and its particle filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    /// Replicate observations per observed time
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Observation noise standard deviation
    #[serde(default = "default_obs_sd")]
    pub obs_sd: f64,
    /// State particles per parameter particle
    #[serde(default = "default_n_latent")]
    pub n_latent: usize,
    /// Random-walk standard deviation for (mu, phi, sigma)
    #[serde(default = "default_proposal_sd")]
    pub proposal_sd: Vec<f64>,
    /// Parameters used to simulate data when no CSV is given
    #[serde(default = "default_true_theta")]
    pub true_theta: Vec<f64>,
}

fn default_replicates() -> usize {
    4
}
fn default_obs_sd() -> f64 {
    0.5
}
fn default_n_latent() -> usize {
    64
}
fn default_proposal_sd() -> Vec<f64> {
    vec![0.1, 0.02, 0.02]
}
fn default_true_theta() -> Vec<f64> {
    vec![1.0, 0.7, 0.4]
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            replicates: default_replicates(),
            obs_sd: default_obs_sd(),
            n_latent: default_n_latent(),
            proposal_sd: default_proposal_sd(),
            true_theta: default_true_theta(),
        }
    }
}

impl ModelSection {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            replicates: self.replicates,
            obs_sd: self.obs_sd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Parameter particles
    #[serde(default = "default_particles")]
    pub particles: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Start of the schedule
    #[serde(default)]
    pub start: f64,
    /// Observed times simulated at `start + k * interval`, k = 1..=n_obs
    #[serde(default = "default_n_obs")]
    pub n_obs: usize,
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Read observations from this CSV instead of simulating them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,
    /// Save simulated observations to this CSV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data: Option<PathBuf>,
    /// Start every parameter particle here instead of drawing from the prior
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_theta: Option<Vec<f64>>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

fn default_particles() -> usize {
    256
}
fn default_seed() -> u64 {
    42
}
fn default_n_obs() -> usize {
    50
}
fn default_interval() -> f64 {
    1.0
}
fn default_output() -> PathBuf {
    PathBuf::from("smc2_output.json")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            particles: default_particles(),
            seed: default_seed(),
            start: 0.0,
            n_obs: default_n_obs(),
            interval: default_interval(),
            data: None,
            write_data: None,
            initial_theta: None,
            output: default_output(),
        }
    }
}

impl RunConfig {
    /// Observation times for simulated data.
    pub fn obs_times(&self) -> Vec<f64> {
        (1..=self.n_obs)
            .map(|k| self.start + k as f64 * self.interval)
            .collect()
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
