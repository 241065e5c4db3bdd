//! Output sinks for sampler results.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::SamplerError;
use crate::population::Population;

/// Model-independent view of a population.
///
/// Log quantities that are `-inf` (zero weight, failed likelihood) are `None`,
/// which serialises as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationSummary {
    pub thetas: Vec<Vec<f64>>,
    pub log_weights: Vec<Option<f64>>,
    pub ancestors: Vec<usize>,
    /// Per-particle marginal log-likelihood estimates.
    pub particle_log_likelihoods: Vec<Option<f64>>,
    pub ess: f64,
    pub log_likelihood: Option<f64>,
    pub log_increments: Vec<Option<f64>>,
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

impl PopulationSummary {
    pub fn from_population<X, O>(population: &Population<X, O>) -> Self {
        Self {
            thetas: population.particles().iter().map(|p| p.theta.clone()).collect(),
            log_weights: population.log_weights().iter().map(|&w| finite(w)).collect(),
            ancestors: population.ancestors().to_vec(),
            particle_log_likelihoods: population
                .particles()
                .iter()
                .map(|p| finite(p.log_likelihood))
                .collect(),
            ess: population.ess,
            log_likelihood: finite(population.log_likelihood),
            log_increments: population.log_increments.iter().map(|&x| finite(x)).collect(),
        }
    }

    /// Weighted posterior mean of each parameter. `None` when every weight is
    /// zero.
    pub fn posterior_mean(&self) -> Option<Vec<f64>> {
        let lws: Vec<f64> = self
            .log_weights
            .iter()
            .map(|w| w.unwrap_or(f64::NEG_INFINITY))
            .collect();
        let w = crate::math::normalised_weights(&lws);
        if w.iter().all(|&wi| wi == 0.0) {
            warn!("no posterior mean: every theta-particle has zero weight");
            return None;
        }
        let d = self.thetas.first().map_or(0, Vec::len);
        let mut mean = vec![0.0; d];
        for (theta, wi) in self.thetas.iter().zip(w) {
            for (m, t) in mean.iter_mut().zip(theta) {
                *m += wi * t;
            }
        }
        Some(mean)
    }
}

pub trait OutputSink<X, O> {
    /// Discard anything written so far.
    fn clear(&mut self);

    fn write(&mut self, population: &Population<X, O>) -> Result<(), SamplerError>;
}

/// Keeps every written summary in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<PopulationSummary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&PopulationSummary> {
        self.records.last()
    }
}

impl<X, O> OutputSink<X, O> for MemorySink {
    fn clear(&mut self) {
        self.records.clear();
    }

    fn write(&mut self, population: &Population<X, O>) -> Result<(), SamplerError> {
        self.records.push(PopulationSummary::from_population(population));
        Ok(())
    }
}
