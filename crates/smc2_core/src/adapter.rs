//! Proposal adaptation
//!
//! An [`Adapter`] accumulates statistics from a population snapshot and,
//! once it has seen enough, commits a [`Proposal`] that the filter's
//! `propose_with` draws replacements from.
//!
//! [`GaussianAdapter`] fits a weighted mean and covariance of the parameter
//! particles and factorises it for an independence proposal.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::FilterError;
use crate::math;
use crate::population::Population;

use core::f64::consts::PI;
use log::{debug, warn};

/// Distribution used to propose replacement parameters.
pub trait Proposal {
    /// Draw a parameter vector given the current one.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, current: &[f64]) -> Result<Vec<f64>, FilterError>;

    /// `log q(to | from)`.
    fn log_density(&self, from: &[f64], to: &[f64]) -> f64;
}

pub trait Adapter {
    type Proposal: Proposal;

    /// Discard accumulated statistics.
    fn clear(&mut self);

    /// Accumulate statistics from a population snapshot.
    fn add<X, O>(&mut self, population: &Population<X, O>);

    /// Enough information to build a non-degenerate proposal.
    fn ready(&self) -> bool;

    /// Commit a new proposal from the accumulated statistics.
    fn adapt(&mut self);

    /// The committed proposal, if any.
    fn proposal(&self) -> Option<&Self::Proposal>;
}

/// Multivariate normal independence proposal `N(mean, L Lᵀ)`.
#[derive(Debug, Clone)]
pub struct GaussianProposal {
    mean: DVector<f64>,
    chol: Cholesky<f64, Dyn>,
    log_det: f64,
}

impl GaussianProposal {
    pub fn new(mean: Vec<f64>, cov: DMatrix<f64>) -> Result<Self, FilterError> {
        let d = mean.len();
        if cov.nrows() != d || cov.ncols() != d {
            return Err(FilterError::InvalidInput(format!(
                "covariance is {}x{}, mean has {} entries",
                cov.nrows(),
                cov.ncols(),
                d
            )));
        }
        let chol = Cholesky::new(cov)
            .ok_or_else(|| FilterError::Cholesky("covariance is not positive definite".into()))?;
        let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>();
        if !log_det.is_finite() {
            return Err(FilterError::Cholesky("singular covariance".into()));
        }
        Ok(Self {
            mean: DVector::from_vec(mean),
            chol,
            log_det,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }
}

impl Proposal for GaussianProposal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, _current: &[f64]) -> Result<Vec<f64>, FilterError> {
        let d = self.dim();
        let z = DVector::from_fn(d, |_, _| rng.sample::<f64, _>(StandardNormal));
        let x = &self.mean + self.chol.l() * z;
        if x.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::Cholesky("non-finite proposal draw".into()));
        }
        Ok(x.as_slice().to_vec())
    }

    fn log_density(&self, _from: &[f64], to: &[f64]) -> f64 {
        let d = self.dim();
        if to.len() != d {
            return f64::NEG_INFINITY;
        }
        let diff = DVector::from_column_slice(to) - &self.mean;
        let Some(z) = self.chol.l_dirty().solve_lower_triangular(&diff) else {
            return f64::NEG_INFINITY;
        };
        -0.5 * (d as f64 * (2.0 * PI).ln() + self.log_det + z.norm_squared())
    }
}

/// Weighted Gaussian fit of the parameter population.
#[derive(Debug, Clone)]
pub struct GaussianAdapter {
    /// Covariance scale factor.
    scale: f64,
    /// Minimum ESS, as a fraction of the snapshot size, for `ready`.
    ess_rel: f64,
    thetas: Vec<Vec<f64>>,
    log_weights: Vec<f64>,
    proposal: Option<GaussianProposal>,
}

impl GaussianAdapter {
    pub fn new(scale: f64, ess_rel: f64) -> Self {
        Self {
            scale,
            ess_rel,
            thetas: Vec::new(),
            log_weights: Vec::new(),
            proposal: None,
        }
    }

    fn dim(&self) -> usize {
        self.thetas.first().map_or(0, Vec::len)
    }

    /// Weighted mean and reliability-weighted covariance.
    fn moments(&self) -> Option<(Vec<f64>, DMatrix<f64>)> {
        let d = self.dim();
        let w = math::normalised_weights(&self.log_weights);
        let sum_w2: f64 = w.iter().map(|x| x * x).sum();
        let denom = 1.0 - sum_w2;
        if d == 0 || denom <= 0.0 {
            return None;
        }

        let mut mean = vec![0.0; d];
        for (theta, &wi) in self.thetas.iter().zip(&w) {
            for (m, &t) in mean.iter_mut().zip(theta) {
                *m += wi * t;
            }
        }
        let mut cov = DMatrix::<f64>::zeros(d, d);
        for (theta, &wi) in self.thetas.iter().zip(&w) {
            if wi == 0.0 {
                continue;
            }
            let diff = DVector::from_fn(d, |i, _| theta[i] - mean[i]);
            cov += (&diff * diff.transpose()) * wi;
        }
        cov *= self.scale / denom;
        Some((mean, cov))
    }
}

impl Default for GaussianAdapter {
    fn default() -> Self {
        Self::new(1.0, 0.25)
    }
}

impl Adapter for GaussianAdapter {
    type Proposal = GaussianProposal;

    fn clear(&mut self) {
        self.thetas.clear();
        self.log_weights.clear();
    }

    fn add<X, O>(&mut self, population: &Population<X, O>) {
        for (p, lw) in population.particles().iter().zip(population.log_weights()) {
            if p.theta.is_empty() || p.theta.iter().any(|t| !t.is_finite()) {
                continue;
            }
            self.thetas.push(p.theta.clone());
            self.log_weights.push(*lw);
        }
    }

    fn ready(&self) -> bool {
        let n = self.thetas.len();
        let d = self.dim();
        if n <= d || d == 0 {
            return false;
        }
        let ess = math::ess(&self.log_weights);
        ess > d as f64 && ess >= self.ess_rel * n as f64
    }

    fn adapt(&mut self) {
        let Some((mean, cov)) = self.moments() else {
            self.proposal = None;
            return;
        };
        match GaussianProposal::new(mean, cov) {
            Ok(q) => {
                debug!("adapted proposal of dimension {}", q.dim());
                self.proposal = Some(q);
            }
            Err(e) => {
                warn!("proposal adaptation failed: {}", e);
                self.proposal = None;
            }
        }
    }

    fn proposal(&self) -> Option<&GaussianProposal> {
        self.proposal.as_ref()
    }
}
