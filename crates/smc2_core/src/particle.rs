//! Parameter particles ("theta-particles").

use serde::{Deserialize, Serialize};

/// One hypothesis for the static parameters together with the embedded
/// latent-state filter that estimates its marginal likelihood.
///
/// `X` is the filter's latent population. Log quantities are finite or
/// `f64::NEG_INFINITY`, never NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaParticle<X> {
    pub theta: Vec<f64>,
    pub log_likelihood: f64,
    pub log_prior: f64,
    /// Density under the adapted proposal; `-inf` while no proposal is active.
    pub log_proposal: f64,
    /// Log-likelihood increment per observation index.
    pub log_increments: Vec<f64>,
    pub latent: X,
}

impl<X: Default> Default for ThetaParticle<X> {
    fn default() -> Self {
        Self::new(Vec::new(), X::default())
    }
}

impl<X> ThetaParticle<X> {
    pub fn new(theta: Vec<f64>, latent: X) -> Self {
        Self {
            theta,
            log_likelihood: 0.0,
            log_prior: f64::NEG_INFINITY,
            log_proposal: f64::NEG_INFINITY,
            log_increments: Vec::new(),
            latent,
        }
    }

    /// Forget likelihood bookkeeping ahead of a fresh filter run.
    pub fn reset_likelihood(&mut self) {
        self.log_likelihood = 0.0;
        self.log_increments.clear();
    }

    /// Record the increment for observation `index_obs` and fold it into the
    /// running log-likelihood.
    pub fn push_increment(&mut self, index_obs: usize, increment: f64) {
        if self.log_increments.len() <= index_obs {
            self.log_increments.resize(index_obs + 1, 0.0);
        }
        let increment = sanitize(increment);
        self.log_increments[index_obs] = increment;
        self.log_likelihood = sanitize(self.log_likelihood + increment);
    }

    pub fn log_increment(&self, index_obs: usize) -> f64 {
        self.log_increments.get(index_obs).copied().unwrap_or(0.0)
    }

    /// Map NaN log quantities to `-inf`.
    pub fn sanitize(&mut self) {
        self.log_likelihood = sanitize(self.log_likelihood);
        self.log_prior = sanitize(self.log_prior);
        self.log_proposal = sanitize(self.log_proposal);
    }

    pub fn invalidate(&mut self) {
        self.log_likelihood = f64::NEG_INFINITY;
    }

    /// Exchange the full state with another particle without copying the
    /// underlying storage.
    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(self, other);
    }
}

#[inline]
pub(crate) fn sanitize(x: f64) -> f64 {
    if x.is_nan() {
        f64::NEG_INFINITY
    } else {
        x
    }
}
