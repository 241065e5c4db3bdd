//! AR(1) state-space model
//!
//! Parameters `theta = (mu, phi, sigma)`:
//!
//! ```text
//! x_0   ~ N(mu, sigma² / (1 - phi²))
//! x_t   = mu + phi (x_{t-1} - mu) + sigma e_t,   e_t ~ N(0, 1)
//! y_t,j ~ N(x_t, tau²),                          j = 1..replicates
//! ```
//!
//! One transition is applied per schedule element whose time is strictly
//! later than the previous element's.

use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

use smc2_core::math::log_normal_pdf;
use smc2_core::FilterError;

pub const N_PARAMS: usize = 3;

const MU_PRIOR_SD: f64 = 10.0;
const SIGMA_MAX: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ar1Params {
    pub mu: f64,
    pub phi: f64,
    pub sigma: f64,
}

impl Ar1Params {
    pub fn from_theta(theta: &[f64]) -> Result<Self, FilterError> {
        match *theta {
            [mu, phi, sigma] => Ok(Self { mu, phi, sigma }),
            _ => Err(FilterError::InvalidInput(format!(
                "AR(1) expects {} parameters, got {}",
                N_PARAMS,
                theta.len()
            ))),
        }
    }

    pub fn to_theta(self) -> Vec<f64> {
        vec![self.mu, self.phi, self.sigma]
    }

    /// Stationary standard deviation of the latent process.
    pub fn stationary_sd(&self) -> f64 {
        self.sigma / (1.0 - self.phi * self.phi).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Replicate observations per observed time
    pub replicates: usize,
    /// Observation noise standard deviation
    pub obs_sd: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            replicates: 4,
            obs_sd: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ar1Model {
    replicates: usize,
    obs_sd: f64,
}

impl Ar1Model {
    pub fn new(config: &ModelConfig) -> Result<Self, FilterError> {
        if config.replicates == 0 {
            return Err(FilterError::InvalidInput("at least one replicate is required".into()));
        }
        if !(config.obs_sd > 0.0 && config.obs_sd.is_finite()) {
            return Err(FilterError::InvalidInput(format!(
                "observation sd must be positive, got {}",
                config.obs_sd
            )));
        }
        Ok(Self {
            replicates: config.replicates,
            obs_sd: config.obs_sd,
        })
    }

    pub fn replicates(&self) -> usize {
        self.replicates
    }

    pub fn obs_sd(&self) -> f64 {
        self.obs_sd
    }

    /// `mu ~ N(0, 10²)`, `phi ~ U(-1, 1)`, `sigma ~ U(0, 5)`.
    pub fn log_prior(&self, theta: &[f64]) -> f64 {
        let Ok(p) = Ar1Params::from_theta(theta) else {
            return f64::NEG_INFINITY;
        };
        if !p.mu.is_finite() || !(p.phi > -1.0 && p.phi < 1.0) || !(p.sigma > 0.0 && p.sigma < SIGMA_MAX) {
            return f64::NEG_INFINITY;
        }
        log_normal_pdf(p.mu, 0.0, MU_PRIOR_SD) + 0.5f64.ln() + (1.0 / SIGMA_MAX).ln()
    }

    pub fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mu = rng.sample::<f64, _>(StandardNormal) * MU_PRIOR_SD;
        // open intervals keep the draw inside the support
        let phi = Uniform::new(-1.0, 1.0).sample(rng);
        let sigma = loop {
            let s = Uniform::new(0.0, SIGMA_MAX).sample(rng);
            if s > 0.0 {
                break s;
            }
        };
        vec![mu, phi, sigma]
    }

    pub fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R, p: &Ar1Params) -> Result<f64, FilterError> {
        let dist = Normal::new(p.mu, p.stationary_sd())
            .map_err(|e| FilterError::InvalidInput(format!("initial distribution: {}", e)))?;
        Ok(dist.sample(rng))
    }

    pub fn transition<R: Rng + ?Sized>(&self, rng: &mut R, p: &Ar1Params, x: f64) -> f64 {
        p.mu + p.phi * (x - p.mu) + p.sigma * rng.sample::<f64, _>(StandardNormal)
    }

    pub fn sample_observation<R: Rng + ?Sized>(&self, rng: &mut R, x: f64) -> f64 {
        x + self.obs_sd * rng.sample::<f64, _>(StandardNormal)
    }

    /// Log-density of replicate `y` given latent state `x`.
    pub fn log_observation(&self, y: f64, x: f64) -> f64 {
        log_normal_pdf(y, x, self.obs_sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> Ar1Model {
        Ar1Model::new(&ModelConfig::default()).unwrap()
    }

    #[test]
    fn test_prior_support() {
        let m = model();
        assert!(m.log_prior(&[0.0, 0.5, 1.0]).is_finite());
        assert_eq!(m.log_prior(&[0.0, 1.0, 1.0]), f64::NEG_INFINITY);
        assert_eq!(m.log_prior(&[0.0, 0.5, 0.0]), f64::NEG_INFINITY);
        assert_eq!(m.log_prior(&[0.0, 0.5, 6.0]), f64::NEG_INFINITY);
        assert_eq!(m.log_prior(&[0.0, 0.5]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_prior_draws_in_support() {
        let m = model();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..500 {
            let theta = m.sample_prior(&mut rng);
            assert!(m.log_prior(&theta).is_finite());
        }
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Ar1Model::new(&ModelConfig {
            replicates: 0,
            ..ModelConfig::default()
        })
        .is_err());
        assert!(Ar1Model::new(&ModelConfig {
            obs_sd: -1.0,
            ..ModelConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_transition_mean_reverts() {
        let m = model();
        let p = Ar1Params {
            mu: 2.0,
            phi: 0.5,
            sigma: 0.1,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let n = 5_000;
        let mean: f64 = (0..n).map(|_| m.transition(&mut rng, &p, 4.0)).sum::<f64>() / n as f64;
        assert!((mean - 3.0).abs() < 0.01);
    }
}
