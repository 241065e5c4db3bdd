//! Resampling of parameter particles.
//!
//! A [`Resampler`] decides whether to resample and, if it does, rebuilds the
//! population from ancestor indices and leaves every log-weight at zero.
//! When it declines, ancestors are reset to the identity.

use rand::Rng;

use crate::config::ResampleScheme;
use crate::error::SamplerError;
use crate::math;
use crate::population::Population;
use crate::schedule::ScheduleElement;
use log::{debug, warn};

pub trait Resampler {
    /// Returns whether a resample was performed.
    fn resample<R, X, O>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        population: &mut Population<X, O>,
    ) -> Result<bool, SamplerError>
    where
        R: Rng + ?Sized,
        X: Clone,
        O: Clone;
}

/// Resamples when `population.ess < ess_rel · P`, with `P` the global size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EssResampler {
    pub ess_rel: f64,
    pub scheme: ResampleScheme,
}

impl Default for EssResampler {
    fn default() -> Self {
        Self {
            ess_rel: 0.5,
            scheme: ResampleScheme::Systematic,
        }
    }
}

impl EssResampler {
    pub fn new(ess_rel: f64, scheme: ResampleScheme) -> Self {
        Self { ess_rel, scheme }
    }

    pub fn is_triggered(&self, ess: f64, total: usize) -> bool {
        ess < self.ess_rel * total as f64
    }

    /// Draw `n` ancestor indices from normalised weights, in ascending order.
    /// A zero-mass weight vector falls back to uniform weights.
    pub fn ancestors<R: Rng + ?Sized>(&self, rng: &mut R, lws: &[f64]) -> Vec<usize> {
        let n = lws.len();
        let mut w = math::normalised_weights(lws);
        if w.iter().all(|&x| x == 0.0) {
            warn!("resampling a population with zero total weight; drawing uniformly");
            w.iter_mut().for_each(|x| *x = 1.0 / n as f64);
        }
        let mut cumulative = Vec::with_capacity(n);
        let mut acc = 0.0;
        for x in &w {
            acc += x;
            cumulative.push(acc);
        }

        let mut points: Vec<f64> = match self.scheme {
            ResampleScheme::Multinomial => (0..n).map(|_| rng.gen::<f64>() * acc).collect(),
            ResampleScheme::Systematic => {
                let u: f64 = rng.gen();
                (0..n).map(|i| (i as f64 + u) / n as f64 * acc).collect()
            }
            ResampleScheme::Stratified => (0..n)
                .map(|i| (i as f64 + rng.gen::<f64>()) / n as f64 * acc)
                .collect(),
        };
        points.sort_by(|a, b| a.total_cmp(b));

        let mut out = Vec::with_capacity(n);
        let mut j = 0;
        for u in points {
            while j + 1 < n && cumulative[j] <= u {
                j += 1;
            }
            out.push(j);
        }
        out
    }
}

impl Resampler for EssResampler {
    fn resample<R, X, O>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        population: &mut Population<X, O>,
    ) -> Result<bool, SamplerError>
    where
        R: Rng + ?Sized,
        X: Clone,
        O: Clone,
    {
        if !self.is_triggered(population.ess, population.total_size()) {
            population.reset_ancestors();
            return Ok(false);
        }
        let ancestors = self.ancestors(rng, population.log_weights());
        debug!(
            "resampling {} theta-particles at time {} (ESS {:.2})",
            ancestors.len(),
            now.time,
            population.ess
        );
        population.permute(&ancestors);
        population.reset_weights();
        population.ess = population.total_size() as f64;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::particle::ThetaParticle;
    use crate::schedule::Schedule;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn population(n: usize) -> Population<usize, ()> {
        Population::from_fn(n, |p| (ThetaParticle::new(vec![p as f64], p), ())).unwrap()
    }

    #[test]
    fn test_ancestors_in_range_all_schemes() {
        let lws = [0.1, -3.0, 2.0, 0.0, -0.5, 1.0];
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for scheme in [
            ResampleScheme::Multinomial,
            ResampleScheme::Systematic,
            ResampleScheme::Stratified,
        ] {
            let r = EssResampler::new(1.0, scheme);
            for _ in 0..50 {
                let a = r.ancestors(&mut rng, &lws);
                assert_eq!(a.len(), lws.len());
                assert!(a.iter().all(|&i| i < lws.len()));
                assert!(a.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }

    #[test]
    fn test_zero_weight_particles_never_selected() {
        let lws = [f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY, 0.0];
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let r = EssResampler::new(1.0, ResampleScheme::Multinomial);
        for _ in 0..100 {
            let a = r.ancestors(&mut rng, &lws);
            assert!(a.iter().all(|&i| i == 1 || i == 3));
        }
    }

    #[test]
    fn test_systematic_uniform_weights_is_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let r = EssResampler::new(1.0, ResampleScheme::Systematic);
        assert_eq!(r.ancestors(&mut rng, &[0.0; 5]), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_resample_leaves_uniform_weights() {
        let schedule = Schedule::from_points(&[(0.0, true)]).unwrap();
        let mut pop = population(8);
        pop.set_log_weights(&[0.0, -10.0, -10.0, -10.0, -10.0, -10.0, -10.0, 3.0]);
        pop.update_ess(&LocalComm);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let fired = EssResampler::default()
            .resample(&mut rng, schedule.begin().get(), &mut pop)
            .unwrap();
        assert!(fired);
        assert!(pop.log_weights().iter().all(|&w| w == 0.0));
        assert!(pop.ancestors().iter().all(|&a| a < 8));
        for (slot, &a) in pop.ancestors().iter().enumerate() {
            assert_eq!(pop.particle(slot).latent, a);
        }
    }

    #[test]
    fn test_threshold_at_half_population() {
        let schedule = Schedule::from_points(&[(0.0, true)]).unwrap();
        let r = EssResampler::new(0.5, ResampleScheme::Systematic);
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        // two equal-ish particles: w = [p, 1 - p, 0, 0] with ESS 1.5
        let p = (2.0 + (4.0f64 - 8.0 / 3.0).sqrt()) / 4.0;
        let mut pop = population(4);
        pop.set_log_weights(&[p.ln(), (1.0 - p).ln(), f64::NEG_INFINITY, f64::NEG_INFINITY]);
        pop.update_ess(&LocalComm);
        assert!((pop.ess - 1.5).abs() < 1e-9);
        assert!(r.resample(&mut rng, schedule.begin().get(), &mut pop).unwrap());

        // w = [a, b, b, b] with ESS 3.8
        let c = 1.0 / 3.8;
        let a = (2.0 + (4.0f64 - 16.0 * (1.0 - 3.0 * c)).sqrt()) / 8.0;
        let b = (1.0 - a) / 3.0;
        let mut pop = population(4);
        pop.set_log_weights(&[a.ln(), b.ln(), b.ln(), b.ln()]);
        pop.update_ess(&LocalComm);
        assert!((pop.ess - 3.8).abs() < 1e-9);
        assert!(!r.resample(&mut rng, schedule.begin().get(), &mut pop).unwrap());
    }

    #[test]
    fn test_declined_resample_resets_ancestors() {
        let schedule = Schedule::from_points(&[(0.0, true)]).unwrap();
        let mut pop = population(4);
        pop.ancestors_mut().copy_from_slice(&[3, 3, 3, 3]);
        pop.update_ess(&LocalComm);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let fired = EssResampler::default()
            .resample(&mut rng, schedule.begin().get(), &mut pop)
            .unwrap();
        assert!(!fired);
        assert_eq!(pop.ancestors(), &[0, 1, 2, 3]);
    }
}
