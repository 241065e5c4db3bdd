//! Bootstrap particle filter for the AR(1) model.
//!
//! Each parameter particle carries a [`LatentState`] of `n_latent` state
//! particles. Observation weights sum the per-replicate log-densities with
//! the max log-density reduction kernel: one lane per (state particle,
//! replicate) pair.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use smc2_core::kernel::{MaxLogDensityKernel, ReductionMode};
use smc2_core::math;
use smc2_core::{
    EssResampler, Filter, FilterError, ResampleScheme, ScheduleElement, ScheduleIter, ThetaParticle,
};

use crate::data::Observations;
use crate::model::{Ar1Model, Ar1Params};

/// State particles and their log-weights at the current time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatentState {
    pub time: f64,
    pub x: Vec<f64>,
    pub log_weights: Vec<f64>,
    /// Ancestors drawn by the most recent resample of the state particles.
    pub ancestors: Vec<usize>,
}

/// History of state particles, for tracing a trajectory at the end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathBuffer {
    pub times: Vec<f64>,
    pub particles: Vec<Vec<f64>>,
    pub ancestors: Vec<Vec<usize>>,
    /// Trajectory drawn by `sample_path`.
    pub path: Vec<f64>,
}

impl PathBuffer {
    pub fn clear(&mut self) {
        self.times.clear();
        self.particles.clear();
        self.ancestors.clear();
        self.path.clear();
    }
}

/// Fixed parameters for initialisation: every particle starts from `theta`
/// instead of a prior draw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialValues {
    pub theta: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct BootstrapFilter {
    model: Ar1Model,
    observations: Observations,
    n_latent: usize,
    mode: ReductionMode,
    /// Random-walk standard deviation per parameter.
    proposal_sd: Vec<f64>,
    resampler: EssResampler,
}

impl BootstrapFilter {
    pub fn new(
        model: Ar1Model,
        observations: Observations,
        n_latent: usize,
        mode: ReductionMode,
        proposal_sd: Vec<f64>,
    ) -> Result<Self, FilterError> {
        if n_latent == 0 {
            return Err(FilterError::InvalidInput("at least one state particle is required".into()));
        }
        if proposal_sd.len() != crate::model::N_PARAMS || proposal_sd.iter().any(|s| !(*s >= 0.0)) {
            return Err(FilterError::InvalidInput(format!(
                "proposal sd must hold {} non-negative values",
                crate::model::N_PARAMS
            )));
        }
        if let Some(bad) = observations
            .values
            .iter()
            .position(|ys| ys.len() != model.replicates())
        {
            return Err(FilterError::InvalidInput(format!(
                "observation {} has {} replicates, model expects {}",
                bad,
                observations.values[bad].len(),
                model.replicates()
            )));
        }
        Ok(Self {
            model,
            observations,
            n_latent,
            mode,
            proposal_sd,
            // state particles are resampled at every step
            resampler: EssResampler::new(f64::INFINITY, ResampleScheme::Systematic),
        })
    }

    pub fn model(&self) -> &Ar1Model {
        &self.model
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }

    /// Empty latent state and output buffer, for building a population.
    pub fn blank(&self) -> (ThetaParticle<LatentState>, PathBuffer) {
        (ThetaParticle::new(Vec::new(), LatentState::default()), PathBuffer::default())
    }

    /// Draw state particles from the stationary distribution of `theta`.
    fn init_latent<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<LatentState>,
    ) -> Result<(), FilterError> {
        let p = Ar1Params::from_theta(&s.theta)?;
        let latent = &mut s.latent;
        latent.time = now.time;
        latent.x.clear();
        for _ in 0..self.n_latent {
            latent.x.push(self.model.sample_initial(rng, &p)?);
        }
        latent.log_weights.clear();
        latent.log_weights.resize(self.n_latent, 0.0);
        latent.ancestors.clear();
        latent.ancestors.extend(0..self.n_latent);
        s.reset_likelihood();
        Ok(())
    }

    /// Resample and propagate the state particles to `now`.
    fn predict<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<LatentState>,
    ) -> Result<(), FilterError> {
        let p = Ar1Params::from_theta(&s.theta)?;
        let latent = &mut s.latent;
        if math::logsumexp(&latent.log_weights) == f64::NEG_INFINITY {
            return Err(FilterError::Degenerate { time: latent.time });
        }
        let ancestors = self.resampler.ancestors(rng, &latent.log_weights);
        latent.x = ancestors.iter().map(|&a| latent.x[a]).collect();
        latent.ancestors = ancestors;
        latent.log_weights.iter_mut().for_each(|w| *w = 0.0);
        if now.time > latent.time {
            for x in latent.x.iter_mut() {
                *x = self.model.transition(rng, &p, *x);
            }
            latent.time = now.time;
        }
        Ok(())
    }
}

impl Filter for BootstrapFilter {
    type Latent = LatentState;
    type Output = PathBuffer;
    type Input = InitialValues;

    fn log_prior(&self, theta: &[f64]) -> f64 {
        self.model.log_prior(theta)
    }

    fn init<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<LatentState>,
        _out: &mut PathBuffer,
        input: &InitialValues,
    ) -> Result<(), FilterError> {
        s.theta = match &input.theta {
            Some(theta) => theta.clone(),
            None => self.model.sample_prior(rng),
        };
        s.log_prior = self.log_prior(&s.theta);
        if s.log_prior == f64::NEG_INFINITY {
            return Err(FilterError::InvalidInput(format!(
                "initial parameters {:?} are outside the prior support",
                s.theta
            )));
        }
        s.log_proposal = f64::NEG_INFINITY;
        self.init_latent(rng, now, s)
    }

    fn output0(&self, _s: &ThetaParticle<LatentState>, out: &mut PathBuffer) {
        out.clear();
    }

    fn correct<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<LatentState>,
    ) -> Result<(), FilterError> {
        if !now.observed {
            return Ok(());
        }
        let ys = self.observations.get(now.index_obs).ok_or_else(|| {
            FilterError::InvalidInput(format!("no observation with index {}", now.index_obs))
        })?;

        let latent = &mut s.latent;
        let before = math::logsumexp(&latent.log_weights);
        let kernel = MaxLogDensityKernel::new(latent.x.len(), ys.len(), self.mode);
        let mut totals = vec![0.0; latent.x.len()];
        let x = &latent.x;
        kernel.reduce(|p, j| self.model.log_observation(ys[j], x[p]), &mut totals);
        for (w, t) in latent.log_weights.iter_mut().zip(&totals) {
            *w += t;
        }
        let after = math::logsumexp(&latent.log_weights);
        if after == f64::NEG_INFINITY {
            return Err(FilterError::Degenerate { time: now.time });
        }
        s.push_increment(now.index_obs, after - before);
        Ok(())
    }

    fn output(&self, now: &ScheduleElement, s: &ThetaParticle<LatentState>, out: &mut PathBuffer) {
        out.times.push(now.time);
        out.particles.push(s.latent.x.clone());
        out.ancestors.push(s.latent.ancestors.clone());
    }

    fn step<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        iter: &mut ScheduleIter<'_>,
        last: ScheduleIter<'_>,
        s: &mut ThetaParticle<LatentState>,
        out: &mut PathBuffer,
    ) -> Result<f64, FilterError> {
        if iter.is_end() || iter.ahead(1) == last {
            return Err(FilterError::Schedule(format!(
                "cannot step past position {}",
                iter.position()
            )));
        }
        iter.advance();
        let now = iter.get();
        let before = s.log_likelihood;
        self.predict(rng, now, s)?;
        self.correct(rng, now, s)?;
        self.output(now, s, out);
        Ok(s.log_likelihood - before)
    }

    fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        _first: &ScheduleElement,
        s1: &mut ThetaParticle<LatentState>,
        s2: &mut ThetaParticle<LatentState>,
        _out2: &mut PathBuffer,
    ) -> Result<(), FilterError> {
        s2.theta.clear();
        for (t, sd) in s1.theta.iter().zip(&self.proposal_sd) {
            s2.theta.push(t + sd * rng.sample::<f64, _>(StandardNormal));
        }
        s2.log_prior = self.log_prior(&s2.theta);
        // symmetric kernel: the proposal term cancels
        s1.log_proposal = f64::NEG_INFINITY;
        s2.log_proposal = f64::NEG_INFINITY;
        s2.reset_likelihood();
        Ok(())
    }

    fn filter<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        first: ScheduleIter<'_>,
        last: ScheduleIter<'_>,
        s: &mut ThetaParticle<LatentState>,
        out: &mut PathBuffer,
    ) -> Result<f64, FilterError> {
        let start = first
            .try_get()
            .ok_or_else(|| FilterError::Schedule("filter started past the end".into()))?;
        self.init_latent(rng, start, s)?;
        self.output0(s, out);
        self.correct(rng, start, s)?;
        self.output(start, s, out);
        let mut iter = first;
        while iter.ahead(1) != last {
            self.step(rng, &mut iter, last, s, out)?;
        }
        Ok(s.log_likelihood)
    }

    fn sample_path<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        s: &ThetaParticle<LatentState>,
        out: &mut PathBuffer,
    ) -> Result<(), FilterError> {
        let Some(last) = out.particles.len().checked_sub(1) else {
            out.path.clear();
            return Ok(());
        };
        let w = math::normalised_weights(&s.latent.log_weights);
        if w.iter().all(|&x| x == 0.0) {
            return Err(FilterError::Degenerate { time: s.latent.time });
        }
        let u: f64 = rng.gen();
        let mut acc = 0.0;
        let mut b = w.len() - 1;
        for (i, wi) in w.iter().enumerate() {
            acc += wi;
            if u < acc {
                b = i;
                break;
            }
        }

        let mut path = vec![0.0; last + 1];
        for t in (0..=last).rev() {
            path[t] = out.particles[t][b];
            b = out.ancestors[t][b];
        }
        out.path = path;
        Ok(())
    }
}
