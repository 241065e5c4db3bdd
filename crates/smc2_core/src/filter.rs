//! Contract for the embedded latent-state particle filter.
//!
//! The orchestrator drives one filter run per parameter particle. Methods take
//! the particle and its output buffer explicitly so the same `Filter` value
//! serves the whole population, including from parallel workers.

use rand::Rng;

use crate::adapter::Proposal;
use crate::error::FilterError;
use crate::particle::ThetaParticle;
use crate::schedule::{ScheduleElement, ScheduleIter};

pub trait Filter: Sync {
    /// Latent-state population carried inside each parameter particle.
    type Latent: Send;
    /// Per-particle output buffer (trajectory history, sampled path).
    type Output: Send;
    /// Initialisation input passed through from the caller.
    type Input: Sync + ?Sized;

    /// Log prior density of a parameter vector; `-inf` outside the support.
    fn log_prior(&self, theta: &[f64]) -> f64;

    /// Initialise the latent population at `now` and reset the particle's
    /// likelihood bookkeeping.
    fn init<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<Self::Latent>,
        out: &mut Self::Output,
        input: &Self::Input,
    ) -> Result<(), FilterError>;

    /// Write the initial state to the output buffer.
    fn output0(&self, s: &ThetaParticle<Self::Latent>, out: &mut Self::Output);

    /// Weight the latent particles against the observation at `now` (if any)
    /// and fold the increment into `s.log_likelihood`.
    fn correct<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<Self::Latent>,
    ) -> Result<(), FilterError>;

    /// Record the state at `now`.
    fn output(
        &self,
        now: &ScheduleElement,
        s: &ThetaParticle<Self::Latent>,
        out: &mut Self::Output,
    );

    /// Advance `iter` by one schedule element: resample the latent particles,
    /// predict to the new time, correct if observed, output. Returns the
    /// log-likelihood increment (zero for unobserved elements).
    fn step<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        iter: &mut ScheduleIter<'_>,
        last: ScheduleIter<'_>,
        s: &mut ThetaParticle<Self::Latent>,
        out: &mut Self::Output,
    ) -> Result<f64, FilterError>;

    /// Default proposal: `s2` becomes a perturbation of `s1`. Implementations
    /// using a symmetric kernel leave both `log_proposal` fields at `-inf`.
    fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        first: &ScheduleElement,
        s1: &mut ThetaParticle<Self::Latent>,
        s2: &mut ThetaParticle<Self::Latent>,
        out2: &mut Self::Output,
    ) -> Result<(), FilterError>;

    /// Proposal from an adapted distribution. Sets `s2.log_proposal` to the
    /// density of the forward move and `s1.log_proposal` to the reverse one.
    fn propose_with<R: Rng + ?Sized, Q: Proposal>(
        &self,
        rng: &mut R,
        _first: &ScheduleElement,
        s1: &mut ThetaParticle<Self::Latent>,
        s2: &mut ThetaParticle<Self::Latent>,
        _out2: &mut Self::Output,
        q: &Q,
    ) -> Result<(), FilterError> {
        let theta = q.sample(rng, &s1.theta)?;
        s2.log_proposal = q.log_density(&s1.theta, &theta);
        s1.log_proposal = q.log_density(&theta, &s1.theta);
        s2.log_prior = self.log_prior(&theta);
        s2.theta = theta;
        s2.reset_likelihood();
        s1.sanitize();
        s2.sanitize();
        Ok(())
    }

    /// Run the filter from scratch over `[first, last)` and return the final
    /// log-likelihood estimate (also stored in `s.log_likelihood`).
    fn filter<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        first: ScheduleIter<'_>,
        last: ScheduleIter<'_>,
        s: &mut ThetaParticle<Self::Latent>,
        out: &mut Self::Output,
    ) -> Result<f64, FilterError>;

    /// Draw one full latent trajectory into the output buffer.
    fn sample_path<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        s: &ThetaParticle<Self::Latent>,
        out: &mut Self::Output,
    ) -> Result<(), FilterError>;
}
