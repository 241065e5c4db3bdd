//! Marginal sequential importance resampling (SMC²) orchestrator.
//!
//! [`MarginalSir`] advances a [`Population`] of parameter particles through a
//! [`Schedule`]. Between observations it adapts the proposal, resamples the
//! population when its weights degenerate and rejuvenates the resampled
//! particles with particle-marginal Metropolis-Hastings moves.
//!
//! Every node of a distributed run drives its own shard. Collectives are
//! issued in the same order on all nodes: global size and ESS before each
//! resample, move and acceptance counts after each rejuvenation, global size
//! and ESS after each step and at termination.

use std::io::Write;

use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::adapter::Adapter;
use crate::comm::Communicator;
use crate::config::SamplerConfig;
use crate::error::{FilterError, LikelihoodEstimate, SamplerError};
use crate::filter::Filter;
use crate::output::OutputSink;
use crate::particle::{sanitize, ThetaParticle};
use crate::population::Population;
use crate::resampler::Resampler;
use crate::schedule::{Schedule, ScheduleElement, ScheduleIter};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Initialized,
    Stepping,
    Terminated,
}

/// Result of a complete [`MarginalSir::sample`] run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSummary {
    /// Final pooled marginal log-likelihood estimate.
    pub log_likelihood: f64,
    pub steps: usize,
    pub resamples: usize,
    /// Acceptance rate of the most recent rejuvenation.
    pub accept_rate: f64,
    pub ess: f64,
}

/// Outcome of the accept/reject test before any uniform is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    Accept,
    Reject,
    /// Accept if `ln(u) < ratio`.
    Test(f64),
}

/// Particle-marginal Metropolis-Hastings decision for replacing `current`
/// by `proposed`, whose likelihood estimate is `estimate`.
fn decide<X>(current: &ThetaParticle<X>, proposed: &ThetaParticle<X>, estimate: LikelihoodEstimate) -> Decision {
    let LikelihoodEstimate::Valid(ll2) = estimate else {
        return Decision::Reject;
    };
    if !current.log_likelihood.is_finite() {
        return Decision::Accept;
    }
    let loglr = ll2 - current.log_likelihood;
    let logpr = proposed.log_prior - current.log_prior;
    let logqr = if !current.log_proposal.is_finite() && !proposed.log_proposal.is_finite() {
        0.0
    } else {
        current.log_proposal - proposed.log_proposal
    };
    let ratio = sanitize(loglr + logpr + logqr);
    if ratio == f64::NEG_INFINITY {
        Decision::Reject
    } else {
        Decision::Test(ratio)
    }
}

/// One independent stream per particle, drawn from `rng` in particle order.
fn fork<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<ChaCha8Rng> {
    (0..n).map(|_| ChaCha8Rng::seed_from_u64(rng.gen())).collect()
}

pub struct MarginalSir<F, A, Rs, C> {
    filter: F,
    adapter: A,
    resampler: Rs,
    comm: C,
    config: SamplerConfig,
    progress: Box<dyn Write + Send>,
    phase: Phase,
    last_resample: bool,
    last_accept_rate: f64,
    steps: usize,
    resamples: usize,
    #[cfg(feature = "diagnostics")]
    snapshot_dir: Option<std::path::PathBuf>,
}

impl<F, A, Rs, C> MarginalSir<F, A, Rs, C>
where
    F: Filter,
    A: Adapter,
    Rs: Resampler,
    C: Communicator,
{
    pub fn new(filter: F, adapter: A, resampler: Rs, comm: C, config: SamplerConfig) -> Self {
        Self {
            filter,
            adapter,
            resampler,
            comm,
            config,
            progress: Box::new(std::io::stderr()),
            phase: Phase::Created,
            last_resample: false,
            last_accept_rate: 0.0,
            steps: 0,
            resamples: 0,
            #[cfg(feature = "diagnostics")]
            snapshot_dir: None,
        }
    }

    /// Redirect progress lines (stderr by default).
    pub fn with_progress(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.progress = writer;
        self
    }

    /// Dump a population snapshot into `dir` after init and every step.
    #[cfg(feature = "diagnostics")]
    pub fn with_snapshot_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_resample(&self) -> bool {
        self.last_resample
    }

    pub fn last_accept_rate(&self) -> f64 {
        self.last_accept_rate
    }

    fn require(&self, operation: &'static str, allowed: &[Phase]) -> Result<(), SamplerError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SamplerError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn running(&self, operation: &'static str) -> Result<(), SamplerError> {
        self.require(operation, &[Phase::Initialized, Phase::Stepping])
    }

    /// Run the whole schedule: init, step until the last element, term,
    /// final report and output.
    pub fn sample<R, O>(
        &mut self,
        rng: &mut R,
        schedule: &Schedule,
        population: &mut Population<F::Latent, F::Output>,
        out: &mut O,
        input: &F::Input,
    ) -> Result<SampleSummary, SamplerError>
    where
        R: Rng + ?Sized,
        O: OutputSink<F::Latent, F::Output>,
        F::Latent: Clone,
        F::Output: Clone,
    {
        let first = schedule.begin();
        let last = schedule.end();
        let mut iter = first;

        self.init(rng, first, population, out, input)?;
        self.snapshot(iter.get(), population)?;
        while iter.ahead(1) != last {
            self.step(rng, first, &mut iter, last, population, out)?;
            self.snapshot(iter.get(), population)?;
        }
        self.term(rng, population)?;
        self.report_t(iter.get())?;
        self.output_t(population, out)?;

        Ok(SampleSummary {
            log_likelihood: population.log_likelihood,
            steps: self.steps,
            resamples: self.resamples,
            accept_rate: self.last_accept_rate,
            ess: population.ess,
        })
    }

    /// Initialise every particle's filter at `first` and weight it by its
    /// first correction.
    pub fn init<R, O>(
        &mut self,
        rng: &mut R,
        first: ScheduleIter<'_>,
        population: &mut Population<F::Latent, F::Output>,
        out: &mut O,
        input: &F::Input,
    ) -> Result<(), SamplerError>
    where
        R: Rng + ?Sized,
        O: OutputSink<F::Latent, F::Output>,
    {
        self.require("init", &[Phase::Created])?;
        let now = first
            .try_get()
            .ok_or_else(|| SamplerError::Schedule("init called on an empty schedule".into()))?;

        let filter = &self.filter;
        let mut rngs = fork(rng, population.size());
        let (particles, outputs, log_weights) = population.lanes_mut();
        particles
            .par_iter_mut()
            .zip(outputs.par_iter_mut())
            .zip(log_weights.par_iter_mut())
            .zip(rngs.par_iter_mut())
            .enumerate()
            .try_for_each(|(p, (((s, o), lw), rng))| {
                Self::init_one(filter, rng, now, s, o, input)
                    .map_err(|source| SamplerError::Init { particle: p, source })?;
                s.sanitize();
                *lw = s.log_likelihood;
                Ok::<(), SamplerError>(())
            })?;

        population.reset_ancestors();
        population.log_likelihood = 0.0;
        population.log_likelihood_banked = 0.0;
        population.log_increments.clear();
        out.clear();

        self.last_resample = false;
        self.last_accept_rate = 0.0;
        self.steps = 0;
        self.resamples = 0;
        self.phase = Phase::Initialized;
        debug!("initialised {} theta-particles at time {}", population.size(), now.time);
        Ok(())
    }

    fn init_one<R: Rng + ?Sized>(
        filter: &F,
        rng: &mut R,
        now: &ScheduleElement,
        s: &mut ThetaParticle<F::Latent>,
        out: &mut F::Output,
        input: &F::Input,
    ) -> Result<(), FilterError> {
        filter.init(rng, now, s, out, input)?;
        filter.output0(s, out);
        filter.correct(rng, now, s)?;
        filter.output(now, s, out);
        Ok(())
    }

    /// Advance through unobserved elements up to and including the next
    /// observed one (or the last element), then update ESS and the pooled
    /// log-likelihood.
    pub fn step<'s, R, O>(
        &mut self,
        rng: &mut R,
        first: ScheduleIter<'s>,
        iter: &mut ScheduleIter<'s>,
        last: ScheduleIter<'s>,
        population: &mut Population<F::Latent, F::Output>,
        _out: &mut O,
    ) -> Result<(), SamplerError>
    where
        R: Rng + ?Sized,
        O: OutputSink<F::Latent, F::Output>,
        F::Latent: Clone,
        F::Output: Clone,
    {
        self.running("step")?;
        if iter.is_end() || iter.ahead(1) == last {
            return Err(SamplerError::Schedule(format!(
                "no schedule element after position {}",
                iter.position()
            )));
        }
        self.phase = Phase::Stepping;

        loop {
            let now = iter.get();
            self.adapt(population)?;
            self.resample(rng, now, population)?;
            self.rejuvenate(rng, first, iter.ahead(1), population)?;
            self.report(now, population)?;

            let filter = &self.filter;
            let start = *iter;
            let mut rngs = fork(rng, population.size());
            let (particles, outputs, log_weights) = population.lanes_mut();
            particles
                .par_iter_mut()
                .zip(outputs.par_iter_mut())
                .zip(log_weights.par_iter_mut())
                .zip(rngs.par_iter_mut())
                .enumerate()
                .try_for_each(|(p, (((s, o), lw), rng))| {
                    let mut it = start;
                    match filter.step(rng, &mut it, last, s, o) {
                        Ok(increment) => {
                            *lw = sanitize(*lw + increment);
                            Ok(())
                        }
                        Err(e) if e.is_numerical() => {
                            if *lw != f64::NEG_INFINITY {
                                warn!("theta-particle {} dropped: {}", p, e);
                            }
                            s.invalidate();
                            *lw = f64::NEG_INFINITY;
                            Ok(())
                        }
                        Err(source) => Err(SamplerError::Filter { particle: p, source }),
                    }
                })?;
            iter.advance();

            if iter.ahead(1) == last || iter.is_observed() {
                break;
            }
        }

        let lse = population.update_ess(&self.comm);
        let pooled = population.pooled_log_likelihood(lse, population.total_size());
        let increment = sanitize(pooled - population.log_likelihood);
        population.set_log_increment(iter.index_obs(), increment);
        population.log_likelihood = pooled;
        self.steps += 1;
        Ok(())
    }

    /// Refit the adapter to the current population.
    pub fn adapt<X, O>(&mut self, population: &Population<X, O>) -> Result<(), SamplerError> {
        self.running("adapt")?;
        self.adapter.clear();
        self.adapter.add(population);
        if self.adapter.ready() {
            self.adapter.adapt();
        }
        Ok(())
    }

    /// Refresh the global ESS and delegate to the resampler. When it fires,
    /// the evidence carried by the current weights is banked first.
    pub fn resample<R>(
        &mut self,
        rng: &mut R,
        now: &ScheduleElement,
        population: &mut Population<F::Latent, F::Output>,
    ) -> Result<(), SamplerError>
    where
        R: Rng + ?Sized,
        F::Latent: Clone,
        F::Output: Clone,
    {
        self.running("resample")?;
        let lse = population.update_ess(&self.comm);
        let evidence = population.pooled_log_likelihood(lse, population.total_size())
            - population.log_likelihood_banked;
        self.last_resample = self.resampler.resample(rng, now, population)?;
        if self.last_resample {
            population.log_likelihood_banked = sanitize(population.log_likelihood_banked + evidence);
            self.resamples += 1;
        }
        Ok(())
    }

    /// PMMH moves over `[first, last)` for every particle, if the last
    /// resample fired.
    pub fn rejuvenate<R>(
        &mut self,
        rng: &mut R,
        first: ScheduleIter<'_>,
        last: ScheduleIter<'_>,
        population: &mut Population<F::Latent, F::Output>,
    ) -> Result<(), SamplerError>
    where
        R: Rng + ?Sized,
    {
        self.running("rejuvenate")?;
        if !self.last_resample {
            return Ok(());
        }
        let start = first
            .try_get()
            .ok_or_else(|| SamplerError::Schedule("rejuvenate called on an empty schedule".into()))?;
        let proposal = if self.adapter.ready() {
            self.adapter.proposal()
        } else {
            None
        };

        let mut naccept: u64 = 0;
        for p in 0..population.size() {
            for _ in 0..self.config.nmoves {
                let (s1, _, s2, out2) = population.with_scratch(p);
                let proposed = match proposal {
                    Some(q) => self.filter.propose_with(rng, start, s1, s2, out2, q),
                    None => self.filter.propose(rng, start, s1, s2, out2),
                }
                .and_then(|()| {
                    if s2.log_prior.is_finite() {
                        self.filter.filter(rng, first, last, s2, out2)
                    } else {
                        Ok(f64::NEG_INFINITY)
                    }
                });
                let estimate = match proposed {
                    Ok(ll) => LikelihoodEstimate::from_log_likelihood(ll),
                    Err(e) if e.is_numerical() => {
                        debug!("proposal for theta-particle {} rejected: {}", p, e);
                        LikelihoodEstimate::Invalid
                    }
                    Err(source) => return Err(SamplerError::Filter { particle: p, source }),
                };
                s2.log_likelihood = estimate.log_likelihood();

                let accept = match decide(s1, s2, estimate) {
                    Decision::Accept => true,
                    Decision::Reject => false,
                    Decision::Test(ratio) => rng.gen::<f64>().ln() < ratio,
                };
                if accept {
                    population.swap_with_scratch(p);
                    naccept += 1;
                }
            }
        }

        let ntotal = self
            .comm
            .all_reduce_sum_u64((self.config.nmoves * population.size()) as u64);
        let naccept = self.comm.all_reduce_sum_u64(naccept);
        self.last_accept_rate = if ntotal > 0 {
            naccept as f64 / ntotal as f64
        } else {
            0.0
        };
        debug!("rejuvenation accepted {} of {} moves", naccept, ntotal);
        Ok(())
    }

    /// One progress line for `now`.
    pub fn report<X, O>(&mut self, now: &ScheduleElement, population: &Population<X, O>) -> Result<(), SamplerError> {
        self.running("report")?;
        if !self.config.progress || !self.comm.is_root() {
            return Ok(());
        }
        write!(self.progress, "{}:\ttime {}\tESS {}", now.index_output, now.time, population.ess)?;
        if self.last_resample {
            write!(self.progress, "\tresample-move with acceptance rate {}", self.last_accept_rate)?;
        }
        writeln!(self.progress)?;
        Ok(())
    }

    /// Final progress line.
    pub fn report_t(&mut self, now: &ScheduleElement) -> Result<(), SamplerError> {
        self.require("report_t", &[Phase::Terminated])?;
        if self.config.progress && self.comm.is_root() {
            writeln!(self.progress, "{}:\ttime {}\t...finished.", now.index_output, now.time)?;
            self.progress.flush()?;
        }
        Ok(())
    }

    /// Fold the remaining weights into the pooled log-likelihood and draw a
    /// latent path for every particle.
    pub fn term<R>(&mut self, rng: &mut R, population: &mut Population<F::Latent, F::Output>) -> Result<(), SamplerError>
    where
        R: Rng + ?Sized,
    {
        self.running("term")?;
        let lse = population.update_ess(&self.comm);
        population.log_likelihood = population.pooled_log_likelihood(lse, population.total_size());

        let filter = &self.filter;
        let mut rngs = fork(rng, population.size());
        let (particles, outputs, _) = population.lanes_mut();
        particles
            .par_iter_mut()
            .zip(outputs.par_iter_mut())
            .zip(rngs.par_iter_mut())
            .enumerate()
            .try_for_each(|(p, ((s, o), rng))| match filter.sample_path(rng, s, o) {
                Ok(()) => Ok(()),
                Err(e) if e.is_numerical() => {
                    debug!("no path for theta-particle {}: {}", p, e);
                    Ok(())
                }
                Err(source) => Err(SamplerError::Filter { particle: p, source }),
            })?;

        self.phase = Phase::Terminated;
        Ok(())
    }

    pub fn output_t<O>(&self, population: &Population<F::Latent, F::Output>, out: &mut O) -> Result<(), SamplerError>
    where
        O: OutputSink<F::Latent, F::Output>,
    {
        self.require("output_t", &[Phase::Terminated])?;
        out.write(population)
    }

    #[cfg(feature = "diagnostics")]
    fn snapshot<X, O>(&self, now: &ScheduleElement, population: &Population<X, O>) -> Result<(), SamplerError> {
        if let Some(dir) = &self.snapshot_dir {
            crate::snapshot::write(dir, now.index_output, &self.comm, population)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "diagnostics"))]
    fn snapshot<X, O>(&self, _now: &ScheduleElement, _population: &Population<X, O>) -> Result<(), SamplerError> {
        Ok(())
    }
}
