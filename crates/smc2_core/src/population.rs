//! Population of parameter particles.
//!
//! Holds the particles, their output buffers, log-weights, ancestors and the
//! scratch slot used for proposals during rejuvenation. In a distributed run a
//! `Population` is one node's shard; global quantities (ESS, pooled
//! log-weight, global size) are computed through a [`Communicator`].

use crate::comm::Communicator;
use crate::error::SamplerError;
use crate::math;
use crate::particle::ThetaParticle;
use log::warn;

#[derive(Debug, Clone)]
pub struct Population<X, O> {
    particles: Vec<ThetaParticle<X>>,
    outputs: Vec<O>,
    log_weights: Vec<f64>,
    ancestors: Vec<usize>,
    scratch: ThetaParticle<X>,
    scratch_output: O,
    /// Global particle count as of the last [`Population::update_ess`].
    total: usize,
    /// Effective sample size over the whole (possibly distributed) population.
    pub ess: f64,
    /// Running pooled marginal log-likelihood estimate.
    pub log_likelihood: f64,
    /// Evidence folded in at the most recent resample (zero before any).
    pub log_likelihood_banked: f64,
    /// Marginal log-likelihood increment per observation index.
    pub log_increments: Vec<f64>,
}

impl<X, O> Population<X, O> {
    /// Build from parallel particle and output vectors plus one scratch pair.
    pub fn new(
        particles: Vec<ThetaParticle<X>>,
        outputs: Vec<O>,
        scratch: ThetaParticle<X>,
        scratch_output: O,
    ) -> Result<Self, SamplerError> {
        if particles.is_empty() {
            return Err(SamplerError::EmptyPopulation);
        }
        if particles.len() != outputs.len() {
            return Err(SamplerError::Output(format!(
                "{} particles but {} output buffers",
                particles.len(),
                outputs.len()
            )));
        }
        let n = particles.len();
        Ok(Self {
            particles,
            outputs,
            log_weights: vec![0.0; n],
            ancestors: (0..n).collect(),
            scratch,
            scratch_output,
            total: n,
            ess: n as f64,
            log_likelihood: 0.0,
            log_likelihood_banked: 0.0,
            log_increments: Vec::new(),
        })
    }

    /// `n` particles built by `make`, plus one more for the scratch slot.
    pub fn from_fn<F>(n: usize, mut make: F) -> Result<Self, SamplerError>
    where
        F: FnMut(usize) -> (ThetaParticle<X>, O),
    {
        let (particles, outputs): (Vec<_>, Vec<_>) = (0..n).map(&mut make).unzip();
        let (scratch, scratch_output) = make(n);
        Self::new(particles, outputs, scratch, scratch_output)
    }

    /// Local number of particles.
    pub fn size(&self) -> usize {
        self.particles.len()
    }

    /// Global number of particles, refreshed by [`Population::update_ess`].
    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn particles(&self) -> &[ThetaParticle<X>] {
        &self.particles
    }

    pub fn particle(&self, p: usize) -> &ThetaParticle<X> {
        &self.particles[p]
    }

    pub fn outputs(&self) -> &[O] {
        &self.outputs
    }

    pub fn output(&self, p: usize) -> &O {
        &self.outputs[p]
    }

    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    pub fn ancestors(&self) -> &[usize] {
        &self.ancestors
    }

    pub fn ancestors_mut(&mut self) -> &mut [usize] {
        &mut self.ancestors
    }

    pub fn scratch(&self) -> (&ThetaParticle<X>, &O) {
        (&self.scratch, &self.scratch_output)
    }

    /// Particles, outputs and log-weights zipped for per-particle work.
    pub fn lanes_mut(&mut self) -> (&mut [ThetaParticle<X>], &mut [O], &mut [f64]) {
        (&mut self.particles, &mut self.outputs, &mut self.log_weights)
    }

    /// Particle `p`, its output, and the scratch pair, borrowed together.
    pub fn with_scratch(
        &mut self,
        p: usize,
    ) -> (&mut ThetaParticle<X>, &mut O, &mut ThetaParticle<X>, &mut O) {
        (
            &mut self.particles[p],
            &mut self.outputs[p],
            &mut self.scratch,
            &mut self.scratch_output,
        )
    }

    /// Exchange particle `p` (and its output buffer) with the scratch slot.
    pub fn swap_with_scratch(&mut self, p: usize) {
        core::mem::swap(&mut self.particles[p], &mut self.scratch);
        core::mem::swap(&mut self.outputs[p], &mut self.scratch_output);
    }

    pub fn set_log_weights(&mut self, lws: &[f64]) {
        assert_eq!(lws.len(), self.log_weights.len(), "log-weight length mismatch");
        self.log_weights.copy_from_slice(lws);
    }

    /// Set every log-weight to zero.
    pub fn reset_weights(&mut self) {
        self.log_weights.iter_mut().for_each(|w| *w = 0.0);
    }

    /// Global number of particles.
    pub fn global_size<C: Communicator + ?Sized>(&self, comm: &C) -> usize {
        comm.all_reduce_sum_u64(self.size() as u64) as usize
    }

    /// Global `(ess, logsumexp(log_weights))`.
    pub fn ess_reduce<C: Communicator + ?Sized>(&self, comm: &C) -> (f64, f64) {
        let shift = comm.all_reduce_max_f64(math::max_reduce(&self.log_weights));
        let (s1, s2) = math::ess_parts(&self.log_weights, shift);
        let sums = comm.all_reduce_sum_f64(&[s1, s2]);
        let ess = math::ess_from_parts(sums[0], sums[1]);
        let lse = if shift.is_finite() && sums[0] > 0.0 {
            shift + sums[0].ln()
        } else {
            f64::NEG_INFINITY
        };
        (ess, lse)
    }

    /// Recompute [`Population::ess`] and the global size; returns
    /// `logsumexp(log_weights)`.
    pub fn update_ess<C: Communicator + ?Sized>(&mut self, comm: &C) -> f64 {
        self.total = self.global_size(comm);
        let (ess, lse) = self.ess_reduce(comm);
        if ess == 0.0 {
            warn!("population weights are degenerate: every log-weight is -inf");
        }
        self.ess = ess;
        lse
    }

    /// Pooled estimate `banked + logsumexp(lw) - log(P)`.
    pub fn pooled_log_likelihood(&self, lse: f64, global_size: usize) -> f64 {
        self.log_likelihood_banked + lse - (global_size as f64).ln()
    }

    pub fn set_log_increment(&mut self, index_obs: usize, increment: f64) {
        if self.log_increments.len() <= index_obs {
            self.log_increments.resize(index_obs + 1, 0.0);
        }
        self.log_increments[index_obs] = increment;
    }

    /// Record the current particle order as the identity genealogy.
    pub fn reset_ancestors(&mut self) {
        self.ancestors.iter_mut().enumerate().for_each(|(p, a)| *a = p);
    }
}

impl<X: Clone, O: Clone> Population<X, O> {
    /// Rebuild the particle set so that slot `i` holds a copy of the
    /// pre-resample particle `ancestors[i]`. Each ancestor's final use moves
    /// the original; earlier uses clone it.
    pub fn permute(&mut self, ancestors: &[usize]) {
        let n = self.size();
        assert_eq!(ancestors.len(), n, "ancestor vector length mismatch");
        assert!(ancestors.iter().all(|&a| a < n), "ancestor index out of range");

        let mut last_use = vec![usize::MAX; n];
        for (slot, &a) in ancestors.iter().enumerate() {
            last_use[a] = slot;
        }

        let mut old_particles: Vec<Option<ThetaParticle<X>>> =
            core::mem::take(&mut self.particles).into_iter().map(Some).collect();
        let mut old_outputs: Vec<Option<O>> =
            core::mem::take(&mut self.outputs).into_iter().map(Some).collect();

        let mut particles = Vec::with_capacity(n);
        let mut outputs = Vec::with_capacity(n);
        for (slot, &a) in ancestors.iter().enumerate() {
            let (particle, output) = if last_use[a] == slot {
                (old_particles[a].take(), old_outputs[a].take())
            } else {
                (old_particles[a].clone(), old_outputs[a].clone())
            };
            match (particle, output) {
                (Some(particle), Some(output)) => {
                    particles.push(particle);
                    outputs.push(output);
                }
                // slots are only taken at their ancestor's last use
                _ => unreachable!("ancestor {a} consumed before its last use"),
            }
        }
        self.particles = particles;
        self.outputs = outputs;
        self.ancestors.copy_from_slice(ancestors);
    }
}
