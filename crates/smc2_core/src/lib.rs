//! SMC² core runtime
//!
//! Marginal sequential importance resampling over static parameters. Each
//! parameter particle carries its own particle filter over the latent state;
//! the population is advanced through a [`schedule::Schedule`], resampled by
//! importance weight, and rejuvenated with particle-marginal
//! Metropolis-Hastings moves.
//!
//! Layout:
//! - [`schedule`]: time schedule and forward cursors
//! - [`particle`] / [`population`]: parameter particles and their population
//! - [`filter`], [`adapter`], [`resampler`], [`output`]: collaborator contracts
//! - [`sampler`]: the [`sampler::MarginalSir`] orchestrator
//! - [`comm`]: explicit communicator context (rank, size, all-reduce)
//! - [`network`]: tree-network membership with deferred reconciliation
//! - [`kernel`]: barrier-round max log-density reduction (CPU, optional GPU)

pub mod adapter;
pub mod comm;
pub mod config;
pub mod error;
pub mod filter;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod kernel;
pub mod math;
pub mod network;
pub mod output;
pub mod particle;
pub mod population;
pub mod resampler;
pub mod sampler;
pub mod schedule;
#[cfg(feature = "diagnostics")]
pub mod snapshot;

pub use adapter::{Adapter, GaussianAdapter, GaussianProposal, Proposal};
pub use comm::{Communicator, LocalComm, ThreadComm};
pub use config::{KernelConfig, ResampleScheme, SamplerConfig};
pub use error::{FilterError, LikelihoodEstimate, SamplerError};
pub use filter::Filter;
pub use kernel::{MaxLogDensityKernel, ReductionMode};
pub use network::TreeNode;
pub use output::{MemorySink, OutputSink};
pub use particle::ThetaParticle;
pub use population::Population;
pub use resampler::{EssResampler, Resampler};
pub use sampler::{MarginalSir, Phase, SampleSummary};
pub use schedule::{Schedule, ScheduleElement, ScheduleIter};
