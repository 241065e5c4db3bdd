//! SMC² simulation engine
//!
//! A concrete state-space model for driving [`smc2_core::MarginalSir`] end
//! to end: an AR(1) latent process with replicate Gaussian observations, a
//! bootstrap particle filter implementing [`smc2_core::Filter`], synthetic
//! data generation and a JSON output sink.

pub mod data;
pub mod filter;
pub mod model;
pub mod sink;

pub use data::{simulate, DataError, Observations, Simulated};
pub use filter::{BootstrapFilter, InitialValues, LatentState, PathBuffer};
pub use model::{Ar1Model, Ar1Params, ModelConfig};
pub use sink::{JsonSink, RunRecord};

use smc2_core::{Population, SamplerError};

/// `n` parameter particles with empty latent states, ready for `init`.
pub fn population(filter: &BootstrapFilter, n: usize) -> Result<Population<LatentState, PathBuffer>, SamplerError> {
    Population::from_fn(n, |_| filter.blank())
}
