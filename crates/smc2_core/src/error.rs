//! Error types for the sampler and its filter collaborators.

use thiserror::Error;

/// Failures reported by a [`crate::filter::Filter`] implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    /// A covariance matrix could not be factorised.
    #[error("Cholesky factorisation failed: {0}")]
    Cholesky(String),
    /// Every latent particle carries zero weight.
    #[error("particle filter degenerated at time {time}")]
    Degenerate { time: f64 },
    /// The filter was driven past the end of its schedule.
    #[error("schedule error: {0}")]
    Schedule(String),
    /// Malformed input handed to the filter (observations, initial values).
    #[error("invalid filter input: {0}")]
    InvalidInput(String),
}

impl FilterError {
    /// Numerical failures are survivable: the affected particle is rejected
    /// (rejuvenation) or killed (main step) instead of aborting the run.
    pub fn is_numerical(&self) -> bool {
        matches!(self, FilterError::Cholesky(_) | FilterError::Degenerate { .. })
    }
}

/// Errors surfaced by [`crate::sampler::MarginalSir`].
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("initialisation of particle {particle} failed: {source}")]
    Init {
        particle: usize,
        #[source]
        source: FilterError,
    },
    #[error("filter failure on particle {particle}: {source}")]
    Filter {
        particle: usize,
        #[source]
        source: FilterError,
    },
    #[error("operation `{operation}` is not valid in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: crate::sampler::Phase,
    },
    #[error("schedule exhausted: {0}")]
    Schedule(String),
    #[error("population is empty")]
    EmptyPopulation,
    #[error("output sink failed: {0}")]
    Output(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a likelihood estimate for a proposed particle.
///
/// Numerical failures become [`LikelihoodEstimate::Invalid`] rather than
/// unwinding, so the accept/reject rule is a pure function of two estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LikelihoodEstimate {
    Valid(f64),
    Invalid,
}

impl LikelihoodEstimate {
    /// Collapse non-finite values into `Invalid`.
    pub fn from_log_likelihood(ll: f64) -> Self {
        if ll.is_finite() {
            LikelihoodEstimate::Valid(ll)
        } else {
            LikelihoodEstimate::Invalid
        }
    }

    /// Log-likelihood with the negative-infinity sentinel for `Invalid`.
    pub fn log_likelihood(&self) -> f64 {
        match self {
            LikelihoodEstimate::Valid(ll) => *ll,
            LikelihoodEstimate::Invalid => f64::NEG_INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numerical_classification() {
        assert!(FilterError::Cholesky("not positive definite".into()).is_numerical());
        assert!(FilterError::Degenerate { time: 1.0 }.is_numerical());
        assert!(!FilterError::Schedule("past end".into()).is_numerical());
        assert!(!FilterError::InvalidInput("no data".into()).is_numerical());
    }

    #[test]
    fn test_estimate_collapses_non_finite() {
        assert_eq!(
            LikelihoodEstimate::from_log_likelihood(f64::NAN),
            LikelihoodEstimate::Invalid
        );
        assert_eq!(
            LikelihoodEstimate::from_log_likelihood(f64::NEG_INFINITY),
            LikelihoodEstimate::Invalid
        );
        let valid = LikelihoodEstimate::from_log_likelihood(-3.5);
        assert_eq!(valid, LikelihoodEstimate::Valid(-3.5));
        assert_eq!(valid.log_likelihood(), -3.5);
        assert_eq!(LikelihoodEstimate::Invalid.log_likelihood(), f64::NEG_INFINITY);
    }
}
