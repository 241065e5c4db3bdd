use serde::{Deserialize, Serialize};

#[cfg(feature = "cli")]
use clap::{Args, ValueEnum};

use crate::kernel::ReductionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ResampleScheme {
    Multinomial,
    #[default]
    Systematic,
    Stratified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
#[serde(default)]
pub struct SamplerConfig {
    /// PMMH moves per theta-particle when rejuvenating
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 1))]
    pub nmoves: usize,

    /// Resample when ESS falls below this fraction of the population
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 0.5))]
    pub ess_rel: f64,

    /// Resampling scheme for theta-particles
    #[cfg_attr(feature = "cli", arg(long, value_enum, default_value_t = ResampleScheme::Systematic))]
    pub scheme: ResampleScheme,

    /// Scale applied to the adapted proposal covariance
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 1.0))]
    pub adapter_scale: f64,

    /// Minimum ESS fraction before the adapted proposal is used
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 0.25))]
    pub adapter_ess_rel: f64,

    /// Emit progress lines on the coordinating node
    #[cfg_attr(feature = "cli", arg(long, action = clap::ArgAction::Set, default_value_t = true))]
    pub progress: bool,

    #[cfg_attr(feature = "cli", command(flatten))]
    pub kernel: KernelConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            nmoves: 1,
            ess_rel: 0.5,
            scheme: ResampleScheme::Systematic,
            adapter_scale: 1.0,
            adapter_ess_rel: 0.25,
            progress: true,
            kernel: KernelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
#[serde(default)]
pub struct KernelConfig {
    /// How lanes of the log-density reduction are executed
    #[cfg_attr(feature = "cli", arg(long = "reduction", value_enum, default_value_t = ReductionMode::Serial))]
    pub mode: ReductionMode,
}
