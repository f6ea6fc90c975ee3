//! Configuration for SPD maintainers, estimators and the integrator.
//!
//! Each configuration is a plain struct with sensible defaults and a
//! builder for overriding individual fields.

use crate::error::{EmetaError, Result};
use crate::types::constants;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How a kernel estimate is scaled before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Normalization {
    /// Divide by the kernel's analytic normalization only. The estimate
    /// grows with the number of observations, which is what a bias wants.
    #[default]
    Kernel,
    /// Divide by the kernel normalization and the total weight: a proper
    /// probability density.
    Probability,
    /// Kernel estimate multiplied by the kernel bin volume, comparable to
    /// histogram counts.
    Histogram,
}

impl Normalization {
    /// Divisor applied to a raw kernel sum.
    ///
    /// `kernel_normalization` is the kernel's analytic normalization,
    /// `dvol` its bin volume and `total_weight` the number (or summed
    /// weight) of observations.
    pub fn divisor(self, kernel_normalization: f64, dvol: f64, total_weight: f64) -> f64 {
        match self {
            Self::Kernel => kernel_normalization,
            Self::Probability => kernel_normalization * total_weight,
            Self::Histogram => kernel_normalization / dvol,
        }
    }
}

/// Configuration of an SPD maintainer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpdConfig {
    /// Smallest Schur complement accepted by `append`.
    pub epsilon: f64,
}

impl Default for SpdConfig {
    fn default() -> Self {
        Self {
            epsilon: constants::DEFAULT_SPD_EPSILON,
        }
    }
}

impl SpdConfig {
    /// Checks that the threshold is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(EmetaError::invalid_parameter(format!(
                "SPD epsilon must be positive and finite, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Configuration of a sample-based density estimator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DensityConfig {
    /// Output scaling.
    pub normalization: Normalization,
    /// Ignore `update` calls.
    pub fixed: bool,
}

/// Configuration of the reduced-set kernel density regression.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KdrConfig {
    /// Smallest Schur complement for a sample to become an inducing point.
    pub epsilon: f64,
    /// Output scaling.
    pub normalization: Normalization,
    /// Ignore `update` calls.
    pub fixed: bool,
}

impl Default for KdrConfig {
    fn default() -> Self {
        Self {
            epsilon: constants::DEFAULT_KDR_EPSILON,
            normalization: Normalization::Kernel,
            fixed: false,
        }
    }
}

impl KdrConfig {
    /// Checks that the threshold is usable.
    pub fn validate(&self) -> Result<()> {
        SpdConfig {
            epsilon: self.epsilon,
        }
        .validate()
    }

    /// The SPD configuration implied by this estimator configuration.
    pub fn spd(&self) -> SpdConfig {
        SpdConfig {
            epsilon: self.epsilon,
        }
    }
}

/// Builder for creating a custom KDR configuration.
pub struct KdrConfigBuilder {
    config: KdrConfig,
}

impl KdrConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: KdrConfig::default(),
        }
    }

    /// Set the inducing-point rejection threshold.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    /// Set the output scaling.
    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.config.normalization = normalization;
        self
    }

    /// Freeze the estimator.
    pub fn fixed(mut self, fixed: bool) -> Self {
        self.config.fixed = fixed;
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<KdrConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for KdrConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the velocity-Verlet driver.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VerletConfig {
    /// Time step.
    pub dt: f64,
    /// Number of steps.
    pub steps: usize,
}

impl Default for VerletConfig {
    fn default() -> Self {
        Self { dt: 0.01, steps: 100 }
    }
}

impl VerletConfig {
    /// Checks that the time step is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(EmetaError::invalid_parameter(format!(
                "time step must be positive and finite, got {}",
                self.dt
            )));
        }
        Ok(())
    }
}
