//! Core types and errors for the emeta bias engine.
//!
//! This crate provides the pieces shared by every other crate of the
//! workspace: the dense tensor alias used as the value type of expression
//! graphs, the error taxonomy, configuration structs and a few numerical
//! checks.
//!
//! # Modules
//!
//! - [`error`]: Error type and result alias
//! - [`types`]: Tensor aliases, constants and small helpers
//! - [`config`]: Configuration of SPD maintainers, estimators and integrators
//! - [`validation`]: Finiteness, symmetry and identity checks

pub mod config;
pub mod error;
pub mod types;
pub mod validation;

// Re-export commonly used items at the crate root
pub use error::{EmetaError, Result};
pub use types::{Tensor, Vector};

/// Prelude module for convenient imports.
///
/// # Example
/// ```
/// use emeta_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{
        DensityConfig, KdrConfig, KdrConfigBuilder, Normalization, SpdConfig, VerletConfig,
    };
    pub use crate::error::{EmetaError, Result};
    pub use crate::types::{constants, row, scalar, to_scalar, Tensor, Vector};
}
