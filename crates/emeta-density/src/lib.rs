//! Online density estimators for metadynamics biases.
//!
//! Every estimator here implements [`emeta_autodiff::Estimator`]: it sits in
//! an expression graph, observes the value of a collective variable each
//! time the graph is updated, and evaluates an estimate at query points.
//!
//! # Estimators
//!
//! - [`Histogram`]: sparse bin counts, persistable as text
//! - [`Kde`] and [`GridKde`]: Gaussian smoothing of bin counts
//! - [`Density`]: kernel density over every raw sample
//! - [`Kdr`]: reduced-set kernel regression over inducing points
//! - [`History`]: records every observed value
//!
//! [`kl_divergence`] compares two estimates evaluated on the same grid.
//!
//! The reduced-set estimator relies on [`Spd`], a positive-definite matrix
//! whose Cholesky factor, factor inverse and inverse are extended in O(n²)
//! when a row and column are appended.

pub mod density;
pub mod histogram;
pub mod history;
pub mod kdr;
pub mod kernel;
pub mod spd;

pub use density::{kl_divergence, Density, GridKde};
pub use histogram::{BinKey, Histogram, Kde};
pub use history::History;
pub use kdr::Kdr;
pub use kernel::{ArdFit, GaussianArd, GaussianKernel, Kernel};
pub use spd::Spd;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::density::{Density, GridKde};
    pub use crate::histogram::{Histogram, Kde};
    pub use crate::history::History;
    pub use crate::kdr::Kdr;
    pub use crate::kernel::{GaussianArd, GaussianKernel, Kernel};
    pub use crate::spd::Spd;
}
