//! Differentiable collective variables and online density estimators for
//! metadynamics.
//!
//! This facade re-exports the workspace crates:
//!
//! - [`core`]: errors, tensor aliases and configuration
//! - [`autodiff`]: lazy expression graphs with reverse-mode gradients
//! - [`density`]: histograms, kernel density estimates and the reduced-set
//!   kernel regression
//! - [`md`]: atomic collective variables, the biased calculator and
//!   velocity Verlet
//!
//! # Example
//!
//! ```
//! use emeta::prelude::*;
//!
//! let graph = Graph::new();
//! let x = graph.param("x", row(&[0.0])).unwrap();
//! let kernel = GaussianKernel::new(&[0.5]).unwrap();
//! let kdr = Kdr::new(kernel, KdrConfig::default()).unwrap();
//! let bias = graph.estimator(x.var(), kdr).unwrap().sum(None);
//!
//! assert_eq!(bias.value().unwrap()[(0, 0)], 0.0);
//! bias.update().unwrap();
//! assert!(bias.value().unwrap()[(0, 0)] > 0.0);
//! ```

pub use emeta_autodiff as autodiff;
pub use emeta_core as core;
pub use emeta_density as density;
pub use emeta_md as md;
pub use nalgebra;

pub use emeta_core::{EmetaError, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use emeta_autodiff::prelude::*;
    pub use emeta_core::prelude::*;
    pub use emeta_density::prelude::*;
    pub use emeta_md::prelude::*;
}
