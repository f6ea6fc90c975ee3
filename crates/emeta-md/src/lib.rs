//! Molecular-dynamics side of the emeta bias engine.
//!
//! This crate connects expression graphs to atomic simulations:
//!
//! - [`atoms`]: configuration snapshots and the graph inputs they feed
//! - [`cv`]: collective variables (positions, cell, fractional
//!   coordinates, distances) as differentiable operators
//! - [`calculator`]: a potential wrapper adding a bias expression
//! - [`integrate`]: velocity Verlet over graph parameters

pub mod atoms;
pub mod calculator;
pub mod cv;
pub mod integrate;

pub use atoms::{AtomicInputs, Atoms};
pub use calculator::{Biased, Potential, Results, Zero};
pub use cv::{Cell, Distance, Positions, ScaledPositions, Selection};
pub use integrate::{verlet, Trajectory};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::atoms::{AtomicInputs, Atoms};
    pub use crate::calculator::{Biased, Potential, Results};
    pub use crate::cv::Selection;
    pub use crate::integrate::{verlet, Trajectory};
}
