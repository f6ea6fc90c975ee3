//! Type aliases and numerical constants.
//!
//! Every value flowing through an expression graph is a dense `f64`
//! matrix. Scalars are 1×1, a single observation of a d-dimensional
//! collective variable is a 1×d row and a set of n points is n×d.

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// Dense value type used throughout the workspace.
pub type Tensor = DMatrix<f64>;

/// Column vector type.
pub type Vector = DVector<f64>;

/// Numerical constants.
pub mod constants {
    /// Default eigenvalue floor of a bare SPD maintainer.
    pub const DEFAULT_SPD_EPSILON: f64 = 1e-3;

    /// Default rejection threshold of the reduced-set estimator.
    pub const DEFAULT_KDR_EPSILON: f64 = 0.1;

    /// Tolerance used by numerical self-checks.
    pub const IDENTITY_TOLERANCE: f64 = 1e-6;

    /// Relative step for finite differences.
    pub const FINITE_DIFFERENCE_STEP: f64 = 1e-6;
}

/// Wraps a number as a 1×1 tensor.
pub fn scalar(value: f64) -> Tensor {
    Tensor::from_element(1, 1, value)
}

/// Builds a 1×n row from a slice.
pub fn row(values: &[f64]) -> Tensor {
    Tensor::from_row_slice(1, values.len(), values)
}

/// Flattens a tensor in row-major order.
pub fn flatten(tensor: &Tensor) -> Vector {
    let (rows, cols) = tensor.shape();
    Vector::from_iterator(
        rows * cols,
        (0..rows).flat_map(|i| (0..cols).map(move |j| tensor[(i, j)])),
    )
}

/// Stacks vectors as the rows of a matrix.
pub fn stack_rows(rows: &[Vector]) -> Tensor {
    let n = rows.len();
    let d = rows.first().map_or(0, |r| r.len());
    Tensor::from_fn(n, d, |i, j| rows[i][j])
}

/// Human readable shape, used in error messages.
pub fn shape_string(tensor: &Tensor) -> String {
    format!("({}, {})", tensor.nrows(), tensor.ncols())
}

/// Returns the single entry of a 1×1 tensor.
pub fn to_scalar(tensor: &Tensor) -> Option<f64> {
    (tensor.nrows() == 1 && tensor.ncols() == 1).then(|| tensor[(0, 0)])
}

/// Normalization of a d-dimensional Gaussian with covariance determinant
/// `det`: `(2π)^{d/2} √det`.
pub fn gaussian_normalization(dim: usize, det: f64) -> f64 {
    (2.0 * PI).powf(dim as f64 / 2.0) * det.sqrt()
}
