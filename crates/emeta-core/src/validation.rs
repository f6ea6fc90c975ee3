//! Numerical validation helpers.
//!
//! Small checks shared by the SPD maintainer and the estimators: finiteness,
//! symmetry and how far a product is from the identity.

use crate::error::{EmetaError, Result};
use crate::types::{shape_string, Tensor};
use approx::relative_eq;

/// Fails with `NumericalCorruption` if any entry is NaN or infinite.
pub fn ensure_finite(tensor: &Tensor, what: &str) -> Result<()> {
    if tensor.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(EmetaError::numerical_corruption(format!(
            "{what} {} contains non-finite entries",
            shape_string(tensor)
        )))
    }
}

/// Fails with `DimensionMismatch` unless the tensor is square.
pub fn ensure_square(tensor: &Tensor) -> Result<()> {
    if tensor.is_square() {
        Ok(())
    } else {
        Err(EmetaError::dimension_mismatch(
            "square matrix",
            shape_string(tensor),
        ))
    }
}

/// Whether a square matrix is symmetric up to a relative tolerance.
pub fn is_symmetric(matrix: &Tensor, tolerance: f64) -> bool {
    if !matrix.is_square() {
        return false;
    }
    let n = matrix.nrows();
    (0..n).all(|i| {
        (i + 1..n).all(|j| {
            relative_eq!(
                matrix[(i, j)],
                matrix[(j, i)],
                epsilon = tolerance,
                max_relative = tolerance
            )
        })
    })
}

/// Maximum absolute deviation of `a * b` from the identity.
pub fn identity_error(a: &Tensor, b: &Tensor) -> f64 {
    let product = a * b;
    let n = product.nrows();
    let mut max_error: f64 = 0.0;
    for i in 0..n {
        for j in 0..product.ncols() {
            let target = if i == j { 1.0 } else { 0.0 };
            max_error = max_error.max((product[(i, j)] - target).abs());
        }
    }
    max_error
}
