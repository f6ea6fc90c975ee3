//! Broadcasting support for tensor operations.
//!
//! Values are 2-D, so broadcasting follows the usual rules restricted to
//! rows and columns: two extents are compatible if they are equal or one of
//! them is 1, and the output takes the larger extent.

use crate::graph::Tensor;
use emeta_core::error::{EmetaError, Result};
use nalgebra::DMatrix;

/// Result of a broadcast operation.
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    /// The broadcasted tensors
    pub tensors: [Tensor; 2],
    /// The output shape after broadcasting
    pub output_shape: (usize, usize),
    /// Information needed to reverse the broadcast in backward pass
    pub broadcast_info: [BroadcastInfo; 2],
}

/// Information about how a tensor was broadcasted.
#[derive(Debug, Clone)]
pub struct BroadcastInfo {
    /// Original shape of the tensor
    pub original_shape: (usize, usize),
    /// Axes that were repeated, with the repeat count
    pub repeated_axes: Vec<(usize, usize)>,
}

/// Broadcasts two tensors to a common shape.
pub fn broadcast_binary(a: &Tensor, b: &Tensor) -> Result<BroadcastResult> {
    let output_shape = broadcast_shape(a.shape(), b.shape())?;

    let (broadcast_a, info_a) = broadcast_to(a, output_shape)?;
    let (broadcast_b, info_b) = broadcast_to(b, output_shape)?;

    Ok(BroadcastResult {
        tensors: [broadcast_a, broadcast_b],
        output_shape,
        broadcast_info: [info_a, info_b],
    })
}

/// Computes the output shape for broadcasting two shapes.
pub fn broadcast_shape(
    shape_a: (usize, usize),
    shape_b: (usize, usize),
) -> Result<(usize, usize)> {
    let extent = |a: usize, b: usize| -> Result<usize> {
        if a == b || b == 1 {
            Ok(a)
        } else if a == 1 {
            Ok(b)
        } else {
            Err(EmetaError::dimension_mismatch(
                format!("shape broadcastable with {shape_a:?}"),
                format!("{shape_b:?}"),
            ))
        }
    };

    Ok((extent(shape_a.0, shape_b.0)?, extent(shape_a.1, shape_b.1)?))
}

/// Broadcasts a tensor to a target shape.
fn broadcast_to(tensor: &Tensor, target_shape: (usize, usize)) -> Result<(Tensor, BroadcastInfo)> {
    let original_shape = tensor.shape();
    let (orig_rows, orig_cols) = original_shape;
    let (target_rows, target_cols) = target_shape;

    if original_shape == target_shape {
        return Ok((
            tensor.clone(),
            BroadcastInfo {
                original_shape,
                repeated_axes: vec![],
            },
        ));
    }

    let row_ok = orig_rows == target_rows || orig_rows == 1;
    let col_ok = orig_cols == target_cols || orig_cols == 1;
    if !(row_ok && col_ok) {
        return Err(EmetaError::dimension_mismatch(
            format!("{target_shape:?}"),
            format!("{original_shape:?}"),
        ));
    }

    let mut repeated_axes = Vec::new();
    if orig_rows != target_rows {
        repeated_axes.push((0, target_rows));
    }
    if orig_cols != target_cols {
        repeated_axes.push((1, target_cols));
    }

    let result = DMatrix::from_fn(target_rows, target_cols, |i, j| {
        let si = if orig_rows == 1 { 0 } else { i };
        let sj = if orig_cols == 1 { 0 } else { j };
        tensor[(si, sj)]
    });

    Ok((
        result,
        BroadcastInfo {
            original_shape,
            repeated_axes,
        },
    ))
}

/// Reverses a broadcast operation for the backward pass.
///
/// This sums over the axes that were broadcasted to get gradients
/// in the original shape.
pub fn unbroadcast(grad: &Tensor, info: &BroadcastInfo) -> Tensor {
    let mut result = grad.clone();

    for &(axis, _repeat_count) in info.repeated_axes.iter().rev() {
        result = match axis {
            0 => DMatrix::from_fn(1, result.ncols(), |_, j| result.column(j).sum()),
            _ => DMatrix::from_fn(result.nrows(), 1, |i, _| result.row(i).sum()),
        };
    }

    result
}

/// Reduces a gradient to a target shape, summing over broadcast axes.
pub fn reduce_to_shape(grad: &Tensor, shape: (usize, usize)) -> Tensor {
    let mut repeated_axes = Vec::new();
    if shape.0 == 1 && grad.nrows() != 1 {
        repeated_axes.push((0, grad.nrows()));
    }
    if shape.1 == 1 && grad.ncols() != 1 {
        repeated_axes.push((1, grad.ncols()));
    }
    unbroadcast(
        grad,
        &BroadcastInfo {
            original_shape: shape,
            repeated_axes,
        },
    )
}

/// Applies an elementwise binary function after broadcasting.
pub fn zip_with<F>(a: &Tensor, b: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(f64, f64) -> f64,
{
    if a.shape() == b.shape() {
        return Ok(a.zip_map(b, f));
    }
    let broadcast = broadcast_binary(a, b)?;
    let [x, y] = &broadcast.tensors;
    Ok(x.zip_map(y, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape((2, 3), (2, 3)).unwrap(), (2, 3));
        assert_eq!(broadcast_shape((1, 3), (2, 3)).unwrap(), (2, 3));
        assert_eq!(broadcast_shape((2, 1), (2, 3)).unwrap(), (2, 3));
        assert_eq!(broadcast_shape((1, 1), (2, 3)).unwrap(), (2, 3));

        assert!(broadcast_shape((2, 3), (3, 3)).is_err());
        assert!(broadcast_shape((2, 3), (2, 4)).is_err());
    }

    #[test]
    fn test_broadcast_to() {
        let scalar = DMatrix::from_element(1, 1, 5.0);
        let (broadcasted, info) = broadcast_to(&scalar, (3, 4)).unwrap();
        assert_eq!(broadcasted.shape(), (3, 4));
        assert_eq!(broadcasted[(2, 3)], 5.0);
        assert_eq!(info.repeated_axes.len(), 2);

        let row = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let (broadcasted, info) = broadcast_to(&row, (4, 3)).unwrap();
        assert_eq!(broadcasted.shape(), (4, 3));
        assert_eq!(broadcasted[(3, 2)], 3.0);
        assert_eq!(info.repeated_axes.len(), 1);
    }

    #[test]
    fn test_unbroadcast() {
        let grad = DMatrix::from_element(3, 4, 2.0);
        let info = BroadcastInfo {
            original_shape: (1, 1),
            repeated_axes: vec![(0, 3), (1, 4)],
        };

        let unbroadcasted = unbroadcast(&grad, &info);
        assert_eq!(unbroadcasted.shape(), (1, 1));
        assert_eq!(unbroadcasted[(0, 0)], 24.0);
    }

    #[test]
    fn test_reduce_to_shape() {
        let grad = DMatrix::from_element(2, 3, 1.0);
        assert_eq!(reduce_to_shape(&grad, (1, 3)), DMatrix::from_element(1, 3, 2.0));
        assert_eq!(reduce_to_shape(&grad, (2, 1)), DMatrix::from_element(2, 1, 3.0));
        assert_eq!(reduce_to_shape(&grad, (2, 3)), grad);
    }

    #[test]
    fn test_zip_with_scalar() {
        let scalar = DMatrix::from_element(1, 1, 5.0);
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);

        let result = zip_with(&scalar, &matrix, |a, b| a + b).unwrap();
        assert_eq!(result, DMatrix::from_row_slice(2, 2, &[6.0, 7.0, 8.0, 9.0]));

        let bad = DMatrix::from_element(3, 3, 1.0);
        assert!(zip_with(&matrix, &bad, |a, b| a * b).is_err());
    }
}
