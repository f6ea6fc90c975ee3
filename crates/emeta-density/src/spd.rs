//! Incremental maintainer of a symmetric positive-definite matrix.
//!
//! [`Spd`] owns a gram matrix `K` together with its lower Cholesky factor
//! `L`, the factor's inverse `L⁻¹` and the matrix inverse `K⁻¹`. The
//! factors are computed lazily and cached. The matrix grows one border
//! row/column at a time through [`Spd::append`], which updates every cached
//! factor in closed form from the Schur complement of the new border
//! instead of refactorizing.
//!
//! ## Bordered update
//!
//! Given `K⁻¹`, a new column `a` and diagonal entry `d`:
//! ```text
//! α = K⁻¹ a,   v = d − aᵀα
//!
//! K' = [ K   a ]    L' = [ L       0  ]    L'⁻¹ = [ L⁻¹       0   ]
//!      [ aᵀ  d ]         [ (L⁻¹a)ᵀ √v ]           [ −αᵀ/√v  1/√v ]
//!
//! K'⁻¹ = [ K⁻¹ + ααᵀ/v   −α/v ]
//!        [ −αᵀ/v          1/v ]
//! ```
//! A Schur complement `v` below the acceptance threshold means the new
//! border is numerically redundant; the append is rejected and nothing
//! changes.

use emeta_core::config::SpdConfig;
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{Tensor, Vector};
use emeta_core::validation::{ensure_finite, ensure_square, identity_error, is_symmetric};
use log::{debug, trace};
use nalgebra::linalg::Cholesky;
use std::f64::consts::PI;

/// Symmetric positive-definite matrix with cached factorizations.
#[derive(Debug, Clone)]
pub struct Spd {
    data: Tensor,
    epsilon: f64,
    cholesky: Option<Tensor>,
    cholesky_inverse: Option<Tensor>,
    inverse: Option<Tensor>,
}

impl Default for Spd {
    fn default() -> Self {
        Self::empty(SpdConfig::default())
    }
}

impl Spd {
    /// Creates an empty (0×0) matrix.
    pub fn empty(config: SpdConfig) -> Self {
        Self {
            data: Tensor::zeros(0, 0),
            epsilon: config.epsilon,
            cholesky: Some(Tensor::zeros(0, 0)),
            cholesky_inverse: Some(Tensor::zeros(0, 0)),
            inverse: Some(Tensor::zeros(0, 0)),
        }
    }

    /// Creates an empty matrix with the given acceptance threshold.
    pub fn new(epsilon: f64) -> Result<Self> {
        let config = SpdConfig { epsilon };
        config.validate()?;
        Ok(Self::empty(config))
    }

    /// Wraps an existing matrix, factorizing it eagerly.
    ///
    /// # Errors
    ///
    /// Returns `NotPositiveDefinite` if the matrix is not symmetric or its
    /// Cholesky factorization fails.
    pub fn from_matrix(data: Tensor, epsilon: f64) -> Result<Self> {
        SpdConfig { epsilon }.validate()?;
        ensure_square(&data)?;
        ensure_finite(&data, "matrix")?;
        if !is_symmetric(&data, 1e-10) {
            return Err(EmetaError::not_positive_definite("matrix is not symmetric"));
        }
        let mut spd = Self {
            data,
            epsilon,
            cholesky: None,
            cholesky_inverse: None,
            inverse: None,
        };
        spd.factorize()?;
        Ok(spd)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// Whether the matrix has zero rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The matrix.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    /// Default acceptance threshold of [`Spd::append`].
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn factorize(&mut self) -> Result<()> {
        if self.cholesky.is_some() && self.cholesky_inverse.is_some() {
            return Ok(());
        }
        let n = self.len();
        trace!("factorizing {n}x{n} gram matrix");
        let chol = Cholesky::new(self.data.clone()).ok_or_else(|| {
            EmetaError::not_positive_definite(format!("Cholesky factorization of {n}x{n} matrix failed"))
        })?;
        let l = chol.l();
        let l_inv = l
            .solve_lower_triangular(&Tensor::identity(n, n))
            .ok_or_else(|| EmetaError::singular_matrix("Cholesky factor has a zero diagonal"))?;
        ensure_finite(&l, "Cholesky factor")?;
        ensure_finite(&l_inv, "inverse Cholesky factor")?;
        self.cholesky = Some(l);
        self.cholesky_inverse = Some(l_inv);
        Ok(())
    }

    /// Lower Cholesky factor `L` with `K = LLᵀ`.
    pub fn cholesky(&mut self) -> Result<&Tensor> {
        self.factorize()?;
        self.cholesky
            .as_ref()
            .ok_or_else(|| EmetaError::numerical_corruption("missing Cholesky factor"))
    }

    /// Inverse of the Cholesky factor.
    pub fn cholesky_inverse(&mut self) -> Result<&Tensor> {
        self.factorize()?;
        self.cholesky_inverse
            .as_ref()
            .ok_or_else(|| EmetaError::numerical_corruption("missing inverse Cholesky factor"))
    }

    /// Matrix inverse `K⁻¹ = L⁻ᵀL⁻¹`.
    pub fn inverse(&mut self) -> Result<&Tensor> {
        if self.inverse.is_none() {
            let l_inv = self.cholesky_inverse()?;
            let inverse = l_inv.transpose() * l_inv;
            ensure_finite(&inverse, "inverse")?;
            self.inverse = Some(inverse);
        }
        self.inverse
            .as_ref()
            .ok_or_else(|| EmetaError::numerical_corruption("missing inverse"))
    }

    /// Attempts to border the matrix with `column` and `diagonal`.
    ///
    /// Returns `Ok(false)` without touching anything if the Schur
    /// complement is below `threshold` (the configured epsilon when
    /// `None`), `Ok(true)` once every cached factor has been extended.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `column` does not have one entry per row, and
    /// `NumericalCorruption` if the update produces non-finite values.
    pub fn append(&mut self, column: &Vector, diagonal: f64, threshold: Option<f64>) -> Result<bool> {
        let n = self.len();
        if column.len() != n {
            return Err(EmetaError::dimension_mismatch(
                format!("column of length {n}"),
                format!("length {}", column.len()),
            ));
        }

        self.factorize()?;
        let alpha = self.inverse()? * column;
        let schur = diagonal - column.dot(&alpha);
        if !schur.is_finite() {
            return Err(EmetaError::numerical_corruption(format!(
                "Schur complement is {schur}"
            )));
        }
        let threshold = threshold.unwrap_or(self.epsilon);
        if schur < threshold {
            debug!("rejected border: Schur complement {schur:.3e} < {threshold:.3e}");
            return Ok(false);
        }

        let (Some(l), Some(l_inv), Some(inverse)) =
            (&self.cholesky, &self.cholesky_inverse, &self.inverse)
        else {
            return Err(EmetaError::numerical_corruption("missing cached factors"));
        };
        let beta = schur.sqrt();
        let zeros = Vector::zeros(n);

        let data = bordered(&self.data, column, column, diagonal);
        let cholesky = bordered(l, &zeros, &(l_inv * column), beta);
        let cholesky_inverse = bordered(l_inv, &zeros, &(-&alpha / beta), 1.0 / beta);
        let inverse = bordered(
            &(inverse + &alpha * alpha.transpose() / schur),
            &(-&alpha / schur),
            &(-&alpha / schur),
            1.0 / schur,
        );

        ensure_finite(&cholesky, "Cholesky factor")?;
        ensure_finite(&cholesky_inverse, "inverse Cholesky factor")?;
        ensure_finite(&inverse, "inverse")?;

        self.data = data;
        self.cholesky = Some(cholesky);
        self.cholesky_inverse = Some(cholesky_inverse);
        self.inverse = Some(inverse);
        debug!("accepted border: Schur complement {schur:.3e}, size {}", n + 1);
        Ok(true)
    }

    /// Removes row and column `index`.
    ///
    /// The inverse is downdated in closed form (`K⁻¹ − ααᵀ/β` with `α` the
    /// removed row of `K⁻¹` and `β` its diagonal entry); the Cholesky
    /// factors are recomputed on next use.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        let n = self.len();
        if index >= n {
            return Err(EmetaError::invalid_parameter(format!(
                "cannot remove row {index} of a {n}x{n} matrix"
            )));
        }
        let inverse = self.inverse()?.clone();
        let beta = inverse[(index, index)];
        let alpha = Vector::from_iterator(
            n - 1,
            (0..n).filter(|&k| k != index).map(|k| inverse[(index, k)]),
        );
        let reduced = inverse.remove_row(index).remove_column(index);
        let downdated = reduced - &alpha * alpha.transpose() / beta;
        ensure_finite(&downdated, "inverse")?;

        self.data = self.data.clone().remove_row(index).remove_column(index);
        self.inverse = Some(downdated);
        self.cholesky = None;
        self.cholesky_inverse = None;
        if self.is_empty() {
            self.cholesky = Some(Tensor::zeros(0, 0));
            self.cholesky_inverse = Some(Tensor::zeros(0, 0));
        }
        Ok(())
    }

    /// Gaussian log-density of `y` under zero mean and covariance `K`.
    pub fn log_prob(&mut self, y: &Vector) -> Result<f64> {
        let n = self.len();
        if y.len() != n {
            return Err(EmetaError::dimension_mismatch(
                format!("vector of length {n}"),
                format!("length {}", y.len()),
            ));
        }
        let log_det: f64 = 2.0 * self.cholesky()?.diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let quadratic = y.dot(&(self.inverse()? * y));
        Ok(-0.5 * (quadratic + log_det + n as f64 * (2.0 * PI).ln()))
    }

    /// Maximum absolute deviation of `K K⁻¹` from the identity.
    pub fn identity_error(&mut self) -> Result<f64> {
        let inverse = self.inverse()?.clone();
        Ok(identity_error(&self.data, &inverse))
    }
}

/// `[[m, column], [rowᵀ, corner]]`.
fn bordered(m: &Tensor, column: &Vector, row: &Vector, corner: f64) -> Tensor {
    let n = m.nrows();
    let mut result = m.clone().resize(n + 1, n + 1, 0.0);
    for i in 0..n {
        result[(i, n)] = column[i];
        result[(n, i)] = row[i];
    }
    result[(n, n)] = corner;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian_column(points: &[f64], x: f64) -> Vector {
        Vector::from_iterator(points.len(), points.iter().map(|p| (-(p - x).powi(2) / 2.0).exp()))
    }

    #[test]
    fn test_empty() {
        let mut spd = Spd::default();
        assert!(spd.is_empty());
        assert_eq!(spd.inverse().unwrap().shape(), (0, 0));
        assert_eq!(spd.epsilon(), 1e-3);
    }

    #[test]
    fn test_first_append() {
        let mut spd = Spd::new(0.1).unwrap();
        assert!(spd.append(&Vector::zeros(0), 1.0, None).unwrap());
        assert_eq!(spd.data(), &Tensor::identity(1, 1));
        assert_eq!(spd.cholesky().unwrap(), &Tensor::identity(1, 1));
        assert_eq!(spd.inverse().unwrap(), &Tensor::identity(1, 1));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut spd = Spd::new(1e-3).unwrap();
        let mut points = Vec::new();
        for x in [0.0, 3.0] {
            assert!(spd.append(&gaussian_column(&points, x), 1.0, None).unwrap());
            points.push(x);
        }
        let before = spd.data().clone();
        assert!(!spd.append(&gaussian_column(&points, 3.0), 1.0, None).unwrap());
        assert_eq!(spd.data(), &before);
        assert_eq!(spd.len(), 2);
    }

    #[test]
    fn test_bordered_factors_match_refactorization() {
        let mut spd = Spd::new(1e-6).unwrap();
        let mut points = Vec::new();
        for x in [0.0, 0.7, 1.5, 2.1, 4.0] {
            assert!(spd.append(&gaussian_column(&points, x), 1.0, None).unwrap());
            points.push(x);
        }
        assert!(spd.identity_error().unwrap() < 1e-6);

        let fresh = Cholesky::new(spd.data().clone()).unwrap();
        let l = spd.cholesky().unwrap().clone();
        assert_relative_eq!(l, fresh.l(), epsilon = 1e-9);

        let l_inv = spd.cholesky_inverse().unwrap().clone();
        assert_relative_eq!(&l * &l_inv, Tensor::identity(5, 5), epsilon = 1e-9);
    }

    #[test]
    fn test_threshold_override() {
        let mut spd = Spd::new(1e-3).unwrap();
        spd.append(&Vector::zeros(0), 1.0, None).unwrap();
        let column = Vector::from_element(1, 0.9);
        // v = 1 - 0.81 = 0.19
        assert!(!spd.append(&column, 1.0, Some(0.5)).unwrap());
        assert!(spd.append(&column, 1.0, Some(0.1)).unwrap());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut spd = Spd::default();
        assert!(matches!(
            spd.append(&Vector::zeros(2), 1.0, None),
            Err(EmetaError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_non_finite_is_corruption() {
        let mut spd = Spd::default();
        spd.append(&Vector::zeros(0), 1.0, None).unwrap();
        let err = spd
            .append(&Vector::from_element(1, f64::NAN), 1.0, None)
            .unwrap_err();
        assert!(matches!(err, EmetaError::NumericalCorruption { .. }));
    }

    #[test]
    fn test_from_matrix() {
        let m = Tensor::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let mut spd = Spd::from_matrix(m, 1e-3).unwrap();
        assert!(spd.identity_error().unwrap() < 1e-12);

        let bad = Tensor::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            Spd::from_matrix(bad, 1e-3),
            Err(EmetaError::NotPositiveDefinite { .. })
        ));
        let asym = Tensor::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(Spd::from_matrix(asym, 1e-3).is_err());
    }

    #[test]
    fn test_remove_downdates_inverse() {
        let mut spd = Spd::new(1e-6).unwrap();
        let mut points = Vec::new();
        for x in [0.0, 1.0, 2.5] {
            spd.append(&gaussian_column(&points, x), 1.0, None).unwrap();
            points.push(x);
        }
        spd.remove(1).unwrap();
        assert_eq!(spd.len(), 2);
        assert!(spd.identity_error().unwrap() < 1e-9);
        assert_relative_eq!(spd.data()[(0, 1)], (-2.5_f64 * 2.5 / 2.0).exp(), epsilon = 1e-15);
        // The factor is recomputed lazily and is consistent with the data.
        let l = spd.cholesky().unwrap().clone();
        assert_relative_eq!(&l * l.transpose(), spd.data().clone(), epsilon = 1e-12);

        assert!(spd.remove(5).is_err());
    }

    #[test]
    fn test_log_prob() {
        let m = Tensor::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.5]);
        let mut spd = Spd::from_matrix(m, 1e-3).unwrap();
        let y = Vector::from_vec(vec![1.0, 1.0]);
        // det = 1, yᵀK⁻¹y = 0.5 + 2
        let expected = -0.5 * (2.5 + 2.0 * (2.0 * PI).ln());
        assert_relative_eq!(spd.log_prob(&y).unwrap(), expected, epsilon = 1e-12);
    }
}
