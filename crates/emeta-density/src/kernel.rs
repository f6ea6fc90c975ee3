//! Gaussian kernels.
//!
//! A kernel maps two sets of points `x` (n×d) and `y` (m×d) to the n×m
//! matrix of similarities `exp(−½ rᵀ P r)` with `r = xᵢ − yⱼ` and `P` the
//! kernel's precision matrix. Every kernel also exposes its analytic
//! normalization `(2π)^{d/2} √det Σ`, its bin volume and a hook to fit its
//! hyperparameters to data.

use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{gaussian_normalization, shape_string, Tensor, Vector};
use log::debug;
use nalgebra::linalg::Cholesky;
use std::fmt::Debug;

/// Trait for kernels used by density estimators.
pub trait Kernel: Debug + Clone + 'static {
    /// Dimension of the points.
    fn dim(&self) -> usize;

    /// Covariance `Σ` of the kernel.
    fn covariance(&self) -> Tensor;

    /// Precision `P = Σ⁻¹`.
    fn precision(&self) -> Tensor;

    /// Bandwidth per dimension, `√diag Σ`.
    fn scale(&self) -> Vector {
        self.covariance().diagonal().map(f64::sqrt)
    }

    /// Volume of one bin of the grid spanned by [`Kernel::scale`].
    fn dvol(&self) -> f64 {
        self.scale().product()
    }

    /// Analytic normalization `(2π)^{d/2} √det Σ`.
    fn normalization(&self) -> f64 {
        gaussian_normalization(self.dim(), self.covariance().determinant())
    }

    /// Similarity matrix between the rows of `x` and the rows of `y`.
    fn eval(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.check_dims(x, y)?;
        let p = self.precision();
        Ok(Tensor::from_fn(x.nrows(), y.nrows(), |i, j| {
            let r = (x.row(i) - y.row(j)).transpose();
            (-0.5 * r.dot(&(&p * &r))).exp()
        }))
    }

    /// Vector-Jacobian product of [`Kernel::eval`] with respect to `x`.
    ///
    /// `grad_output` is n×m; the result is shaped like `x`.
    fn vjp_x(&self, x: &Tensor, y: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        let k = self.eval(x, y)?;
        if grad_output.shape() != k.shape() {
            return Err(EmetaError::dimension_mismatch(shape_string(&k), shape_string(grad_output)));
        }
        let p = self.precision();
        let mut grad = Tensor::zeros(x.nrows(), x.ncols());
        for i in 0..x.nrows() {
            for j in 0..y.nrows() {
                let weight = grad_output[(i, j)] * k[(i, j)];
                if weight == 0.0 {
                    continue;
                }
                let r = (x.row(i) - y.row(j)).transpose();
                let pr = &p * r;
                for c in 0..x.ncols() {
                    grad[(i, c)] -= weight * pr[c];
                }
            }
        }
        Ok(grad)
    }

    /// Fits the hyperparameters to targets `y` observed at points `x`.
    ///
    /// Returns the refitted gram matrix `k(x, x)`, or `None` when the
    /// kernel has nothing to fit.
    fn optimize(&mut self, x: &Tensor, y: &Tensor) -> Result<Option<Tensor>>;

    /// Fails unless both point sets have this kernel's dimension.
    fn check_dims(&self, x: &Tensor, y: &Tensor) -> Result<()> {
        let d = self.dim();
        for t in [x, y] {
            if t.ncols() != d {
                return Err(EmetaError::dimension_mismatch(
                    format!("(_, {d})"),
                    shape_string(t),
                ));
            }
        }
        Ok(())
    }
}

/// Isotropic-per-axis Gaussian kernel with fixed bandwidths.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    scale: Vector,
}

impl GaussianKernel {
    /// Creates a kernel with one bandwidth per dimension.
    pub fn new(scale: &[f64]) -> Result<Self> {
        if scale.is_empty() || scale.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(EmetaError::invalid_parameter(format!(
                "kernel bandwidths must be positive and finite, got {scale:?}"
            )));
        }
        Ok(Self {
            scale: Vector::from_column_slice(scale),
        })
    }
}

impl Kernel for GaussianKernel {
    fn dim(&self) -> usize {
        self.scale.len()
    }

    fn covariance(&self) -> Tensor {
        Tensor::from_diagonal(&self.scale.map(|s| s * s))
    }

    fn precision(&self) -> Tensor {
        Tensor::from_diagonal(&self.scale.map(|s| 1.0 / (s * s)))
    }

    fn scale(&self) -> Vector {
        self.scale.clone()
    }

    fn eval(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.check_dims(x, y)?;
        Ok(Tensor::from_fn(x.nrows(), y.nrows(), |i, j| {
            let d2: f64 = (0..self.dim())
                .map(|c| ((x[(i, c)] - y[(j, c)]) / self.scale[c]).powi(2))
                .sum();
            (-0.5 * d2).exp()
        }))
    }

    fn optimize(&mut self, _x: &Tensor, _y: &Tensor) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

/// Settings of [`GaussianArd::optimize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArdFit {
    /// Maximum number of descent steps.
    pub steps: usize,
    /// Initial step length.
    pub learning_rate: f64,
    /// Jitter added to the gram diagonal.
    pub noise: f64,
    /// Finite-difference step.
    pub step: f64,
}

impl Default for ArdFit {
    fn default() -> Self {
        Self {
            steps: 100,
            learning_rate: 0.1,
            noise: 1e-6,
            step: 1e-6,
        }
    }
}

/// Gaussian kernel with a full covariance.
///
/// The covariance is `Σ = LLᵀ` with `L` lower triangular; the free
/// parameters are the strictly lower entries of `L` and the logarithms of
/// its diagonal, so any parameter vector gives a valid covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianArd {
    raw: Tensor,
    fit: ArdFit,
}

impl GaussianArd {
    /// Unit covariance in `dim` dimensions.
    pub fn new(dim: usize) -> Self {
        Self {
            raw: Tensor::zeros(dim, dim),
            fit: ArdFit::default(),
        }
    }

    /// Kernel with the given covariance.
    pub fn with_covariance(covariance: Tensor) -> Result<Self> {
        let dim = covariance.nrows();
        let chol = Cholesky::new(covariance)
            .ok_or_else(|| EmetaError::not_positive_definite("kernel covariance"))?;
        let l = chol.l();
        let raw = Tensor::from_fn(dim, dim, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Greater => l[(i, j)],
            std::cmp::Ordering::Equal => l[(i, i)].ln(),
            std::cmp::Ordering::Less => 0.0,
        });
        Ok(Self {
            raw,
            fit: ArdFit::default(),
        })
    }

    /// Replaces the fit settings.
    pub fn with_fit(mut self, fit: ArdFit) -> Self {
        self.fit = fit;
        self
    }

    /// Lower-triangular factor of the covariance.
    pub fn factor(&self) -> Tensor {
        let d = self.raw.nrows();
        Tensor::from_fn(d, d, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Greater => self.raw[(i, j)],
            std::cmp::Ordering::Equal => self.raw[(i, i)].exp(),
            std::cmp::Ordering::Less => 0.0,
        })
    }

    fn free_parameters(&self) -> Vec<(usize, usize)> {
        let d = self.raw.nrows();
        (0..d).flat_map(|i| (0..=i).map(move |j| (i, j))).collect()
    }

    /// `yᵀK⁻¹y + log det K` with `K = k(x, x) + noise·I`; infinite when
    /// `K` is not positive definite.
    fn loss(&self, x: &Tensor, y: &Tensor) -> Result<f64> {
        let n = x.nrows();
        let gram = self.eval(x, x)? + Tensor::identity(n, n) * self.fit.noise;
        let Some(chol) = Cholesky::new(gram) else {
            return Ok(f64::INFINITY);
        };
        let mu = chol.solve(y);
        let fit = y.dot(&mu);
        let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Ok(fit + log_det)
    }
}

impl Kernel for GaussianArd {
    fn dim(&self) -> usize {
        self.raw.nrows()
    }

    fn covariance(&self) -> Tensor {
        let l = self.factor();
        &l * l.transpose()
    }

    fn precision(&self) -> Tensor {
        let l = self.factor();
        let d = l.nrows();
        let l_inv = l
            .solve_lower_triangular(&Tensor::identity(d, d))
            .unwrap_or_else(|| Tensor::identity(d, d));
        l_inv.transpose() * l_inv
    }

    /// Minimises `yᵀK⁻¹y + log det K` by gradient descent on the factor
    /// parameters, with finite-difference gradients and a backtracking
    /// line search.
    fn optimize(&mut self, x: &Tensor, y: &Tensor) -> Result<Option<Tensor>> {
        if x.nrows() != y.nrows() {
            return Err(EmetaError::dimension_mismatch(
                format!("({}, _)", x.nrows()),
                shape_string(y),
            ));
        }
        self.check_dims(x, x)?;
        let parameters = self.free_parameters();
        let mut loss = self.loss(x, y)?;
        if !loss.is_finite() {
            return Err(EmetaError::not_positive_definite(
                "gram matrix at the initial kernel parameters",
            ));
        }

        let mut rate = self.fit.learning_rate;
        for step in 0..self.fit.steps {
            let mut gradient = Vec::with_capacity(parameters.len());
            for &(i, j) in &parameters {
                let mut probe = self.clone();
                probe.raw[(i, j)] += self.fit.step;
                let plus = probe.loss(x, y)?;
                probe.raw[(i, j)] -= 2.0 * self.fit.step;
                let minus = probe.loss(x, y)?;
                gradient.push((plus - minus) / (2.0 * self.fit.step));
            }
            let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
            if !norm.is_finite() || norm < 1e-10 {
                break;
            }

            // Backtracking: halve the step until the loss decreases.
            let mut improved = false;
            while rate > 1e-12 {
                let mut candidate = self.clone();
                for (&(i, j), g) in parameters.iter().zip(&gradient) {
                    candidate.raw[(i, j)] -= rate * g / norm;
                }
                let candidate_loss = candidate.loss(x, y)?;
                if candidate_loss < loss {
                    *self = candidate;
                    loss = candidate_loss;
                    improved = true;
                    rate *= 1.5;
                    break;
                }
                rate *= 0.5;
            }
            if !improved {
                debug!("kernel fit converged after {step} steps, loss {loss:.6e}");
                break;
            }
        }
        Ok(Some(self.eval(x, x)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use emeta_core::types::row;
    use std::f64::consts::PI;

    #[test]
    fn test_gaussian_eval() {
        let kernel = GaussianKernel::new(&[0.5]).unwrap();
        let x = Tensor::from_row_slice(2, 1, &[0.0, 1.0]);
        let y = Tensor::from_row_slice(3, 1, &[0.0, 0.5, 2.0]);
        let k = kernel.eval(&x, &y).unwrap();
        assert_eq!(k.shape(), (2, 3));
        assert_relative_eq!(k[(0, 0)], 1.0);
        assert_relative_eq!(k[(0, 1)], (-0.5_f64).exp(), epsilon = 1e-15);
        assert_relative_eq!(k[(1, 2)], (-2.0_f64).exp(), epsilon = 1e-15);
    }

    #[test]
    fn test_normalization_convention() {
        let kernel = GaussianKernel::new(&[0.5]).unwrap();
        assert_relative_eq!(kernel.normalization(), (2.0 * PI).sqrt() * 0.5, epsilon = 1e-12);
        assert_relative_eq!(kernel.dvol(), 0.5);

        let kernel = GaussianKernel::new(&[1.0, 2.0]).unwrap();
        assert_relative_eq!(kernel.normalization(), 2.0 * PI * 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_default_eval_matches_specialized() {
        let kernel = GaussianKernel::new(&[0.7, 1.3]).unwrap();
        let ard = GaussianArd::with_covariance(kernel.covariance()).unwrap();
        let x = Tensor::from_row_slice(2, 2, &[0.1, 0.2, -1.0, 0.5]);
        let y = Tensor::from_row_slice(2, 2, &[0.0, 0.0, 0.3, -0.4]);
        assert_relative_eq!(kernel.eval(&x, &y).unwrap(), ard.eval(&x, &y).unwrap(), epsilon = 1e-12);
        assert_relative_eq!(kernel.normalization(), ard.normalization(), epsilon = 1e-12);
    }

    #[test]
    fn test_vjp_matches_finite_differences() {
        let kernel = GaussianArd::with_covariance(Tensor::from_row_slice(
            2,
            2,
            &[1.0, 0.3, 0.3, 0.5],
        ))
        .unwrap();
        let x = row(&[0.2, -0.1]);
        let y = Tensor::from_row_slice(2, 2, &[0.0, 0.0, 0.5, 0.5]);
        let g = row(&[1.0, 2.0]);

        let analytical = kernel.vjp_x(&x, &y, &g).unwrap();
        let h = 1e-6;
        for c in 0..2 {
            let mut plus = x.clone();
            plus[(0, c)] += h;
            let mut minus = x.clone();
            minus[(0, c)] -= h;
            let fp = kernel.eval(&plus, &y).unwrap().component_mul(&g).sum();
            let fm = kernel.eval(&minus, &y).unwrap().component_mul(&g).sum();
            assert_relative_eq!(analytical[(0, c)], (fp - fm) / (2.0 * h), epsilon = 1e-7);
        }
    }

    #[test]
    fn test_dimension_checks() {
        let kernel = GaussianKernel::new(&[1.0]).unwrap();
        assert!(kernel.eval(&row(&[0.0, 1.0]), &row(&[0.0])).is_err());
        assert!(GaussianKernel::new(&[]).is_err());
        assert!(GaussianKernel::new(&[-1.0]).is_err());
    }

    #[test]
    fn test_gaussian_optimize_is_noop() {
        let mut kernel = GaussianKernel::new(&[1.0]).unwrap();
        let x = Tensor::from_row_slice(2, 1, &[0.0, 1.0]);
        assert!(kernel.optimize(&x, &x).unwrap().is_none());
    }

    #[test]
    fn test_ard_optimize_decreases_loss() {
        let x = Tensor::from_row_slice(6, 1, &[0.0, 0.4, 0.8, 1.2, 1.6, 2.0]);
        let y = x.map(|v| (2.0 * v).sin());
        let mut kernel = GaussianArd::new(1).with_fit(ArdFit {
            steps: 30,
            noise: 1e-3,
            ..ArdFit::default()
        });

        let before = kernel.loss(&x, &y).unwrap();
        let gram = kernel.optimize(&x, &y).unwrap().unwrap();
        let after = kernel.loss(&x, &y).unwrap();

        assert!(after <= before);
        assert_eq!(gram.shape(), (6, 6));
        assert_relative_eq!(gram[(0, 0)], 1.0);
    }
}
