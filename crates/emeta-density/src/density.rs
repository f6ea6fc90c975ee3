//! Sample-based kernel density estimates.
//!
//! Both estimators here compute a weighted kernel sum
//! `Σ_j w_j k(x, X_j)` over a set of centers and scale it according to
//! [`Normalization`]. [`Density`] keeps every observation as its own
//! center; [`GridKde`] bins observations first and uses bin centers with
//! their counts as weights.

use crate::histogram::Histogram;
use crate::kernel::Kernel;
use emeta_autodiff::Estimator;
use emeta_core::config::DensityConfig;
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, Tensor};
use std::any::Any;

/// `Σ_j w_j k(x_i, c_j) / divisor` for every query row (n×1).
pub(crate) fn weighted_sum<K: Kernel>(
    kernel: &K,
    x: &Tensor,
    centers: &Tensor,
    weights: &Tensor,
    divisor: f64,
) -> Result<Tensor> {
    if centers.nrows() == 0 {
        return Ok(Tensor::zeros(x.nrows(), 1));
    }
    Ok(kernel.eval(x, centers)? * weights / divisor)
}

/// Vector-Jacobian product of [`weighted_sum`] with respect to `x`.
pub(crate) fn weighted_sum_vjp<K: Kernel>(
    kernel: &K,
    x: &Tensor,
    centers: &Tensor,
    weights: &Tensor,
    divisor: f64,
    grad_output: &Tensor,
) -> Result<Tensor> {
    if centers.nrows() == 0 {
        return Ok(Tensor::zeros(x.nrows(), x.ncols()));
    }
    if grad_output.shape() != (x.nrows(), 1) {
        return Err(EmetaError::dimension_mismatch(
            format!("({}, 1)", x.nrows()),
            shape_string(grad_output),
        ));
    }
    // G_ij = g_i w_j / divisor
    let outer = grad_output * weights.transpose() / divisor;
    kernel.vjp_x(x, centers, &outer)
}

/// Pointwise Kullback-Leibler integrand `p·ln(p/q)`.
///
/// Entries where `q` is not above machine epsilon, or where `p` is zero,
/// contribute zero. Summing the result over a grid and multiplying by the
/// cell volume compares two density estimates evaluated on that grid.
pub fn kl_divergence(p: &Tensor, q: &Tensor) -> Result<Tensor> {
    if p.shape() != q.shape() {
        return Err(EmetaError::dimension_mismatch(shape_string(p), shape_string(q)));
    }
    Ok(p.zip_map(q, |pv, qv| {
        if qv > f64::EPSILON && pv != 0.0 {
            pv * (pv / qv).ln()
        } else {
            0.0
        }
    }))
}

/// Kernel density estimate over raw samples.
#[derive(Debug, Clone)]
pub struct Density<K: Kernel> {
    kernel: K,
    config: DensityConfig,
    samples: Tensor,
    weights: Tensor,
}

impl<K: Kernel> Density<K> {
    /// Creates an empty estimate.
    pub fn new(kernel: K, config: DensityConfig) -> Self {
        let dim = kernel.dim();
        Self {
            kernel,
            config,
            samples: Tensor::zeros(0, dim),
            weights: Tensor::zeros(0, 1),
        }
    }

    /// Stored samples (n×d).
    pub fn samples(&self) -> &Tensor {
        &self.samples
    }

    /// Per-sample weights (n×1).
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    /// Whether no sample was observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kernel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Adds one sample per row of `x` with the given weight.
    pub fn observe(&mut self, x: &Tensor, weight: f64) -> Result<()> {
        if x.ncols() != self.kernel.dim() {
            return Err(EmetaError::dimension_mismatch(
                format!("(_, {})", self.kernel.dim()),
                shape_string(x),
            ));
        }
        let n = self.len();
        let m = x.nrows();
        let mut samples = self.samples.clone().resize_vertically(n + m, 0.0);
        samples.rows_mut(n, m).copy_from(x);
        self.samples = samples;
        self.weights = self.weights.clone().resize_vertically(n + m, weight);
        Ok(())
    }

    fn divisor(&self) -> f64 {
        self.config.normalization.divisor(
            self.kernel.normalization(),
            self.kernel.dvol(),
            self.weights.sum(),
        )
    }
}

impl<K: Kernel> Estimator for Density<K> {
    fn name(&self) -> &str {
        "Density"
    }

    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        weighted_sum(&self.kernel, x, &self.samples, &self.weights, self.divisor())
    }

    fn vjp(&self, x: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        weighted_sum_vjp(
            &self.kernel,
            x,
            &self.samples,
            &self.weights,
            self.divisor(),
            grad_output,
        )
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        if self.config.fixed {
            return Ok(());
        }
        self.observe(x, 1.0)
    }

    fn is_fixed(&self) -> bool {
        self.config.fixed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Kernel density estimate over binned samples.
///
/// The bin width equals the kernel bandwidth, so memory grows with the
/// explored volume instead of the number of observations.
#[derive(Debug, Clone)]
pub struct GridKde<K: Kernel> {
    histogram: Histogram,
    kernel: K,
    config: DensityConfig,
}

impl<K: Kernel> GridKde<K> {
    /// Creates an empty estimate binned at the kernel scale.
    pub fn new(kernel: K, config: DensityConfig) -> Result<Self> {
        let scale = kernel.scale();
        let mut histogram = Histogram::new(scale.as_slice())?;
        histogram.set_fixed(config.fixed);
        Ok(Self {
            histogram,
            kernel,
            config,
        })
    }

    /// The underlying counts.
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// The underlying counts, mutably.
    pub fn histogram_mut(&mut self) -> &mut Histogram {
        &mut self.histogram
    }

    /// The kernel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Bin centers (k×d) and counts (k×1).
    pub fn centers(&self) -> (Tensor, Tensor) {
        let (mut corners, counts) = self.histogram.full(false);
        let scale = self.kernel.scale();
        for mut row in corners.row_iter_mut() {
            for (c, value) in row.iter_mut().enumerate() {
                *value += 0.5 * scale[c];
            }
        }
        (corners, counts)
    }

    fn divisor(&self) -> f64 {
        self.config.normalization.divisor(
            self.kernel.normalization(),
            self.kernel.dvol(),
            self.histogram.total(),
        )
    }
}

impl<K: Kernel> Estimator for GridKde<K> {
    fn name(&self) -> &str {
        "GridKde"
    }

    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        let (centers, counts) = self.centers();
        weighted_sum(&self.kernel, x, &centers, &counts, self.divisor())
    }

    fn vjp(&self, x: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        let (centers, counts) = self.centers();
        weighted_sum_vjp(&self.kernel, x, &centers, &counts, self.divisor(), grad_output)
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        if self.config.fixed {
            return Ok(());
        }
        self.histogram.observe(x)
    }

    fn is_fixed(&self) -> bool {
        self.config.fixed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
