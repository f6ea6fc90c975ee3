//! Reduced-set kernel density regression.
//!
//! [`Kdr`] summarizes an unbounded stream of observations with a small set
//! of inducing points `X`. Each observation either becomes a new inducing
//! point, when its kernel column is sufficiently independent of the current
//! set (Schur complement above `epsilon`), or is absorbed into the
//! per-point statistics `y`. The estimate is the kernel regression
//!
//! ```text
//! f(x) = k(x, X) μ / divisor,    μ = K⁻¹ y
//! ```
//!
//! where `K = k(X, X)` is maintained incrementally by [`Spd`], so an
//! observation costs O(m²) in the number of inducing points.

use crate::density::{weighted_sum, weighted_sum_vjp};
use crate::kernel::Kernel;
use crate::spd::Spd;
use emeta_autodiff::Estimator;
use emeta_core::config::KdrConfig;
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, Tensor, Vector};
use log::debug;
use std::any::Any;

/// Reduced-set kernel density regression estimator.
#[derive(Debug, Clone)]
pub struct Kdr<K: Kernel> {
    kernel: K,
    dirac: Option<K>,
    config: KdrConfig,
    spd: Spd,
    points: Tensor,
    statistics: Vector,
    coefficients: Vector,
    observations: usize,
}

impl<K: Kernel> Kdr<K> {
    /// Creates an empty estimator.
    pub fn new(kernel: K, config: KdrConfig) -> Result<Self> {
        config.validate()?;
        let dim = kernel.dim();
        Ok(Self {
            kernel,
            dirac: None,
            config,
            spd: Spd::empty(config.spd()),
            points: Tensor::zeros(0, dim),
            statistics: Vector::zeros(0),
            coefficients: Vector::zeros(0),
            observations: 0,
        })
    }

    /// Uses a separate kernel for the statistics correction.
    ///
    /// Inducing-point selection still uses the main kernel; the
    /// contribution of each observation to `y` is measured with `dirac`
    /// instead. A narrow `dirac` makes the statistics closer to raw counts.
    pub fn with_dirac(mut self, dirac: K) -> Result<Self> {
        if dirac.dim() != self.kernel.dim() {
            return Err(EmetaError::dimension_mismatch(
                format!("dirac kernel of dimension {}", self.kernel.dim()),
                dirac.dim(),
            ));
        }
        self.dirac = Some(dirac);
        Ok(self)
    }

    /// The kernel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Inducing points (m×d).
    pub fn points(&self) -> &Tensor {
        &self.points
    }

    /// Per-point statistics `y`.
    pub fn statistics(&self) -> &Vector {
        &self.statistics
    }

    /// Regression coefficients `μ = K⁻¹y`.
    pub fn coefficients(&self) -> &Vector {
        &self.coefficients
    }

    /// Gram matrix of the inducing points.
    pub fn gram(&self) -> &Spd {
        &self.spd
    }

    /// Number of inducing points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// Whether nothing was observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of observations absorbed so far.
    pub fn observations(&self) -> usize {
        self.observations
    }

    fn correction(&self, x: &Tensor) -> Result<Vector> {
        let kernel = self.dirac.as_ref().unwrap_or(&self.kernel);
        Ok(kernel.eval(x, &self.points)?.row(0).transpose())
    }

    /// Absorbs a single observation (1×d).
    ///
    /// Returns whether it became an inducing point.
    pub fn observe(&mut self, x: &Tensor) -> Result<bool> {
        if x.shape() != (1, self.kernel.dim()) {
            return Err(EmetaError::dimension_mismatch(
                format!("(1, {})", self.kernel.dim()),
                shape_string(x),
            ));
        }
        self.observations += 1;

        if self.is_empty() {
            self.spd = Spd::from_matrix(self.kernel.eval(x, x)?, self.config.epsilon)?;
            self.points = x.clone();
            self.statistics = Vector::from_element(1, 1.0);
            self.coefficients = self.spd.inverse()? * &self.statistics;
            debug!("first inducing point at {:?}", x.as_slice());
            return Ok(true);
        }

        let column = self.kernel.eval(x, &self.points)?.row(0).transpose();
        let diagonal = self.kernel.eval(x, x)?[(0, 0)];
        let correction = self.correction(x)?;

        if self.spd.append(&column, diagonal, None)? {
            let m = self.len();
            let mut points = self.points.clone().resize_vertically(m + 1, 0.0);
            points.row_mut(m).copy_from(x);
            self.points = points;

            let own = match &self.dirac {
                Some(dirac) => dirac.eval(x, x)?[(0, 0)],
                None => diagonal,
            };
            self.statistics = (&self.statistics + correction).resize_vertically(m + 1, own);
            self.coefficients = self.spd.inverse()? * &self.statistics;
            debug!("inducing set grew to {} points", m + 1);
            Ok(true)
        } else {
            self.coefficients += self.spd.inverse()? * &correction;
            self.statistics += correction;
            Ok(false)
        }
    }

    /// Refits the kernel hyperparameters to the current statistics.
    ///
    /// When the kernel reports a new gram matrix, the factorization and the
    /// coefficients are rebuilt from it.
    pub fn optimize(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let targets = Tensor::from_column_slice(self.len(), 1, self.statistics.as_slice());
        if let Some(gram) = self.kernel.optimize(&self.points, &targets)? {
            self.spd = Spd::from_matrix(gram, self.config.epsilon)?;
            self.coefficients = self.spd.inverse()? * &self.statistics;
            debug!("refitted kernel over {} inducing points", self.len());
        }
        Ok(())
    }

    fn weights(&self) -> Tensor {
        Tensor::from_column_slice(self.len(), 1, self.coefficients.as_slice())
    }

    fn divisor(&self) -> f64 {
        self.config.normalization.divisor(
            self.kernel.normalization(),
            self.kernel.dvol(),
            self.observations as f64,
        )
    }
}

impl<K: Kernel> Estimator for Kdr<K> {
    fn name(&self) -> &str {
        "Kdr"
    }

    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        weighted_sum(&self.kernel, x, &self.points, &self.weights(), self.divisor())
    }

    /// Gradient with respect to the query; the coefficients are constants.
    fn vjp(&self, x: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        weighted_sum_vjp(
            &self.kernel,
            x,
            &self.points,
            &self.weights(),
            self.divisor(),
            grad_output,
        )
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        if self.config.fixed {
            return Ok(());
        }
        for i in 0..x.nrows() {
            self.observe(&x.rows(i, 1).into_owned())?;
        }
        Ok(())
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
