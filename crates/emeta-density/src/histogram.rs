//! Sparse histograms and grid kernel density estimates.
//!
//! [`Histogram`] bins every observation onto a regular grid (`floor(x/δ)`
//! per dimension) and counts hits in a sparse map keyed by the integer bin
//! tuple. [`Kde`] smooths the same counts with a Gaussian kernel whose
//! bandwidth is the bin width.
//!
//! Counts can be persisted as plain text, one occupied bin per line:
//! ```text
//! (0,) : 3.0
//! (-2, 5) : 1.0
//! ```
//! Loading adds into the existing counts.

use crate::density::GridKde;
use crate::kernel::Kernel;
use emeta_autodiff::Estimator;
use emeta_core::config::{DensityConfig, Normalization};
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, Tensor, Vector};
use log::info;
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Integer grid coordinates of a bin.
pub type BinKey = Vec<i64>;

/// Sparse histogram over a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    delta: Vector,
    counts: BTreeMap<BinKey, f64>,
    fixed: bool,
}

impl Histogram {
    /// Creates an empty histogram with one bin width per dimension, or a
    /// single width shared by every dimension.
    pub fn new(delta: &[f64]) -> Result<Self> {
        if delta.is_empty() || delta.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return Err(EmetaError::invalid_parameter(format!(
                "bin widths must be positive and finite, got {delta:?}"
            )));
        }
        Ok(Self {
            delta: Vector::from_column_slice(delta),
            counts: BTreeMap::new(),
            fixed: false,
        })
    }

    fn width(&self, axis: usize) -> f64 {
        if self.delta.len() == 1 {
            self.delta[0]
        } else {
            self.delta[axis]
        }
    }

    /// Bin widths.
    pub fn delta(&self) -> &Vector {
        &self.delta
    }

    /// Bin containing row `i` of `x`.
    ///
    /// Non-finite values have no bin and fail with `NumericalCorruption`.
    pub fn bin(&self, x: &Tensor, i: usize) -> Result<BinKey> {
        if self.delta.len() != 1 && x.ncols() != self.delta.len() {
            return Err(EmetaError::dimension_mismatch(
                format!("(_, {})", self.delta.len()),
                shape_string(x),
            ));
        }
        if i >= x.nrows() {
            return Err(EmetaError::dimension_mismatch(
                format!("more than {i} rows"),
                shape_string(x),
            ));
        }
        if let Some(bad) = x.row(i).iter().find(|v| !v.is_finite()) {
            return Err(EmetaError::numerical_corruption(format!(
                "cannot bin non-finite sample {bad} in row {i}"
            )));
        }
        Ok((0..x.ncols())
            .map(|c| (x[(i, c)] / self.width(c)).floor() as i64)
            .collect())
    }

    /// Count of one bin, zero when empty.
    pub fn count(&self, key: &[i64]) -> f64 {
        self.counts.get(key).copied().unwrap_or(0.0)
    }

    /// Adds `weight` to one bin.
    pub fn add(&mut self, key: BinKey, weight: f64) {
        *self.counts.entry(key).or_insert(0.0) += weight;
    }

    /// Counts every row of `x` once. Nothing is counted if any row fails
    /// to bin.
    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        let keys = (0..x.nrows())
            .map(|i| self.bin(x, i))
            .collect::<Result<Vec<_>>>()?;
        for key in keys {
            self.add(key, 1.0);
        }
        Ok(())
    }

    /// Number of occupied bins.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no bin is occupied.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts.
    pub fn total(&self) -> f64 {
        self.counts.values().sum()
    }

    /// Occupied bins and their counts, in key order.
    pub fn bins(&self) -> impl Iterator<Item = (&BinKey, f64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }

    /// Lower corners (k×d) and counts (k×1) of the occupied bins.
    ///
    /// With `density` the counts are scaled to a probability density, i.e.
    /// divided by `Σcount · Πδ`.
    pub fn full(&self, density: bool) -> (Tensor, Tensor) {
        let k = self.counts.len();
        let d = self.counts.keys().next().map_or(self.delta.len(), Vec::len);
        let mut corners = Tensor::zeros(k, d);
        let mut counts = Tensor::zeros(k, 1);
        for (row, (key, count)) in self.counts.iter().enumerate() {
            for (c, b) in key.iter().enumerate() {
                corners[(row, c)] = *b as f64 * self.width(c);
            }
            counts[(row, 0)] = *count;
        }
        if density && k > 0 {
            let volume: f64 = (0..d).map(|c| self.width(c)).product();
            counts /= self.total() * volume;
        }
        (corners, counts)
    }

    /// Freezes or unfreezes the counts.
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Writes the counts in the text format.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for (key, count) in &self.counts {
            writeln!(writer, "{} : {:?}", format_key(key), count)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Adds counts read from the text format.
    pub fn read_from<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let (key, count) = parse_line(&line).map_err(|reason| EmetaError::parse(n + 1, reason))?;
            self.add(key, count);
        }
        Ok(())
    }

    /// Saves the counts to `path`, replacing its contents.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("saving {} histogram bins to {}", self.len(), path.display());
        self.write_to(BufWriter::new(File::create(path)?))
    }

    /// Adds the counts saved in `path`.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("loading histogram bins from {}", path.display());
        self.read_from(BufReader::new(File::open(path)?))
    }
}

fn format_key(key: &[i64]) -> String {
    match key {
        [single] => format!("({single},)"),
        _ => {
            let parts: Vec<String> = key.iter().map(i64::to_string).collect();
            format!("({})", parts.join(", "))
        }
    }
}

fn parse_line(line: &str) -> std::result::Result<(BinKey, f64), String> {
    let (key, count) = line
        .split_once(':')
        .ok_or_else(|| format!("expected '<key> : <count>', got {line:?}"))?;
    let key = key.trim();
    let inner = key
        .strip_prefix('(')
        .and_then(|k| k.strip_suffix(')'))
        .ok_or_else(|| format!("bin key {key:?} is not a parenthesized tuple"))?;
    let key = inner
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<i64>().map_err(|e| format!("bad bin index {part:?}: {e}")))
        .collect::<std::result::Result<BinKey, String>>()?;
    if key.is_empty() {
        return Err("empty bin key".to_string());
    }
    let count = count
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad count {:?}: {e}", count.trim()))?;
    Ok((key, count))
}

impl Estimator for Histogram {
    fn name(&self) -> &str {
        "Histogram"
    }

    /// Count of the bin containing each query row (k×1).
    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = Tensor::zeros(x.nrows(), 1);
        for i in 0..x.nrows() {
            out[(i, 0)] = self.count(&self.bin(x, i)?);
        }
        Ok(out)
    }

    /// Counts are piecewise constant in the query.
    fn vjp(&self, x: &Tensor, _grad_output: &Tensor) -> Result<Tensor> {
        Ok(Tensor::zeros(x.nrows(), x.ncols()))
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        if self.fixed {
            return Ok(());
        }
        self.observe(x)
    }

    fn is_fixed(&self) -> bool {
        self.fixed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Kernel density estimate over histogram counts.
///
/// Observations are binned with the kernel bandwidth as bin width and
/// `evaluate` sums `count_b · k(x, center_b)` over occupied bins, where
/// `center_b = (b + ½)·scale`, divided by the kernel normalization.
#[derive(Debug, Clone)]
pub struct Kde<K: Kernel> {
    grid: GridKde<K>,
}

impl<K: Kernel> Kde<K> {
    /// Creates an empty estimate.
    pub fn new(kernel: K) -> Result<Self> {
        let config = DensityConfig {
            normalization: Normalization::Kernel,
            fixed: false,
        };
        Ok(Self {
            grid: GridKde::new(kernel, config)?,
        })
    }

    /// The underlying counts.
    pub fn histogram(&self) -> &Histogram {
        self.grid.histogram()
    }

    /// The underlying counts, mutably (e.g. to load saved counts).
    pub fn histogram_mut(&mut self) -> &mut Histogram {
        self.grid.histogram_mut()
    }

    /// The kernel.
    pub fn kernel(&self) -> &K {
        self.grid.kernel()
    }
}

impl<K: Kernel> Estimator for Kde<K> {
    fn name(&self) -> &str {
        "Kde"
    }

    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        self.grid.evaluate(x)
    }

    fn vjp(&self, x: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        self.grid.vjp(x, grad_output)
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        self.grid.update(x)
    }

    fn is_fixed(&self) -> bool {
        self.grid.is_fixed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
