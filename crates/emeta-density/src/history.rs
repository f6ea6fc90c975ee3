//! Recorder of observed values.
//!
//! A [`History`] node stores every value its input takes when the graph is
//! updated, one row per observation, and evaluates to the stacked rows.
//! It can also stream the observations to a text file.

use emeta_autodiff::Estimator;
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{flatten, shape_string, Tensor, Vector};
use log::info;
use std::any::Any;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Observation recorder.
#[derive(Debug, Default)]
pub struct History {
    rows: Vec<Vector>,
    stop: Option<usize>,
    file: Option<BufWriter<File>>,
}

impl History {
    /// Creates an unbounded in-memory history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops recording after `stop` observations.
    pub fn with_stop(mut self, stop: usize) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Also writes every observation to `path`, after a `# <description>`
    /// header line.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P, description: &str) -> Result<Self> {
        let path = path.as_ref();
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(file, "# {description}")?;
        file.flush()?;
        info!("recording history of {description} to {}", path.display());
        self.file = Some(file);
        Ok(self)
    }

    /// Number of recorded observations.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether the stop count was reached.
    pub fn is_full(&self) -> bool {
        self.stop.is_some_and(|stop| self.rows.len() >= stop)
    }

    /// Recorded observations, one flattened row each.
    pub fn values(&self) -> Tensor {
        if self.rows.is_empty() {
            return Tensor::zeros(1, 1);
        }
        let d = self.rows[0].len();
        Tensor::from_fn(self.rows.len(), d, |i, j| self.rows[i][j])
    }

    /// Records one observation, flattened row-major.
    pub fn record(&mut self, x: &Tensor) -> Result<()> {
        if self.is_full() {
            return Ok(());
        }
        let row = flatten(x);
        if let Some(first) = self.rows.first() {
            if first.len() != row.len() {
                return Err(EmetaError::dimension_mismatch(
                    format!("{} values", first.len()),
                    shape_string(x),
                ));
            }
        }
        if let Some(file) = self.file.as_mut() {
            let line: Vec<String> = row.iter().map(f64::to_string).collect();
            writeln!(file, "{}", line.join(" "))?;
            file.flush()?;
        }
        self.rows.push(row);
        Ok(())
    }
}

impl Estimator for History {
    fn name(&self) -> &str {
        "History"
    }

    /// The stacked observations; the query is ignored.
    fn evaluate(&self, _x: &Tensor) -> Result<Tensor> {
        Ok(self.values())
    }

    fn vjp(&self, x: &Tensor, _grad_output: &Tensor) -> Result<Tensor> {
        Ok(Tensor::zeros(x.nrows(), x.ncols()))
    }

    fn update(&mut self, x: &Tensor) -> Result<()> {
        self.record(x)
    }

    fn is_fixed(&self) -> bool {
        self.is_full()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
