//! Velocity-Verlet dynamics of graph parameters.
//!
//! The parameters reachable from an energy expression are treated as unit
//! mass coordinates moving under the force `-∂E/∂x`. Velocities are the
//! parameters' `dot` state.

use emeta_autodiff::{Param, Tensor, Var};
use emeta_core::config::VerletConfig;
use emeta_core::error::Result;
use emeta_core::types::{flatten, to_scalar};
use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Optional trajectory sink.
#[derive(Debug, Default)]
pub struct Trajectory {
    file: Option<BufWriter<File>>,
}

impl Trajectory {
    /// A trajectory that records nothing.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Writes the trajectory to `path`, replacing its contents.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("writing trajectory to {}", path.display());
        Ok(Self {
            file: Some(BufWriter::new(File::create(path)?)),
        })
    }

    /// Appends to `path`, creating it if needed.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("appending trajectory to {}", path.display());
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
        })
    }

    fn line(&mut self, fields: &[String]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", fields.join(" "))?;
            file.flush()?;
        }
        Ok(())
    }
}

fn format_tensor(tensor: &Tensor) -> String {
    let values: Vec<String> = flatten(tensor).iter().map(f64::to_string).collect();
    values.join(" ")
}

fn total_energy(energy: Var<'_>) -> Result<f64> {
    let value = energy.value()?;
    Ok(to_scalar(&value).unwrap_or_else(|| value.sum()))
}

/// Recomputes the forces on every parameter of `energy`.
fn refresh_forces(energy: Var<'_>) -> Result<()> {
    let graph = energy.graph();
    graph.zero_grad(energy.id())?;
    graph.backward(energy.id(), None)?;
    Ok(())
}

fn force_or_zeros(param: &Param<'_>) -> Result<Tensor> {
    match param.force()? {
        Some(force) => Ok(force),
        None => {
            let value = param.value()?;
            Ok(Tensor::zeros(value.nrows(), value.ncols()))
        }
    }
}

/// Integrates the parameters of `energy` with velocity Verlet.
///
/// Only parameters that require gradients move. After each step the energy
/// and every parameter's value and velocity are written to `trajectory`,
/// below a `# energy <name> <name>_dot ...` header. Returns the energy
/// after each step.
pub fn verlet(energy: Var<'_>, config: VerletConfig, trajectory: &mut Trajectory) -> Result<Vec<f64>> {
    config.validate()?;
    let graph = energy.graph();
    let mut params = Vec::new();
    for id in energy.params() {
        let param = graph.param_handle(id)?;
        if param.requires_grad()? {
            params.push(param);
        }
    }

    let mut header = vec!["# energy".to_string()];
    for param in &params {
        let name = param.name()?;
        header.push(format!("{name} {name}_dot"));
    }
    trajectory.line(&header)?;

    let dt = config.dt;
    let mut energies = Vec::with_capacity(config.steps);
    refresh_forces(energy)?;
    for step in 0..config.steps {
        let mut old_forces = Vec::with_capacity(params.len());
        for param in &params {
            let force = force_or_zeros(param)?;
            let displacement = (param.dot()? + &force * (dt / 2.0)) * dt;
            param.add(&displacement)?;
            old_forces.push(force);
        }

        refresh_forces(energy)?;
        let e = total_energy(energy)?;
        let mut fields = vec![e.to_string()];
        for (param, old) in params.iter().zip(&old_forces) {
            let new = force_or_zeros(param)?;
            param.add_dot(&((old + new) * (dt / 2.0)))?;
            fields.push(format_tensor(&param.value()?));
            fields.push(format_tensor(&param.dot()?));
        }
        trajectory.line(&fields)?;
        energies.push(e);
        debug!("verlet step {step}: energy {e}");
    }
    Ok(energies)
}
