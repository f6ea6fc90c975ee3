//! Biasing an external potential.
//!
//! A [`Potential`] computes energy, forces and optionally stress for an
//! atomic snapshot. [`Biased`] wraps one and adds a bias expression built
//! on [`AtomicInputs`]: the bias energy is added to the energy, its
//! negative position gradient to the forces and its virial to the stress.
//! After every calculation the estimators inside the bias observe the new
//! configuration.

use crate::atoms::{AtomicInputs, Atoms};
use emeta_autodiff::{backward, Tensor, Var};
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, to_scalar};
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Voigt order of the stress components: xx yy zz yz xz xy.
const VOIGT: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (1, 2), (0, 2), (0, 1)];

/// Output of a potential.
#[derive(Debug, Clone, PartialEq)]
pub struct Results {
    /// Potential energy.
    pub energy: f64,
    /// Forces on the atoms (n×3).
    pub forces: Tensor,
    /// Stress in Voigt order, when the potential provides it.
    pub stress: Option<[f64; 6]>,
}

/// Energy, forces and stress of atomic configurations.
pub trait Potential {
    /// Evaluates the potential at `atoms`.
    fn calculate(&mut self, atoms: &Atoms) -> Result<Results>;
}

impl<P: Potential + ?Sized> Potential for &mut P {
    fn calculate(&mut self, atoms: &Atoms) -> Result<Results> {
        (**self).calculate(atoms)
    }
}

impl<P: Potential + ?Sized> Potential for Box<P> {
    fn calculate(&mut self, atoms: &Atoms) -> Result<Results> {
        (**self).calculate(atoms)
    }
}

/// The test potential `V = 0`, with zero stress.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zero;

impl Potential for Zero {
    fn calculate(&mut self, atoms: &Atoms) -> Result<Results> {
        Ok(Results {
            energy: 0.0,
            forces: Tensor::zeros(atoms.len(), 3),
            stress: Some([0.0; 6]),
        })
    }
}

/// A potential plus a bias expression.
#[derive(Debug)]
pub struct Biased<'g, P> {
    bias: Var<'g>,
    inputs: AtomicInputs<'g>,
    potential: P,
    log: Option<BufWriter<File>>,
}

impl<'g, P: Potential> Biased<'g, P> {
    /// Wraps `potential` with `bias`, a 1×1 expression over `inputs`.
    pub fn new(bias: Var<'g>, inputs: AtomicInputs<'g>, potential: P) -> Self {
        Self {
            bias,
            inputs,
            potential,
            log: None,
        }
    }

    /// Records `<energy> <bias>` for every calculation in `path`.
    pub fn with_log<Q: AsRef<Path>>(mut self, path: Q) -> Result<Self> {
        let path = path.as_ref();
        let mut log = BufWriter::new(File::create(path)?);
        writeln!(log, "# bias = {}", self.bias.describe())?;
        writeln!(log, "# energy bias")?;
        log.flush()?;
        info!("logging biased energies to {}", path.display());
        self.log = Some(log);
        Ok(self)
    }

    /// The bias expression.
    pub fn bias(&self) -> Var<'g> {
        self.bias
    }

    /// The wrapped potential.
    pub fn potential(&self) -> &P {
        &self.potential
    }

    /// Current bias energy of `atoms`, without side effects.
    pub fn bias_energy(&self, atoms: &Atoms) -> Result<f64> {
        let context = self.inputs.context(atoms);
        scalar_bias(&self.bias.evaluate(Some(&context))?)
    }

    /// Biased energy, forces and stress at `atoms`.
    pub fn calculate(&mut self, atoms: &Atoms) -> Result<Results> {
        let mut results = self.potential.calculate(atoms)?;
        if results.forces.shape() != (atoms.len(), 3) {
            return Err(EmetaError::dimension_mismatch(
                format!("({}, 3)", atoms.len()),
                shape_string(&results.forces),
            ));
        }

        self.inputs.feed(atoms)?;
        let graph = self.inputs.graph();
        let bias = scalar_bias(&self.bias.value()?)?;
        if !bias.is_finite() {
            warn!("non-finite bias energy {bias}");
        }
        if let Some(log) = self.log.as_mut() {
            writeln!(log, "{:?} {:?}", results.energy, bias)?;
            log.flush()?;
        }

        let gradients = backward(graph, self.bias.id(), None, None)?;
        let zeros = |r, c| Tensor::zeros(r, c);
        let grad_positions = gradients
            .get(&self.inputs.positions.id())
            .cloned()
            .unwrap_or_else(|| zeros(atoms.len(), 3));
        let grad_cell = gradients
            .get(&self.inputs.cell.id())
            .cloned()
            .unwrap_or_else(|| zeros(3, 3));
        let forces = -grad_positions;

        results.energy += bias;
        results.forces += &forces;

        if let Some(stress) = results.stress.as_mut() {
            let volume = atoms.volume();
            if volume > 0.0 {
                let s1 = -(atoms.positions().transpose() * &forces);
                let s2 = atoms.cell().transpose() * &grad_cell;
                let total = (s1 + s2) / volume;
                for (component, &(a, b)) in stress.iter_mut().zip(VOIGT.iter()) {
                    *component += total[(a, b)];
                }
            } else {
                warn!("degenerate cell volume {volume}, bias stress not added");
            }
        }

        self.bias.update()?;
        Ok(results)
    }
}

fn scalar_bias(value: &Tensor) -> Result<f64> {
    to_scalar(value).ok_or_else(|| EmetaError::dimension_mismatch("(1, 1)", shape_string(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use emeta_autodiff::Graph;
    use pretty_assertions::assert_eq;

    /// Harmonic springs tying every atom to the origin.
    struct Springs;

    impl Potential for Springs {
        fn calculate(&mut self, atoms: &Atoms) -> Result<Results> {
            let p = atoms.positions();
            Ok(Results {
                energy: 0.5 * p.norm_squared(),
                forces: -p,
                stress: None,
            })
        }
    }

    fn dimer(distance: f64) -> Atoms {
        Atoms::new(
            Tensor::from_row_slice(2, 3, &[1.0, 1.0, 1.0, 1.0 + distance, 1.0, 1.0]),
            Tensor::identity(3, 3) * 10.0,
            [true; 3],
        )
        .unwrap()
    }

    #[test]
    fn test_forces_are_negated_bias_gradient() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let d = inputs.distance(0, 1, false, false).unwrap();
        let bias = (d - 1.0).square() * 2.0;
        let mut calc = Biased::new(bias, inputs, Springs);

        let atoms = dimer(1.5);
        let base = Springs.calculate(&atoms).unwrap();
        let results = calc.calculate(&atoms).unwrap();

        // E_bias = 2 (d - 1)² = 0.5; dE/dd = 4 (d - 1) = 2 along x.
        assert_relative_eq!(results.energy, base.energy + 0.5, epsilon = 1e-12);
        assert_relative_eq!(results.forces[(0, 0)], base.forces[(0, 0)] + 2.0, epsilon = 1e-12);
        assert_relative_eq!(results.forces[(1, 0)], base.forces[(1, 0)] - 2.0, epsilon = 1e-12);
        assert_relative_eq!(results.forces[(1, 1)], base.forces[(1, 1)], epsilon = 1e-12);
        assert_eq!(results.stress, None);
    }

    #[test]
    fn test_stress_of_pair_bias() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let bias = inputs.distance(0, 1, false, false).unwrap() * 1.0;
        let mut calc = Biased::new(bias, inputs, Zero);

        let atoms = dimer(2.0);
        let results = calc.calculate(&atoms).unwrap();
        let stress = results.stress.unwrap();
        // f_1 = -x̂, f_0 = +x̂: s1_xx = -(x_0 f_0x + x_1 f_1x) = -(1 - 3) = 2.
        assert_relative_eq!(stress[0], 2.0 / 1000.0, epsilon = 1e-12);
        for component in &stress[1..] {
            assert_relative_eq!(*component, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("biased.log");
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let bias = inputs.distance(0, 1, false, false).unwrap() * 2.0;
        let mut calc = Biased::new(bias, inputs, Zero).with_log(&path).unwrap();

        calc.calculate(&dimer(1.0)).unwrap();
        calc.calculate(&dimer(0.5)).unwrap();
        drop(calc);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# bias = D(0, 1)*2\n# energy bias\n0.0 2.0\n0.0 1.0\n");
    }

    #[test]
    fn test_non_scalar_bias_is_rejected() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let bias = inputs.distance(0, 1, false, true).unwrap();
        let mut calc = Biased::new(bias, inputs, Zero);
        let err = calc.calculate(&dimer(1.0)).unwrap_err();
        assert!(matches!(err, EmetaError::DimensionMismatch { .. }));
    }
}
