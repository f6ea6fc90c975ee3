//! Atomic configurations and the graph inputs they feed.
//!
//! An [`Atoms`] snapshot holds positions, the cell (lattice vectors as
//! rows) and periodic flags. [`AtomicInputs`] owns the three input leaves
//! of a graph that collective variables are built on; a snapshot is
//! either fed into them or turned into an evaluation [`Context`].

use emeta_autodiff::{Context, Graph, Var};
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, Tensor};

/// Name of the positions input leaf.
pub const POSITIONS: &str = "positions";
/// Name of the cell input leaf.
pub const CELL: &str = "cell";
/// Name of the periodic-flags input leaf.
pub const PBC: &str = "pbc";

/// Snapshot of an atomic configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Atoms {
    positions: Tensor,
    cell: Tensor,
    pbc: [bool; 3],
}

impl Atoms {
    /// Creates a snapshot from n×3 positions and a 3×3 cell.
    pub fn new(positions: Tensor, cell: Tensor, pbc: [bool; 3]) -> Result<Self> {
        if positions.ncols() != 3 {
            return Err(EmetaError::dimension_mismatch("(_, 3)", shape_string(&positions)));
        }
        if cell.shape() != (3, 3) {
            return Err(EmetaError::dimension_mismatch("(3, 3)", shape_string(&cell)));
        }
        Ok(Self {
            positions,
            cell,
            pbc,
        })
    }

    /// Non-periodic atoms in a zero cell.
    pub fn molecule(positions: Tensor) -> Result<Self> {
        Self::new(positions, Tensor::zeros(3, 3), [false; 3])
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.positions.nrows()
    }

    /// Whether there are no atoms.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cartesian positions (n×3).
    pub fn positions(&self) -> &Tensor {
        &self.positions
    }

    /// Replaces the positions, keeping the number of atoms.
    pub fn set_positions(&mut self, positions: Tensor) -> Result<()> {
        if positions.shape() != self.positions.shape() {
            return Err(EmetaError::dimension_mismatch(
                shape_string(&self.positions),
                shape_string(&positions),
            ));
        }
        self.positions = positions;
        Ok(())
    }

    /// Lattice vectors as rows (3×3).
    pub fn cell(&self) -> &Tensor {
        &self.cell
    }

    /// Periodic flags per lattice direction.
    pub fn pbc(&self) -> [bool; 3] {
        self.pbc
    }

    /// Periodic flags as a 1×3 tensor of zeros and ones.
    pub fn pbc_tensor(&self) -> Tensor {
        Tensor::from_fn(1, 3, |_, j| if self.pbc[j] { 1.0 } else { 0.0 })
    }

    /// Cell volume; zero for a degenerate cell.
    pub fn volume(&self) -> f64 {
        self.cell.determinant().abs()
    }

    /// Inverse of the cell matrix.
    pub fn cell_inverse(&self) -> Result<Tensor> {
        cell_inverse(&self.cell)
    }

    /// Displacement from atom `i` to atom `j`, optionally wrapped to the
    /// minimum image along the periodic directions.
    pub fn distance_vector(&self, i: usize, j: usize, mic: bool) -> Result<Tensor> {
        for index in [i, j] {
            if index >= self.len() {
                return Err(EmetaError::invalid_parameter(format!(
                    "atom index {index} out of range for {} atoms",
                    self.len()
                )));
            }
        }
        let raw = Tensor::from_fn(1, 3, |_, k| self.positions[(j, k)] - self.positions[(i, k)]);
        if !mic {
            return Ok(raw);
        }
        let images = image_shift(&raw, &self.cell, &self.pbc_tensor())?;
        Ok(raw - images * &self.cell)
    }
}

pub(crate) fn cell_inverse(cell: &Tensor) -> Result<Tensor> {
    cell.clone()
        .try_inverse()
        .ok_or_else(|| EmetaError::singular_matrix("cell matrix is not invertible"))
}

/// Integer lattice shifts (1×3) that bring `displacement` to its minimum
/// image along the periodic directions flagged in `pbc`.
pub(crate) fn image_shift(displacement: &Tensor, cell: &Tensor, pbc: &Tensor) -> Result<Tensor> {
    let scaled = displacement * cell_inverse(cell)?;
    Ok(Tensor::from_fn(1, 3, |_, k| {
        if pbc[(0, k)] != 0.0 {
            scaled[(0, k)].round()
        } else {
            0.0
        }
    }))
}

/// Input leaves of a graph describing an atomic configuration.
#[derive(Debug, Clone, Copy)]
pub struct AtomicInputs<'g> {
    /// Positions leaf (n×3).
    pub positions: Var<'g>,
    /// Cell leaf (3×3).
    pub cell: Var<'g>,
    /// Periodic flags leaf (1×3).
    pub pbc: Var<'g>,
}

impl<'g> AtomicInputs<'g> {
    /// Creates the three input leaves in `graph`.
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            positions: graph.input(POSITIONS),
            cell: graph.input(CELL),
            pbc: graph.input(PBC),
        }
    }

    /// The graph the leaves live in.
    pub fn graph(&self) -> &'g Graph {
        self.positions.graph()
    }

    /// Evaluation context substituting a snapshot for the leaves.
    pub fn context(&self, atoms: &Atoms) -> Context {
        let mut context = Context::new();
        context.insert(self.positions.id(), atoms.positions().clone());
        context.insert(self.cell.id(), atoms.cell().clone());
        context.insert(self.pbc.id(), atoms.pbc_tensor());
        context
    }

    /// Stores a snapshot in the leaves, invalidating everything built on
    /// them.
    pub fn feed(&self, atoms: &Atoms) -> Result<()> {
        self.positions.feed(atoms.positions().clone())?;
        self.cell.feed(atoms.cell().clone())?;
        self.pbc.feed(atoms.pbc_tensor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic(positions: &[f64], a: f64) -> Atoms {
        Atoms::new(
            Tensor::from_row_slice(positions.len() / 3, 3, positions),
            Tensor::identity(3, 3) * a,
            [true; 3],
        )
        .unwrap()
    }

    #[test]
    fn test_shape_validation() {
        assert!(Atoms::new(Tensor::zeros(2, 2), Tensor::identity(3, 3), [true; 3]).is_err());
        assert!(Atoms::new(Tensor::zeros(2, 3), Tensor::identity(2, 2), [true; 3]).is_err());
        let mut atoms = Atoms::molecule(Tensor::zeros(2, 3)).unwrap();
        assert_eq!(atoms.len(), 2);
        assert!(atoms.set_positions(Tensor::zeros(3, 3)).is_err());
    }

    #[test]
    fn test_volume_and_inverse() {
        let atoms = cubic(&[0.0; 3], 2.0);
        assert_relative_eq!(atoms.volume(), 8.0, epsilon = 1e-12);
        let inverse = atoms.cell_inverse().unwrap();
        assert_relative_eq!(inverse[(1, 1)], 0.5, epsilon = 1e-12);

        let molecule = Atoms::molecule(Tensor::zeros(1, 3)).unwrap();
        assert_eq!(molecule.volume(), 0.0);
        assert!(matches!(
            molecule.cell_inverse(),
            Err(EmetaError::SingularMatrix { .. })
        ));
    }

    #[test]
    fn test_minimum_image() {
        let atoms = cubic(&[0.1, 0.0, 0.0, 9.8, 0.0, 0.0], 10.0);
        let raw = atoms.distance_vector(0, 1, false).unwrap();
        assert_relative_eq!(raw[(0, 0)], 9.7, epsilon = 1e-12);
        let wrapped = atoms.distance_vector(0, 1, true).unwrap();
        assert_relative_eq!(wrapped[(0, 0)], -0.3, epsilon = 1e-12);

        let mut open = atoms.clone();
        open.pbc = [false, true, true];
        assert_relative_eq!(open.distance_vector(0, 1, true).unwrap()[(0, 0)], 9.7, epsilon = 1e-12);
        assert!(atoms.distance_vector(0, 5, false).is_err());
    }

    #[test]
    fn test_context_and_feed() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let atoms = cubic(&[1.0, 2.0, 3.0], 5.0);

        let ctx = inputs.context(&atoms);
        assert_eq!(inputs.positions.evaluate(Some(&ctx)).unwrap(), *atoms.positions());
        assert!(inputs.positions.value().is_err());

        inputs.feed(&atoms).unwrap();
        assert_eq!(inputs.pbc.value().unwrap(), Tensor::from_element(1, 3, 1.0));
        assert_eq!(inputs.cell.describe(), "cell");
    }
}
