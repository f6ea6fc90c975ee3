//! Collective variables of atomic configurations.
//!
//! Each collective variable is an [`Op`] over the leaves of
//! [`AtomicInputs`], so it composes with the rest of the expression
//! language and is differentiable with respect to positions and cell.

use crate::atoms::{cell_inverse, image_shift, AtomicInputs};
use emeta_autodiff::{Op, Operand, Tensor, Var};
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::shape_string;
use std::fmt;

/// Rows picked out of an atomic tensor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every row.
    #[default]
    All,
    /// The listed rows, in order.
    Rows(Vec<usize>),
}

impl Selection {
    fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        match self {
            Self::All => Ok(tensor.clone()),
            Self::Rows(rows) => {
                if let Some(bad) = rows.iter().find(|&&r| r >= tensor.nrows()) {
                    return Err(EmetaError::invalid_parameter(format!(
                        "row {bad} out of range for {}",
                        shape_string(tensor)
                    )));
                }
                Ok(tensor.select_rows(rows.iter()))
            }
        }
    }

    fn scatter(&self, grad: &Tensor, shape: (usize, usize)) -> Tensor {
        match self {
            Self::All => grad.clone(),
            Self::Rows(rows) => {
                let mut full = Tensor::zeros(shape.0, shape.1);
                for (k, &r) in rows.iter().enumerate() {
                    for c in 0..shape.1 {
                        full[(r, c)] += grad[(k, c)];
                    }
                }
                full
            }
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => Ok(()),
            Self::Rows(rows) => {
                let parts: Vec<String> = rows.iter().map(usize::to_string).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl From<usize> for Selection {
    fn from(row: usize) -> Self {
        Self::Rows(vec![row])
    }
}

impl From<Vec<usize>> for Selection {
    fn from(rows: Vec<usize>) -> Self {
        Self::Rows(rows)
    }
}

impl From<&[usize]> for Selection {
    fn from(rows: &[usize]) -> Self {
        Self::Rows(rows.to_vec())
    }
}

/// Kinds of atomic leaf an op reads, in argument order.
#[derive(Debug, Clone, Copy)]
enum Leaf {
    Positions,
    Cell,
    Pbc,
}

impl Leaf {
    fn accepts(self, tensor: &Tensor) -> bool {
        match self {
            Self::Positions => tensor.ncols() == 3,
            Self::Cell => tensor.shape() == (3, 3),
            Self::Pbc => tensor.shape() == (1, 3),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Positions => "(_, 3)",
            Self::Cell => "(3, 3)",
            Self::Pbc => "(1, 3)",
        }
    }
}

/// Checks that `inputs` match `leaves` in number and shape.
fn check_inputs(inputs: &[Tensor], leaves: &[Leaf]) -> Result<()> {
    if inputs.len() != leaves.len() {
        return Err(EmetaError::dimension_mismatch(
            format!("{} inputs", leaves.len()),
            format!("{} inputs", inputs.len()),
        ));
    }
    for (tensor, leaf) in inputs.iter().zip(leaves) {
        if !leaf.accepts(tensor) {
            return Err(EmetaError::dimension_mismatch(leaf.expected(), shape_string(tensor)));
        }
    }
    Ok(())
}

fn zero_grads(inputs: &[Tensor]) -> Vec<Tensor> {
    inputs.iter().map(|t| Tensor::zeros(t.nrows(), t.ncols())).collect()
}

/// Cartesian positions of selected atoms.
#[derive(Debug, Clone)]
pub struct Positions {
    /// Atoms to report.
    pub atoms: Selection,
}

impl Op for Positions {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        check_inputs(inputs, &[Leaf::Positions])?;
        self.atoms.apply(&inputs[0])
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        if check_inputs(inputs, &[Leaf::Positions]).is_err() || self.atoms.apply(&inputs[0]).is_err() {
            return zero_grads(inputs);
        }
        vec![self.atoms.scatter(grad_output, inputs[0].shape())]
    }

    fn name(&self) -> &str {
        "P"
    }

    fn describe(&self, _args: &[String]) -> String {
        format!("P({})", self.atoms)
    }
}

/// Selected lattice vectors.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Lattice vectors to report.
    pub rows: Selection,
}

impl Op for Cell {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        check_inputs(inputs, &[Leaf::Cell])?;
        self.rows.apply(&inputs[0])
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        if check_inputs(inputs, &[Leaf::Cell]).is_err() || self.rows.apply(&inputs[0]).is_err() {
            return zero_grads(inputs);
        }
        vec![self.rows.scatter(grad_output, inputs[0].shape())]
    }

    fn name(&self) -> &str {
        "C"
    }

    fn describe(&self, _args: &[String]) -> String {
        format!("C({})", self.rows)
    }
}

/// Fractional coordinates `p·C⁻¹ mod 1` of selected atoms.
///
/// Inputs are positions and cell. The wrap is piecewise constant, so the
/// gradient is that of `p·C⁻¹`.
#[derive(Debug, Clone)]
pub struct ScaledPositions {
    /// Atoms to report.
    pub atoms: Selection,
}

impl Op for ScaledPositions {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        check_inputs(inputs, &[Leaf::Positions, Leaf::Cell])?;
        let positions = self.atoms.apply(&inputs[0])?;
        let scaled = positions * cell_inverse(&inputs[1])?;
        Ok(scaled.map(|s| s - s.floor()))
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        if check_inputs(inputs, &[Leaf::Positions, Leaf::Cell]).is_err() {
            return zero_grads(inputs);
        }
        let (Ok(positions), Ok(inverse)) = (self.atoms.apply(&inputs[0]), cell_inverse(&inputs[1]))
        else {
            return zero_grads(inputs);
        };
        let inverse_t = inverse.transpose();
        let grad_positions = grad_output * &inverse_t;
        let grad_cell = -(&inverse_t * positions.transpose() * grad_output * &inverse_t);
        vec![
            self.atoms.scatter(&grad_positions, inputs[0].shape()),
            grad_cell,
        ]
    }

    fn name(&self) -> &str {
        "SP"
    }

    fn describe(&self, _args: &[String]) -> String {
        format!("SP({})", self.atoms)
    }
}

/// Distance between atoms `i` and `j`.
///
/// With `mic` the displacement is wrapped to the minimum image along the
/// periodic directions, and the inputs are positions, cell and periodic
/// flags; otherwise positions only. With `vector` the 1×3 displacement is
/// returned instead of its norm.
#[derive(Debug, Clone)]
pub struct Distance {
    /// First atom.
    pub i: usize,
    /// Second atom.
    pub j: usize,
    /// Wrap to the minimum image.
    pub mic: bool,
    /// Return the displacement instead of its norm.
    pub vector: bool,
}

impl Distance {
    fn leaves(&self) -> &'static [Leaf] {
        if self.mic {
            &[Leaf::Positions, Leaf::Cell, Leaf::Pbc]
        } else {
            &[Leaf::Positions]
        }
    }

    fn displacement(&self, inputs: &[Tensor]) -> Result<(Tensor, Option<Tensor>)> {
        check_inputs(inputs, self.leaves())?;
        let positions = &inputs[0];
        for index in [self.i, self.j] {
            if index >= positions.nrows() {
                return Err(EmetaError::invalid_parameter(format!(
                    "atom index {index} out of range for {} atoms",
                    positions.nrows()
                )));
            }
        }
        let raw = Tensor::from_fn(1, 3, |_, k| positions[(self.j, k)] - positions[(self.i, k)]);
        if !self.mic {
            return Ok((raw, None));
        }
        let images = image_shift(&raw, &inputs[1], &inputs[2])?;
        Ok((raw - &images * &inputs[1], Some(images)))
    }
}

impl Op for Distance {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let (displacement, _) = self.displacement(inputs)?;
        if self.vector {
            Ok(displacement)
        } else {
            Ok(Tensor::from_element(1, 1, displacement.norm()))
        }
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        let mut grads = zero_grads(inputs);
        let Ok((displacement, images)) = self.displacement(inputs) else {
            return grads;
        };

        let grad_r = if self.vector {
            grad_output.clone()
        } else {
            let norm = displacement.norm();
            if norm == 0.0 {
                return grads;
            }
            &displacement * (grad_output[(0, 0)] / norm)
        };

        for k in 0..3 {
            grads[0][(self.j, k)] += grad_r[(0, k)];
            grads[0][(self.i, k)] -= grad_r[(0, k)];
        }
        if let Some(images) = images {
            grads[1] = -(images.transpose() * &grad_r);
        }
        grads
    }

    fn name(&self) -> &str {
        "D"
    }

    fn describe(&self, _args: &[String]) -> String {
        let mut text = format!("D({}, {}", self.i, self.j);
        if self.mic {
            text.push_str(", mic=true");
        }
        if self.vector {
            text.push_str(", vector=true");
        }
        text.push(')');
        text
    }
}

impl<'g> AtomicInputs<'g> {
    /// Positions of the selected atoms.
    pub fn positions_of(&self, atoms: impl Into<Selection>) -> Result<Var<'g>> {
        self.graph().apply(
            Positions {
                atoms: atoms.into(),
            },
            vec![Operand::from(self.positions)],
        )
    }

    /// Selected lattice vectors.
    pub fn cell_rows(&self, rows: impl Into<Selection>) -> Result<Var<'g>> {
        self.graph()
            .apply(Cell { rows: rows.into() }, vec![Operand::from(self.cell)])
    }

    /// Fractional coordinates of the selected atoms.
    pub fn scaled_positions(&self, atoms: impl Into<Selection>) -> Result<Var<'g>> {
        self.graph().apply(
            ScaledPositions {
                atoms: atoms.into(),
            },
            vec![Operand::from(self.positions), Operand::from(self.cell)],
        )
    }

    /// Distance (or displacement, with `vector`) from atom `i` to atom `j`.
    pub fn distance(&self, i: usize, j: usize, mic: bool, vector: bool) -> Result<Var<'g>> {
        let mut args = vec![Operand::from(self.positions)];
        if mic {
            args.push(Operand::from(self.cell));
            args.push(Operand::from(self.pbc));
        }
        self.graph().apply(Distance { i, j, mic, vector }, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::Atoms;
    use approx::assert_relative_eq;
    use emeta_autodiff::{check_gradients, Graph};

    fn triclinic() -> Atoms {
        Atoms::new(
            Tensor::from_row_slice(3, 3, &[0.2, 0.1, 0.3, 4.6, 0.4, 0.2, 1.0, 2.5, 3.9]),
            Tensor::from_row_slice(3, 3, &[5.0, 0.0, 0.0, 1.0, 4.5, 0.0, 0.5, 0.3, 4.0]),
            [true; 3],
        )
        .unwrap()
    }

    #[test]
    fn test_selection() {
        let t = Tensor::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let sel = Selection::from(vec![2, 0]);
        assert_eq!(sel.apply(&t).unwrap(), Tensor::from_row_slice(2, 2, &[5.0, 6.0, 1.0, 2.0]));
        assert!(Selection::from(3_usize).apply(&t).is_err());
        let back = sel.scatter(&Tensor::from_element(2, 2, 1.0), (3, 2));
        assert_eq!(back.row_sum()[(0, 0)], 1.0 + 0.0 + 1.0);
        assert_eq!(sel.to_string(), "2, 0");
    }

    #[test]
    fn test_positions_and_cell() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let atoms = triclinic();
        inputs.feed(&atoms).unwrap();

        let p = inputs.positions_of(1_usize).unwrap();
        assert_eq!(p.value().unwrap(), Tensor::from_row_slice(1, 3, &[4.6, 0.4, 0.2]));
        assert_eq!(p.describe(), "P(1)");

        let a = inputs.cell_rows(Selection::All).unwrap();
        assert_eq!(a.value().unwrap(), *atoms.cell());
        assert_eq!(a.describe(), "C()");
    }

    #[test]
    fn test_scaled_positions_reconstruct_cartesian() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let atoms = triclinic();
        inputs.feed(&atoms).unwrap();

        let sp = inputs.scaled_positions(Selection::All).unwrap().value().unwrap();
        assert!(sp.iter().all(|s| (0.0..1.0).contains(s)));
        // Fractional coordinates map back to the positions modulo a lattice vector.
        let back = &sp * atoms.cell();
        let diff = (atoms.positions() - back) * atoms.cell_inverse().unwrap();
        for d in diff.iter() {
            assert_relative_eq!(*d, d.round(), epsilon = 1e-10);
        }
    }

    #[test]
    fn test_scaled_positions_gradients() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        inputs.feed(&triclinic()).unwrap();
        let cv = (inputs.scaled_positions(vec![0, 2]).unwrap() * 2.0).sin().sum(None);

        let error = check_gradients(&graph, cv.id(), inputs.positions.id(), None, 1e-6).unwrap();
        assert!(error < 1e-5, "positions: relative error {error}");
        let error = check_gradients(&graph, cv.id(), inputs.cell.id(), None, 1e-6).unwrap();
        assert!(error < 1e-5, "cell: relative error {error}");
    }

    #[test]
    fn test_distance_gradient_is_unit_vector() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let atoms = Atoms::molecule(Tensor::from_row_slice(2, 3, &[0.0, 0.0, 0.0, 3.0, 4.0, 0.0])).unwrap();
        inputs.feed(&atoms).unwrap();

        let d = inputs.distance(0, 1, false, false).unwrap();
        assert_relative_eq!(d.value().unwrap()[(0, 0)], 5.0, epsilon = 1e-12);
        assert_eq!(d.describe(), "D(0, 1)");

        let grads = d.backward().unwrap();
        let g = &grads[&inputs.positions.id()];
        assert_relative_eq!(g[(1, 0)], 0.6, epsilon = 1e-12);
        assert_relative_eq!(g[(1, 1)], 0.8, epsilon = 1e-12);
        assert_relative_eq!(g[(0, 0)], -0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_distance_with_minimum_image() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        let atoms = triclinic();
        inputs.feed(&atoms).unwrap();

        let d = inputs.distance(0, 1, true, true).unwrap();
        let expected = atoms.distance_vector(0, 1, true).unwrap();
        assert_relative_eq!(d.value().unwrap(), expected, epsilon = 1e-12);
        assert_eq!(d.describe(), "D(0, 1, mic=true, vector=true)");

        let r = inputs.distance(0, 1, true, false).unwrap();
        let error = check_gradients(&graph, r.id(), inputs.positions.id(), None, 1e-6).unwrap();
        assert!(error < 1e-5, "positions: relative error {error}");
        let error = check_gradients(&graph, r.id(), inputs.cell.id(), None, 1e-6).unwrap();
        assert!(error < 1e-5, "cell: relative error {error}");
    }

    #[test]
    fn test_coincident_atoms_have_zero_gradient() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        inputs.feed(&Atoms::molecule(Tensor::zeros(2, 3)).unwrap()).unwrap();
        let d = inputs.distance(0, 1, false, false).unwrap();
        let grads = d.backward().unwrap();
        assert_eq!(grads[&inputs.positions.id()], Tensor::zeros(2, 3));
    }

    #[test]
    fn test_malformed_leaves_are_dimension_errors() {
        let graph = Graph::new();
        let inputs = AtomicInputs::new(&graph);
        inputs.positions.feed(Tensor::zeros(2, 2)).unwrap();
        inputs.cell.feed(Tensor::identity(3, 3)).unwrap();
        inputs.pbc.feed(Tensor::from_element(1, 3, 1.0)).unwrap();

        let cvs = [
            inputs.distance(0, 1, false, false).unwrap(),
            inputs.distance(0, 1, true, true).unwrap(),
            inputs.positions_of(Selection::All).unwrap(),
            inputs.scaled_positions(Selection::All).unwrap(),
        ];
        for cv in cvs {
            assert!(
                matches!(cv.value(), Err(EmetaError::DimensionMismatch { .. })),
                "{}",
                cv.describe()
            );
        }

        // A context can substitute a malformed cell as well.
        let atoms = triclinic();
        let mut context = inputs.context(&atoms);
        context.insert(inputs.cell.id(), Tensor::identity(2, 3));
        let wrapped = inputs.distance(0, 1, true, false).unwrap();
        assert!(matches!(
            wrapped.evaluate(Some(&context)),
            Err(EmetaError::DimensionMismatch { .. })
        ));
        let cell = inputs.cell_rows(Selection::All).unwrap();
        assert!(cell.evaluate(Some(&context)).is_err());
    }

    #[test]
    fn test_malformed_inputs_give_zero_gradients() {
        let positions = Tensor::from_element(2, 2, 1.0);
        let cell = Tensor::identity(3, 3);
        let pbc = Tensor::from_element(1, 3, 1.0);
        let grad = Tensor::from_element(1, 1, 1.0);

        let distance = Distance {
            i: 0,
            j: 1,
            mic: true,
            vector: false,
        };
        let inputs = [positions.clone(), cell.clone(), pbc];
        let grads = distance.backward(&grad, &inputs, &grad);
        assert_eq!(grads, vec![Tensor::zeros(2, 2), Tensor::zeros(3, 3), Tensor::zeros(1, 3)]);

        // Too few inputs for a wrapped distance.
        assert!(distance.forward(&[Tensor::zeros(2, 3)]).is_err());
        assert_eq!(distance.backward(&grad, &[], &grad), Vec::<Tensor>::new());

        let scaled = ScaledPositions {
            atoms: Selection::All,
        };
        let grads = scaled.backward(&Tensor::zeros(2, 3), &[positions.clone(), cell], &grad);
        assert_eq!(grads, vec![Tensor::zeros(2, 2), Tensor::zeros(3, 3)]);

        let selected = Positions { atoms: Selection::from(5_usize) };
        let grads = selected.backward(&Tensor::zeros(1, 3), &[Tensor::zeros(2, 3)], &grad);
        assert_eq!(grads, vec![Tensor::zeros(2, 3)]);
        assert_eq!(
            Cell { rows: Selection::All }.backward(&grad, &[positions], &grad),
            vec![Tensor::zeros(2, 2)]
        );
    }
}
