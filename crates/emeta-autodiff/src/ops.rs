//! Operations for the expression graph.
//!
//! This module defines the operator kinds a node can hold, including their
//! forward and backward computations: the n-ary arithmetic folds built by
//! operator overloading, negation, and the method registry used by
//! attribute access.

use crate::broadcast::{broadcast_binary, reduce_to_shape, unbroadcast, zip_with};
use crate::graph::{Operand, Tensor};
use emeta_core::error::{EmetaError, Result};
use emeta_core::types::{shape_string, to_scalar};
use log::warn;
use nalgebra::DMatrix;
use std::fmt::Debug;

/// Trait for operations in the expression graph.
pub trait Op: Debug {
    /// Performs the forward computation.
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor>;

    /// Computes the gradient with respect to each input.
    ///
    /// # Arguments
    /// * `grad_output` - The gradient flowing from the output
    /// * `inputs` - The input values used in the forward pass
    /// * `output` - The output value from the forward pass
    ///
    /// # Returns
    /// A vector of gradients, one for each input
    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], output: &Tensor) -> Vec<Tensor>;

    /// Returns the name of this operation.
    fn name(&self) -> &str;

    /// Operator class, used to flatten chains of the same operator.
    fn op_type(&self) -> OpType {
        OpType::Custom
    }

    /// Renders the operation given its rendered arguments.
    fn describe(&self, args: &[String]) -> String {
        format!("{}({})", self.name(), args.join(", "))
    }
}

/// Enumeration of operation types for easier matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// N-ary addition
    Sum,
    /// Left-folded subtraction
    Sub,
    /// N-ary multiplication
    Mul,
    /// Left-folded division
    Div,
    /// Left-folded floored modulo
    Mod,
    /// Left-folded power
    Pow,
    /// Unary negation
    Neg,
    /// Registered method call
    Method,
    /// Any other operation, such as collective variables
    Custom,
}

/// The elementwise binary operators reachable through overloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `a + b`
    Sum,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `a - b*floor(a/b)`
    Mod,
    /// `a^b`
    Pow,
}

impl BinaryOp {
    /// Applies the operator to two numbers.
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Mod => a - b * (a / b).floor(),
            Self::Pow => a.powf(b),
        }
    }

    /// Partial derivatives `(∂out/∂a, ∂out/∂b)` at `(a, b)` with output `out`.
    fn partials(self, a: f64, b: f64, out: f64) -> (f64, f64) {
        match self {
            Self::Sum => (1.0, 1.0),
            Self::Sub => (1.0, -1.0),
            Self::Mul => (b, a),
            Self::Div => (1.0 / b, -a / (b * b)),
            Self::Mod => (1.0, -(a / b).floor()),
            Self::Pow => {
                let da = if b == 0.0 { 0.0 } else { b * a.powf(b - 1.0) };
                let db = if a > 0.0 { out * a.ln() } else { 0.0 };
                (da, db)
            }
        }
    }

    /// Whether `x op (y op z) == (x op y) op z`, which allows merging the
    /// right operand's arguments as well as the left one's.
    pub fn is_associative(self) -> bool {
        matches!(self, Self::Sum | Self::Mul)
    }

    /// Infix symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Sum => " + ",
            Self::Sub => " - ",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }

    /// Corresponding operator class.
    pub fn op_type(self) -> OpType {
        match self {
            Self::Sum => OpType::Sum,
            Self::Sub => OpType::Sub,
            Self::Mul => OpType::Mul,
            Self::Div => OpType::Div,
            Self::Mod => OpType::Mod,
            Self::Pow => OpType::Pow,
        }
    }

    /// Inverse of [`BinaryOp::op_type`].
    pub fn from_op_type(op_type: OpType) -> Option<Self> {
        match op_type {
            OpType::Sum => Some(Self::Sum),
            OpType::Sub => Some(Self::Sub),
            OpType::Mul => Some(Self::Mul),
            OpType::Div => Some(Self::Div),
            OpType::Mod => Some(Self::Mod),
            OpType::Pow => Some(Self::Pow),
            _ => None,
        }
    }
}

/// N-ary left fold of a binary operator: `((x0 op x1) op x2) ...`.
#[derive(Debug, Clone)]
pub struct Fold {
    /// Operator applied between consecutive arguments.
    pub op: BinaryOp,
}

impl Fold {
    /// Creates a fold of the given operator.
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }

    fn partial_results(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut partial = Vec::with_capacity(inputs.len());
        let mut acc = inputs
            .first()
            .cloned()
            .ok_or_else(|| EmetaError::invalid_parameter(format!("{} has no arguments", self.name())))?;
        partial.push(acc.clone());
        for next in &inputs[1..] {
            acc = zip_with(&acc, next, |a, b| self.op.apply(a, b))?;
            partial.push(acc.clone());
        }
        Ok(partial)
    }
}

impl Op for Fold {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        if inputs.is_empty() {
            return Err(EmetaError::invalid_parameter(format!(
                "{} requires at least one argument",
                self.name()
            )));
        }
        let mut partial = self.partial_results(inputs)?;
        Ok(partial.pop().unwrap_or_else(|| inputs[0].clone()))
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        let mut grads = vec![Tensor::zeros(0, 0); inputs.len()];
        let partial = match self.partial_results(inputs) {
            Ok(partial) => partial,
            Err(err) => {
                warn!("{}: dropping gradient, forward replay failed: {err}", self.name());
                return inputs.iter().map(|x| Tensor::zeros(x.nrows(), x.ncols())).collect();
            }
        };

        // Walk the fold backwards: `g` is the gradient of partial[k].
        let mut g = grad_output.clone();
        for k in (1..inputs.len()).rev() {
            let lhs = &partial[k - 1];
            let rhs = &inputs[k];
            let out = &partial[k];
            let b = match broadcast_binary(lhs, rhs) {
                Ok(b) => b,
                Err(err) => {
                    warn!("{}: dropping gradient of argument {k}: {err}", self.name());
                    for (grad, input) in grads.iter_mut().zip(inputs).take(k + 1) {
                        *grad = Tensor::zeros(input.nrows(), input.ncols());
                    }
                    return grads;
                }
            };
            let [a_full, b_full] = &b.tensors;
            let mut ga = Tensor::zeros(out.nrows(), out.ncols());
            let mut gb = Tensor::zeros(out.nrows(), out.ncols());
            for i in 0..out.nrows() {
                for j in 0..out.ncols() {
                    let (da, db) = self.op.partials(a_full[(i, j)], b_full[(i, j)], out[(i, j)]);
                    ga[(i, j)] = g[(i, j)] * da;
                    gb[(i, j)] = g[(i, j)] * db;
                }
            }
            grads[k] = unbroadcast(&gb, &b.broadcast_info[1]);
            g = unbroadcast(&ga, &b.broadcast_info[0]);
        }
        grads[0] = reduce_to_shape(&g, inputs[0].shape());
        grads
    }

    fn name(&self) -> &str {
        match self.op {
            BinaryOp::Sum => "Sum",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
            BinaryOp::Mod => "Mod",
            BinaryOp::Pow => "Pow",
        }
    }

    fn op_type(&self) -> OpType {
        self.op.op_type()
    }

    fn describe(&self, args: &[String]) -> String {
        args.join(self.op.symbol())
    }
}

/// Negation operation.
#[derive(Debug, Clone)]
pub struct Negate;

impl Op for Negate {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        expect_arity(self, inputs, 1)?;
        Ok(-&inputs[0])
    }

    fn backward(&self, grad_output: &Tensor, _inputs: &[Tensor], _output: &Tensor) -> Vec<Tensor> {
        vec![-grad_output]
    }

    fn name(&self) -> &str {
        "Neg"
    }

    fn op_type(&self) -> OpType {
        OpType::Neg
    }

    fn describe(&self, args: &[String]) -> String {
        format!("-{}", args.join(", "))
    }
}

/// Methods reachable through attribute access on a node.
///
/// Attribute access resolves a method name against this registry when the
/// node is built; evaluation then applies the method to the receiver's
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Elementwise exponential.
    Exp,
    /// Elementwise natural logarithm.
    Log,
    /// Elementwise square root.
    Sqrt,
    /// Elementwise absolute value.
    Abs,
    /// Elementwise sine.
    Sin,
    /// Elementwise cosine.
    Cos,
    /// Elementwise hyperbolic tangent.
    Tanh,
    /// Elementwise square.
    Square,
    /// Sum of all elements (1×1), or along an axis.
    Sum(Option<usize>),
    /// Mean of all elements (1×1), or along an axis.
    Mean(Option<usize>),
    /// Euclidean norm of all elements (1×1), or of each column (axis 0) or
    /// row (axis 1).
    Norm(Option<usize>),
    /// Matrix transpose.
    Transpose,
    /// Matrix product with a second argument.
    MatMul,
    /// Selects one row.
    Row(usize),
}

impl Method {
    /// Resolves a method name and its static arguments.
    ///
    /// Returns the method together with the dynamic arguments that become
    /// node inputs after the receiver.
    pub fn resolve(name: &str, args: &[Operand]) -> Result<(Self, Vec<Operand>)> {
        let unary = |method: Self| -> Result<(Self, Vec<Operand>)> {
            if args.is_empty() {
                Ok((method, Vec::new()))
            } else {
                Err(EmetaError::invalid_parameter(format!(
                    "method '{name}' takes no arguments, got {}",
                    args.len()
                )))
            }
        };
        let with_axis = |make: fn(Option<usize>) -> Self| -> Result<(Self, Vec<Operand>)> {
            match args {
                [] => Ok((make(None), Vec::new())),
                [arg] => {
                    let axis = const_index(name, arg)?;
                    if axis > 1 {
                        return Err(EmetaError::invalid_parameter(format!(
                            "method '{name}': axis must be 0 or 1, got {axis}"
                        )));
                    }
                    Ok((make(Some(axis)), Vec::new()))
                }
                _ => Err(EmetaError::invalid_parameter(format!(
                    "method '{name}' takes at most one axis argument"
                ))),
            }
        };

        match name {
            "exp" => unary(Self::Exp),
            "log" | "ln" => unary(Self::Log),
            "sqrt" => unary(Self::Sqrt),
            "abs" => unary(Self::Abs),
            "sin" => unary(Self::Sin),
            "cos" => unary(Self::Cos),
            "tanh" => unary(Self::Tanh),
            "square" => unary(Self::Square),
            "t" | "transpose" => unary(Self::Transpose),
            "sum" => with_axis(Self::Sum),
            "mean" => with_axis(Self::Mean),
            "norm" => with_axis(Self::Norm),
            "matmul" | "mm" => match args {
                [other] => Ok((Self::MatMul, vec![other.clone()])),
                _ => Err(EmetaError::invalid_parameter(format!(
                    "method '{name}' takes exactly one argument"
                ))),
            },
            "row" => match args {
                [arg] => Ok((Self::Row(const_index(name, arg)?), Vec::new())),
                _ => Err(EmetaError::invalid_parameter(format!(
                    "method '{name}' takes exactly one index"
                ))),
            },
            _ => Err(EmetaError::unknown_method(name)),
        }
    }

    /// Registry name of the method.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Abs => "abs",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Square => "square",
            Self::Sum(_) => "sum",
            Self::Mean(_) => "mean",
            Self::Norm(_) => "norm",
            Self::Transpose => "t",
            Self::MatMul => "matmul",
            Self::Row(_) => "row",
        }
    }

    fn is_elementwise(self) -> bool {
        matches!(
            self,
            Self::Exp
                | Self::Log
                | Self::Sqrt
                | Self::Abs
                | Self::Sin
                | Self::Cos
                | Self::Tanh
                | Self::Square
        )
    }

    fn elementwise(self, x: f64) -> Option<f64> {
        match self {
            Self::Exp => Some(x.exp()),
            Self::Log => Some(x.ln()),
            Self::Sqrt => Some(x.sqrt()),
            Self::Abs => Some(x.abs()),
            Self::Sin => Some(x.sin()),
            Self::Cos => Some(x.cos()),
            Self::Tanh => Some(x.tanh()),
            Self::Square => Some(x * x),
            _ => None,
        }
    }

    fn elementwise_derivative(self, x: f64, y: f64) -> f64 {
        match self {
            Self::Exp => y,
            Self::Log => 1.0 / x,
            Self::Sqrt => 0.5 / y,
            Self::Abs => x.signum(),
            Self::Sin => x.cos(),
            Self::Cos => -x.sin(),
            Self::Tanh => 1.0 - y * y,
            Self::Square => 2.0 * x,
            _ => 0.0,
        }
    }
}

impl Op for Method {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let arity = if matches!(self, Self::MatMul) { 2 } else { 1 };
        expect_arity(self, inputs, arity)?;
        if let Self::Sum(Some(axis)) | Self::Mean(Some(axis)) | Self::Norm(Some(axis)) = *self {
            if axis > 1 {
                return Err(EmetaError::invalid_parameter(format!(
                    "method '{}': axis must be 0 or 1, got {axis}",
                    self.method_name()
                )));
            }
        }
        let x = &inputs[0];

        if self.is_elementwise() {
            return Ok(x.map(|v| self.elementwise(v).unwrap_or(v)));
        }

        match *self {
            Self::Sum(None) => Ok(Tensor::from_element(1, 1, x.sum())),
            Self::Sum(Some(0)) => Ok(DMatrix::from_fn(1, x.ncols(), |_, j| x.column(j).sum())),
            Self::Sum(Some(_)) => Ok(DMatrix::from_fn(x.nrows(), 1, |i, _| x.row(i).sum())),
            Self::Mean(axis) => {
                let count = match axis {
                    None => x.len(),
                    Some(0) => x.nrows(),
                    Some(_) => x.ncols(),
                };
                let sum = Self::Sum(axis).forward(inputs)?;
                Ok(sum / count.max(1) as f64)
            }
            Self::Norm(None) => Ok(Tensor::from_element(1, 1, x.norm())),
            Self::Norm(Some(0)) => Ok(DMatrix::from_fn(1, x.ncols(), |_, j| x.column(j).norm())),
            Self::Norm(Some(_)) => Ok(DMatrix::from_fn(x.nrows(), 1, |i, _| x.row(i).norm())),
            Self::Transpose => Ok(x.transpose()),
            Self::MatMul => {
                let y = &inputs[1];
                if x.ncols() != y.nrows() {
                    return Err(EmetaError::dimension_mismatch(
                        format!("({}, _)", x.ncols()),
                        shape_string(y),
                    ));
                }
                Ok(x * y)
            }
            Self::Row(i) => {
                if i >= x.nrows() {
                    return Err(EmetaError::dimension_mismatch(
                        format!("more than {i} rows"),
                        shape_string(x),
                    ));
                }
                Ok(x.rows(i, 1).into_owned())
            }
            _ => Err(EmetaError::not_implemented(self.method_name())),
        }
    }

    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor], output: &Tensor) -> Vec<Tensor> {
        let x = &inputs[0];
        if self.is_elementwise() {
            let local = x.zip_map(output, |xv, yv| self.elementwise_derivative(xv, yv));
            return vec![grad_output.component_mul(&local)];
        }

        match *self {
            Self::Sum(_) => vec![DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
                broadcast_index(grad_output, i, j)
            })],
            Self::Mean(axis) => {
                let count = match axis {
                    None => x.len(),
                    Some(0) => x.nrows(),
                    Some(_) => x.ncols(),
                }
                .max(1) as f64;
                vec![DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
                    broadcast_index(grad_output, i, j) / count
                })]
            }
            Self::Norm(_) => vec![DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
                let norm = broadcast_index(output, i, j);
                if norm > 0.0 {
                    broadcast_index(grad_output, i, j) * x[(i, j)] / norm
                } else {
                    0.0
                }
            })],
            Self::Transpose => vec![grad_output.transpose()],
            Self::MatMul => {
                let y = &inputs[1];
                vec![grad_output * y.transpose(), x.transpose() * grad_output]
            }
            Self::Row(r) => {
                let mut grad = Tensor::zeros(x.nrows(), x.ncols());
                grad.rows_mut(r, 1).copy_from(grad_output);
                vec![grad]
            }
            _ => vec![Tensor::zeros(x.nrows(), x.ncols())],
        }
    }

    fn name(&self) -> &str {
        self.method_name()
    }

    fn op_type(&self) -> OpType {
        OpType::Method
    }

    fn describe(&self, args: &[String]) -> String {
        let receiver = args.first().map_or("", String::as_str);
        let rest = args.get(1..).unwrap_or(&[]).join(", ");
        let static_args = match self {
            Self::Sum(Some(a)) | Self::Mean(Some(a)) | Self::Norm(Some(a)) | Self::Row(a) => {
                a.to_string()
            }
            _ => rest,
        };
        format!("{receiver}.{}({static_args})", self.method_name())
    }
}

/// Reads `t[(i, j)]` treating 1-extent axes as broadcast.
fn broadcast_index(t: &Tensor, i: usize, j: usize) -> f64 {
    let ii = if t.nrows() == 1 { 0 } else { i };
    let jj = if t.ncols() == 1 { 0 } else { j };
    t[(ii, jj)]
}

fn const_index(method: &str, arg: &Operand) -> Result<usize> {
    let value = match arg {
        Operand::Const(t) => to_scalar(t),
        Operand::Node(_) => None,
    };
    match value {
        Some(v) if v >= 0.0 && v.fract() == 0.0 => Ok(v as usize),
        _ => Err(EmetaError::invalid_parameter(format!(
            "method '{method}' expects a constant non-negative integer argument"
        ))),
    }
}

fn expect_arity(op: &dyn Op, inputs: &[Tensor], arity: usize) -> Result<()> {
    if inputs.len() == arity {
        Ok(())
    } else {
        Err(EmetaError::invalid_parameter(format!(
            "{} requires exactly {arity} input(s), got {}",
            op.name(),
            inputs.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use emeta_core::types::scalar;

    #[test]
    fn test_fold_forward_left_to_right() {
        let op = Fold::new(BinaryOp::Sub);
        let inputs = vec![scalar(10.0), scalar(3.0), scalar(2.0)];
        assert_eq!(op.forward(&inputs).unwrap()[(0, 0)], 5.0);

        let op = Fold::new(BinaryOp::Pow);
        let inputs = vec![scalar(2.0), scalar(3.0), scalar(2.0)];
        assert_eq!(op.forward(&inputs).unwrap()[(0, 0)], 64.0);
    }

    #[test]
    fn test_fold_broadcasts_scalars() {
        let op = Fold::new(BinaryOp::Mul);
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let result = op.forward(&[m, scalar(2.0)]).unwrap();
        assert_eq!(result, DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 6.0, 8.0]));
    }

    #[test]
    fn test_fold_backward_sum_of_broadcast() {
        let op = Fold::new(BinaryOp::Sum);
        let m = DMatrix::from_element(2, 3, 1.0);
        let s = scalar(4.0);
        let out = op.forward(&[m.clone(), s.clone()]).unwrap();
        let grads = op.backward(&DMatrix::from_element(2, 3, 1.0), &[m, s], &out);
        assert_eq!(grads[0], DMatrix::from_element(2, 3, 1.0));
        assert_eq!(grads[1], scalar(6.0));
    }

    #[test]
    fn test_fold_backward_div_chain() {
        // f = (a / b) / c
        let op = Fold::new(BinaryOp::Div);
        let inputs = vec![scalar(6.0), scalar(2.0), scalar(3.0)];
        let out = op.forward(&inputs).unwrap();
        assert_relative_eq!(out[(0, 0)], 1.0);
        let grads = op.backward(&scalar(1.0), &inputs, &out);
        assert_relative_eq!(grads[0][(0, 0)], 1.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(grads[1][(0, 0)], -6.0 / (4.0 * 3.0), epsilon = 1e-12);
        assert_relative_eq!(grads[2][(0, 0)], -3.0 / 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mod_is_floored() {
        assert_eq!(BinaryOp::Mod.apply(-1.0, 3.0), 2.0);
        assert_eq!(BinaryOp::Mod.apply(5.5, 1.0), 0.5);
        assert_eq!(BinaryOp::Mod.apply(4.0, -3.0), -2.0);
    }

    #[test]
    fn test_negate() {
        let op = Negate;
        let x = DMatrix::from_row_slice(1, 2, &[1.0, -2.0]);
        assert_eq!(op.forward(&[x.clone()]).unwrap(), DMatrix::from_row_slice(1, 2, &[-1.0, 2.0]));
        let g = op.backward(&DMatrix::from_element(1, 2, 1.0), &[x.clone()], &x);
        assert_eq!(g[0], DMatrix::from_element(1, 2, -1.0));
    }

    #[test]
    fn test_method_resolution() {
        assert_eq!(Method::resolve("exp", &[]).unwrap().0, Method::Exp);
        assert_eq!(
            Method::resolve("sum", &[Operand::Const(scalar(1.0))]).unwrap().0,
            Method::Sum(Some(1))
        );
        assert!(matches!(
            Method::resolve("frobnicate", &[]),
            Err(EmetaError::UnknownMethod { .. })
        ));
        assert!(Method::resolve("exp", &[Operand::Const(scalar(1.0))]).is_err());
        assert!(Method::resolve("sum", &[Operand::Const(scalar(2.0))]).is_err());
    }

    #[test]
    fn test_method_rejects_bad_axis() {
        let x = DMatrix::from_element(2, 2, 1.0);
        for method in [Method::Sum(Some(2)), Method::Mean(Some(5)), Method::Norm(Some(3))] {
            assert!(matches!(
                method.forward(&[x.clone()]),
                Err(EmetaError::InvalidParameter { .. })
            ));
        }
        assert_eq!(Method::Sum(Some(1)).forward(&[x]).unwrap(), DMatrix::from_element(2, 1, 2.0));
    }

    #[test]
    fn test_fold_backward_incompatible_shapes_gives_zeros() {
        let op = Fold::new(BinaryOp::Sum);
        let inputs = vec![DMatrix::from_element(2, 3, 1.0), DMatrix::from_element(2, 2, 1.0)];
        assert!(op.forward(&inputs).is_err());
        let grads = op.backward(&DMatrix::from_element(2, 3, 1.0), &inputs, &inputs[0]);
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0], DMatrix::zeros(2, 3));
        assert_eq!(grads[1], DMatrix::zeros(2, 2));

        assert!(op.backward(&scalar(1.0), &[], &scalar(0.0)).is_empty());
    }

    #[test]
    fn test_method_forward() {
        let x = DMatrix::from_row_slice(2, 2, &[3.0, 4.0, 0.0, 0.0]);
        assert_eq!(Method::Norm(Some(1)).forward(&[x.clone()]).unwrap()[(0, 0)], 5.0);
        assert_eq!(Method::Sum(None).forward(&[x.clone()]).unwrap()[(0, 0)], 7.0);
        assert_eq!(Method::Sum(Some(0)).forward(&[x.clone()]).unwrap().shape(), (1, 2));
        assert_eq!(Method::Mean(None).forward(&[x.clone()]).unwrap()[(0, 0)], 1.75);
        assert_eq!(Method::Row(1).forward(&[x.clone()]).unwrap().shape(), (1, 2));
        assert_relative_eq!(
            Method::Exp.forward(&[scalar(1.0)]).unwrap()[(0, 0)],
            std::f64::consts::E,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_method_backward_norm() {
        let x = DMatrix::from_row_slice(1, 2, &[3.0, 4.0]);
        let out = Method::Norm(None).forward(&[x.clone()]).unwrap();
        let g = Method::Norm(None).backward(&scalar(1.0), &[x], &out);
        assert_relative_eq!(g[0][(0, 0)], 0.6, epsilon = 1e-12);
        assert_relative_eq!(g[0][(0, 1)], 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_matmul_shapes() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DMatrix::from_row_slice(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let result = Method::MatMul.forward(&[a.clone(), b]).unwrap();
        assert_eq!(result[(0, 0)], 58.0);
        assert!(Method::MatMul.forward(&[a.clone(), a]).is_err());
    }
}
