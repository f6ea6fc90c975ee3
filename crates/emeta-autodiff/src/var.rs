//! Expression handles with operator overloading.
//!
//! [`Var`] is a copyable handle to a node of a [`Graph`]. Arithmetic on
//! handles (and on handles mixed with `f64` scalars, on either side) builds
//! new nodes. Combining a node with another node of the same operator class
//! merges their argument lists so that `(a + b) + (c + d)` becomes a single
//! four-argument sum.
//!
//! # Example
//!
//! ```
//! use emeta_autodiff::prelude::*;
//!
//! let graph = Graph::new();
//! let x = graph.param("x", Tensor::from_element(1, 1, 2.0)).unwrap().var();
//! let y = graph.input("y");
//! y.feed(Tensor::from_element(1, 1, 3.0)).unwrap();
//!
//! let z = (x + y) + (x * 2.0);
//! assert_eq!(z.value().unwrap()[(0, 0)], 9.0);
//! assert_eq!(z.describe(), "x + y + x*2");
//! ```

use crate::backward::GradientMap;
use crate::graph::{Context, Graph, NodeId, NodeKind, Operand, Tensor};
use crate::ops::{BinaryOp, Fold, Method, Negate, Op};
use emeta_core::error::Result;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

/// Handle to a node of an expression graph.
#[derive(Clone, Copy)]
pub struct Var<'g> {
    graph: &'g Graph,
    id: NodeId,
}

impl Graph {
    /// Wraps a node id into a handle.
    pub fn var(&self, id: NodeId) -> Var<'_> {
        Var { graph: self, id }
    }

    /// Creates a named input leaf.
    pub fn input(&self, name: impl Into<String>) -> Var<'_> {
        let id = self.input_node(name);
        self.var(id)
    }

    /// Creates a node applying a custom operation to `args`.
    pub fn apply<O: Op + 'static>(&self, op: O, args: Vec<Operand>) -> Result<Var<'_>> {
        let id = self.apply_op(Box::new(op), args)?;
        Ok(self.var(id))
    }
}

impl<'g> Var<'g> {
    /// Node id of this handle.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The graph owning the node.
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Panics if this handle belongs to a different graph.
    pub(crate) fn assert_graph(&self, graph: &Graph) {
        assert!(
            std::ptr::eq(self.graph, graph),
            "cannot combine nodes of different graphs"
        );
    }

    /// Evaluates the node, see [`Graph::evaluate`].
    pub fn evaluate(&self, context: Option<&Context>) -> Result<Tensor> {
        self.graph.evaluate(self.id, context)
    }

    /// Evaluates the node without context, using the memoized value.
    pub fn value(&self) -> Result<Tensor> {
        self.evaluate(None)
    }

    /// Feeds a value to an input leaf.
    pub fn feed(&self, value: Tensor) -> Result<()> {
        self.graph.feed(self.id, value)
    }

    /// Renders the expression rooted at this node.
    pub fn describe(&self) -> String {
        self.graph.describe(self.id)
    }

    /// Runs a backward pass without context, accumulating into parameters.
    pub fn backward(&self) -> Result<GradientMap> {
        self.graph.backward(self.id, None)
    }

    /// Runs a backward pass with context, accumulating into parameters.
    pub fn backward_with(&self, context: &Context) -> Result<GradientMap> {
        self.graph.backward(self.id, Some(context))
    }

    /// Updates every estimator reachable from this node.
    pub fn update(&self) -> Result<()> {
        self.graph.update(self.id)
    }

    /// Clears this node's memo and those of all its dependants.
    pub fn invalidate_forward(&self) {
        self.graph.invalidate_forward(self.id);
    }

    /// Clears this node's memo and those of all its dependencies.
    pub fn invalidate_backward(&self) {
        self.graph.invalidate_backward(self.id);
    }

    /// Parameter nodes reachable from this node.
    pub fn params(&self) -> Vec<NodeId> {
        self.graph
            .params(self.id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of constructor arguments of this node.
    pub fn num_args(&self) -> usize {
        self.graph.args(self.id).map_or(0, |args| args.len())
    }

    /// Deferred method call resolved against the method registry.
    ///
    /// Fails with `UnknownMethod` if `name` is not registered, or with
    /// `InvalidParameter` if the arguments do not fit the method.
    pub fn attr(&self, name: &str, args: &[Operand]) -> Result<Var<'g>> {
        let (method, extra) = Method::resolve(name, args)?;
        let mut node_args = vec![Operand::Node(self.id)];
        node_args.extend(extra);
        self.graph.apply(method, node_args)
    }

    fn method(&self, method: Method) -> Var<'g> {
        let id = self
            .graph
            .add_node(NodeKind::Op(Box::new(method)), vec![Operand::Node(self.id)]);
        self.graph.var(id)
    }

    /// Elementwise exponential.
    pub fn exp(&self) -> Var<'g> {
        self.method(Method::Exp)
    }

    /// Elementwise natural logarithm.
    pub fn ln(&self) -> Var<'g> {
        self.method(Method::Log)
    }

    /// Elementwise square root.
    pub fn sqrt(&self) -> Var<'g> {
        self.method(Method::Sqrt)
    }

    /// Elementwise absolute value.
    pub fn abs(&self) -> Var<'g> {
        self.method(Method::Abs)
    }

    /// Elementwise sine.
    pub fn sin(&self) -> Var<'g> {
        self.method(Method::Sin)
    }

    /// Elementwise cosine.
    pub fn cos(&self) -> Var<'g> {
        self.method(Method::Cos)
    }

    /// Elementwise hyperbolic tangent.
    pub fn tanh(&self) -> Var<'g> {
        self.method(Method::Tanh)
    }

    /// Elementwise square.
    pub fn square(&self) -> Var<'g> {
        self.method(Method::Square)
    }

    /// Sum of all elements, or along `axis` (0: columns, 1: rows).
    pub fn sum(&self, axis: Option<usize>) -> Var<'g> {
        self.method(Method::Sum(axis))
    }

    /// Mean of all elements, or along `axis`.
    pub fn mean(&self, axis: Option<usize>) -> Var<'g> {
        self.method(Method::Mean(axis))
    }

    /// Euclidean norm of all elements, or along `axis`.
    pub fn norm(&self, axis: Option<usize>) -> Var<'g> {
        self.method(Method::Norm(axis))
    }

    /// Matrix transpose.
    pub fn transpose(&self) -> Var<'g> {
        self.method(Method::Transpose)
    }

    /// Selects row `index`.
    pub fn row(&self, index: usize) -> Var<'g> {
        self.method(Method::Row(index))
    }

    /// Matrix product.
    pub fn matmul(&self, other: impl Into<Operand>) -> Var<'g> {
        let id = self.graph.add_node(
            NodeKind::Op(Box::new(Method::MatMul)),
            vec![Operand::Node(self.id), other.into()],
        );
        self.graph.var(id)
    }

    /// Elementwise power.
    pub fn pow(&self, exponent: impl Into<Operand>) -> Var<'g> {
        binary_op(self.graph, Operand::Node(self.id), exponent.into(), BinaryOp::Pow)
    }
}

/// Builds `lhs op rhs`, merging argument lists of same-class operands.
///
/// The left operand is always merged so that left folds are preserved.
/// The right operand is merged only for associative operators.
fn binary_op<'g>(graph: &'g Graph, lhs: Operand, rhs: Operand, op: BinaryOp) -> Var<'g> {
    let same_class = |operand: &Operand| {
        operand
            .node()
            .filter(|id| graph.op_type(*id) == Some(op.op_type()))
    };
    let expand = |id: NodeId| graph.args(id).unwrap_or_else(|_| vec![Operand::Node(id)]);

    let mut args = Vec::new();
    match same_class(&lhs) {
        Some(id) => args.extend(expand(id)),
        None => args.push(lhs),
    }
    match same_class(&rhs) {
        Some(id) if op.is_associative() => args.extend(expand(id)),
        _ => args.push(rhs),
    }

    let id = graph.add_node(NodeKind::Op(Box::new(Fold::new(op))), args);
    graph.var(id)
}

impl fmt::Debug for Var<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var").field("id", &self.id).finish()
    }
}

impl fmt::Display for Var<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<Var<'_>> for Operand {
    fn from(var: Var<'_>) -> Self {
        Operand::Node(var.id)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<'g> $trait<Var<'g>> for Var<'g> {
            type Output = Var<'g>;

            fn $method(self, rhs: Var<'g>) -> Var<'g> {
                rhs.assert_graph(self.graph);
                binary_op(self.graph, self.into(), rhs.into(), $op)
            }
        }

        impl<'g> $trait<f64> for Var<'g> {
            type Output = Var<'g>;

            fn $method(self, rhs: f64) -> Var<'g> {
                binary_op(self.graph, self.into(), rhs.into(), $op)
            }
        }

        impl<'g> $trait<Var<'g>> for f64 {
            type Output = Var<'g>;

            fn $method(self, rhs: Var<'g>) -> Var<'g> {
                binary_op(rhs.graph, self.into(), rhs.into(), $op)
            }
        }

        impl<'g> $trait<&Tensor> for Var<'g> {
            type Output = Var<'g>;

            fn $method(self, rhs: &Tensor) -> Var<'g> {
                binary_op(self.graph, self.into(), rhs.clone().into(), $op)
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Sum);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);
impl_binary_op!(Rem, rem, BinaryOp::Mod);

impl<'g> Neg for Var<'g> {
    type Output = Var<'g>;

    fn neg(self) -> Var<'g> {
        let id = self
            .graph
            .add_node(NodeKind::Op(Box::new(Negate)), vec![Operand::Node(self.id)]);
        self.graph.var(id)
    }
}
