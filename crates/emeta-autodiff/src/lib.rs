//! Lazy expression graphs for collective variables.
//!
//! This crate provides the expression engine used to define collective
//! variables and bias potentials. Expressions are built with ordinary Rust
//! operators on [`Var`] handles, evaluated lazily with memoization, and
//! differentiated in reverse mode.
//!
//! # Features
//!
//! - **Arena graph**: nodes addressed by [`NodeId`], with parent and child
//!   edges and transitive parameter/estimator sets maintained at
//!   construction
//! - **Memoized evaluation**: context-free evaluations are cached until a
//!   leaf changes; evaluations under a [`Context`] substitute arbitrary
//!   sub-expressions
//! - **Parameters**: named differentiable leaves with gradients and
//!   velocities
//! - **Estimators**: stateful nodes updated from the simulation loop
//!
//! # Architecture
//!
//! 1. **Graph**: owns the nodes and the parameter name registry
//! 2. **Operations**: forward and backward rules of each node kind
//! 3. **Backward**: reverse-mode accumulation over the DAG

pub mod backward;
pub mod broadcast;
pub mod estimator;
pub mod graph;
pub mod ops;
pub mod param;
pub mod var;

// Re-export key types
pub use backward::{backward, check_gradients, grad, numerical_gradient, GradientMap};
pub use broadcast::{broadcast_binary, reduce_to_shape, unbroadcast};
pub use estimator::Estimator;
pub use graph::{Context, Graph, Node, NodeId, NodeKind, Operand, Tensor};
pub use ops::{BinaryOp, Fold, Method, Negate, Op, OpType};
pub use param::{Param, ParamState};
pub use var::Var;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backward::{backward, GradientMap};
    pub use crate::estimator::Estimator;
    pub use crate::graph::{Context, Graph, NodeId, Operand, Tensor};
    pub use crate::ops::{Method, Op, OpType};
    pub use crate::param::Param;
    pub use crate::var::Var;
}
