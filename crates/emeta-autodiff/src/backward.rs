//! Backward pass implementation for automatic differentiation.
//!
//! This module implements reverse-mode differentiation over the expression
//! DAG. Operators contribute through [`crate::Op::backward`] and estimator
//! nodes through [`crate::Estimator::vjp`]. Nodes substituted by the
//! context are treated as leaves.

use crate::broadcast::reduce_to_shape;
use crate::graph::{Context, Graph, NodeId, NodeKind, Operand, Tensor};
use emeta_core::error::{EmetaError, Result};
use std::collections::HashMap;

/// Type alias for gradient storage.
pub type GradientMap = HashMap<NodeId, Tensor>;

fn lookup<'a>(values: &'a HashMap<NodeId, Tensor>, id: NodeId) -> Result<&'a Tensor> {
    values.get(&id).ok_or_else(|| EmetaError::unknown_node(id))
}

/// Performs backward pass (backpropagation) through the graph.
///
/// # Arguments
/// * `graph` - The expression graph
/// * `root` - The node to compute gradients from
/// * `context` - Optional substitutions, as for [`Graph::evaluate`]
/// * `grad_output` - The initial gradient; ones shaped like the root if
///   `None`
///
/// # Returns
/// A map from node IDs to their gradients. Parameter state is not touched;
/// see [`Graph::backward`] for the accumulating variant.
pub fn backward(
    graph: &Graph,
    root: NodeId,
    context: Option<&Context>,
    grad_output: Option<Tensor>,
) -> Result<GradientMap> {
    let order = graph.topological_order(root, context);

    // Forward values of every reachable node.
    let mut values = HashMap::with_capacity(order.len());
    let mut scratch = HashMap::new();
    for &id in &order {
        values.insert(id, graph.eval_node(id, context, &mut scratch)?);
    }

    let root_value = lookup(&values, root)?;
    let seed = match grad_output {
        Some(g) if g.shape() != root_value.shape() => {
            return Err(EmetaError::dimension_mismatch(
                format!("{:?}", root_value.shape()),
                format!("{:?}", g.shape()),
            ))
        }
        Some(g) => g,
        None => Tensor::from_element(root_value.nrows(), root_value.ncols(), 1.0),
    };

    let mut gradients = GradientMap::new();
    gradients.insert(root, seed);

    for &id in order.iter().rev() {
        if context.is_some_and(|ctx| ctx.contains_key(&id)) {
            continue;
        }
        let Some(grad) = gradients.get(&id).cloned() else {
            continue;
        };

        let args = graph.args(id)?;
        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args {
            inputs.push(match arg {
                Operand::Node(child) => lookup(&values, *child)?.clone(),
                Operand::Const(value) => value.clone(),
            });
        }
        let output = lookup(&values, id)?;

        let input_grads = graph.with_node(id, |node| match &node.kind {
            NodeKind::Op(op) => Ok(Some(op.backward(&grad, &inputs, output))),
            NodeKind::Estimator(estimator) => match inputs.first() {
                Some(x) => estimator.vjp(x, &grad).map(|g| Some(vec![g])),
                None => Ok(None),
            },
            NodeKind::Param(_) | NodeKind::Input { .. } => Ok(None),
        })??;
        let Some(input_grads) = input_grads else {
            continue;
        };

        for (arg, input_grad) in args.iter().zip(input_grads) {
            let Operand::Node(child) = arg else {
                continue;
            };
            let shape = lookup(&values, *child)?.shape();
            let input_grad = if input_grad.shape() == shape {
                input_grad
            } else {
                reduce_to_shape(&input_grad, shape)
            };
            gradients
                .entry(*child)
                .and_modify(|g| *g += &input_grad)
                .or_insert(input_grad);
        }
    }

    Ok(gradients)
}

/// Computes the gradient of `root` with respect to the requested nodes.
pub fn grad(
    graph: &Graph,
    root: NodeId,
    wrt: &[NodeId],
    context: Option<&Context>,
) -> Result<GradientMap> {
    let all_grads = backward(graph, root, context, None)?;
    Ok(wrt
        .iter()
        .filter_map(|id| all_grads.get(id).map(|g| (*id, g.clone())))
        .collect())
}

/// Central finite-difference gradient of `sum(root)` with respect to the
/// value of node `wrt`.
///
/// The perturbed values are substituted through the context, so no memo
/// is touched.
pub fn numerical_gradient(
    graph: &Graph,
    root: NodeId,
    wrt: NodeId,
    context: Option<&Context>,
    epsilon: f64,
) -> Result<Tensor> {
    let mut ctx = context.cloned().unwrap_or_default();
    let base = match ctx.get(&wrt) {
        Some(value) => value.clone(),
        None => graph.evaluate(wrt, context)?,
    };

    let mut gradient = Tensor::zeros(base.nrows(), base.ncols());
    for i in 0..base.nrows() {
        for j in 0..base.ncols() {
            let mut plus = base.clone();
            plus[(i, j)] += epsilon;
            ctx.insert(wrt, plus);
            let f_plus = graph.evaluate(root, Some(&ctx))?.sum();

            let mut minus = base.clone();
            minus[(i, j)] -= epsilon;
            ctx.insert(wrt, minus);
            let f_minus = graph.evaluate(root, Some(&ctx))?.sum();

            gradient[(i, j)] = (f_plus - f_minus) / (2.0 * epsilon);
        }
    }
    Ok(gradient)
}

/// Checks gradients using finite differences.
///
/// # Returns
/// The maximum relative error between analytical and numerical gradients
pub fn check_gradients(
    graph: &Graph,
    root: NodeId,
    wrt: NodeId,
    context: Option<&Context>,
    epsilon: f64,
) -> Result<f64> {
    let analytical = grad(graph, root, &[wrt], context)?
        .remove(&wrt)
        .ok_or_else(|| EmetaError::unknown_node(wrt))?;
    let numerical = numerical_gradient(graph, root, wrt, context, epsilon)?;

    let max_error = analytical
        .iter()
        .zip(numerical.iter())
        .map(|(a, n)| {
            let denom = a.abs().max(n.abs()).max(1e-8);
            (a - n).abs() / denom
        })
        .fold(0.0_f64, f64::max);
    Ok(max_error)
}

impl Graph {
    /// Runs a backward pass from `root` and accumulates the gradients of
    /// reachable parameters that require them.
    pub fn backward(&self, root: NodeId, context: Option<&Context>) -> Result<GradientMap> {
        let gradients = backward(self, root, context, None)?;
        for id in self.params(root)? {
            if let Some(g) = gradients.get(&id) {
                self.with_param_mut(id, |state| state.accumulate(g))?;
            }
        }
        Ok(gradients)
    }
}
