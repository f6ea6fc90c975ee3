//! Expression graph for collective variables and bias potentials.
//!
//! This module implements an arena of expression nodes addressed by
//! [`NodeId`]. Nodes are wired once, at construction, from nodes that
//! already exist, so the graph is always a DAG. Every node records its
//! direct children and parents as well as the transitive sets of parameter
//! and estimator nodes it reaches.
//!
//! Evaluation without a context memoizes each node's value; evaluation with
//! a context computes afresh and lets the context override the value of any
//! node it contains.

use crate::estimator::Estimator;
use crate::ops::{BinaryOp, Op, OpType};
use crate::param::ParamState;
use emeta_core::error::{EmetaError, Result};
use log::trace;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Unique identifier for nodes in the expression graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in its arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{}", self.0)
    }
}

pub use emeta_core::types::Tensor;

/// Mapping from node to substituted value.
pub type Context = HashMap<NodeId, Tensor>;

/// A constructor argument: either a node or an opaque constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Another node of the same graph
    Node(NodeId),
    /// A constant used as-is
    Const(Tensor),
}

impl Operand {
    /// The node id, if this operand is a node.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Const(_) => None,
        }
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Const(Tensor::from_element(1, 1, value))
    }
}

impl From<Tensor> for Operand {
    fn from(value: Tensor) -> Self {
        Self::Const(value)
    }
}

impl From<NodeId> for Operand {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

/// What a node computes.
#[derive(Debug)]
pub enum NodeKind {
    /// Named differentiable leaf with owned state
    Param(ParamState),
    /// Named leaf whose value is fed or supplied by the context
    Input {
        /// Name of the input
        name: String,
        /// Last fed value
        value: Option<Tensor>,
    },
    /// Operator over the node's arguments
    Op(Box<dyn Op>),
    /// Stateful estimator observing its single argument
    Estimator(Box<dyn Estimator>),
}

impl NodeKind {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        match self {
            Self::Param(state) => Ok(state.data.clone()),
            Self::Input { name, value } => value
                .clone()
                .ok_or_else(|| EmetaError::missing_input(name.clone())),
            Self::Op(op) => op.forward(inputs),
            Self::Estimator(estimator) => match inputs {
                [x] => estimator.evaluate(x),
                _ => Err(EmetaError::invalid_parameter(format!(
                    "{} observes exactly one input",
                    estimator.name()
                ))),
            },
        }
    }
}

/// A node in the expression graph.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier
    pub(crate) id: NodeId,
    /// What the node computes
    pub(crate) kind: NodeKind,
    /// Constructor arguments, in order
    pub(crate) args: Vec<Operand>,
    /// Direct children
    pub(crate) dependencies: BTreeSet<NodeId>,
    /// Direct parents
    pub(crate) dependants: BTreeSet<NodeId>,
    /// Reachable parameter nodes
    pub(crate) params: BTreeSet<NodeId>,
    /// Reachable estimator nodes
    pub(crate) requires_update: BTreeSet<NodeId>,
    /// Memoized value of a context-free evaluation
    pub(crate) value: Option<Tensor>,
}

impl Node {
    /// Checks if this node is a leaf (has no operation).
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Param(_) | NodeKind::Input { .. })
    }
}

/// The expression graph structure.
///
/// The graph owns every node and, through [`Graph::param`], the registry of
/// parameter names. Handles ([`crate::Var`]) borrow it, so it is torn down
/// in one piece.
#[derive(Debug, Default)]
pub struct Graph {
    /// All nodes in the graph, indexed by their ID
    pub(crate) nodes: RefCell<Vec<Node>>,
    /// Parameter names registered so far
    pub(crate) param_names: RefCell<HashMap<String, NodeId>>,
}

impl Graph {
    /// Creates a new empty expression graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the graph.
    pub fn num_nodes(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Adds a node, wiring edges and inheriting the children's closures.
    ///
    /// # Panics
    ///
    /// Panics if an argument refers to a node outside this graph.
    pub(crate) fn add_node(&self, kind: NodeKind, args: Vec<Operand>) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len());

        let dependencies: BTreeSet<NodeId> = args.iter().filter_map(Operand::node).collect();
        let mut params = BTreeSet::new();
        let mut requires_update = BTreeSet::new();
        for dep in &dependencies {
            let child = nodes
                .get_mut(dep.0)
                .unwrap_or_else(|| panic!("{dep} does not belong to this graph"));
            child.dependants.insert(id);
            params.extend(child.params.iter().copied());
            requires_update.extend(child.requires_update.iter().copied());
        }
        match kind {
            NodeKind::Param(_) => {
                params.insert(id);
            }
            NodeKind::Estimator(_) => {
                requires_update.insert(id);
            }
            _ => {}
        }

        nodes.push(Node {
            id,
            kind,
            args,
            dependencies,
            dependants: BTreeSet::new(),
            params,
            requires_update,
            value: None,
        });
        id
    }

    /// Creates a new node from an operation.
    pub fn apply_op(&self, op: Box<dyn Op>, args: Vec<Operand>) -> Result<NodeId> {
        self.check_operands(&args)?;
        Ok(self.add_node(NodeKind::Op(op), args))
    }

    /// Creates a named input leaf whose value is supplied per evaluation.
    pub fn input_node(&self, name: impl Into<String>) -> NodeId {
        self.add_node(
            NodeKind::Input {
                name: name.into(),
                value: None,
            },
            Vec::new(),
        )
    }

    /// Creates an estimator node observing `input`.
    pub fn estimator_node(&self, input: NodeId, estimator: Box<dyn Estimator>) -> Result<NodeId> {
        self.check_node(input)?;
        Ok(self.add_node(NodeKind::Estimator(estimator), vec![Operand::Node(input)]))
    }

    fn check_node(&self, id: NodeId) -> Result<()> {
        if id.0 < self.num_nodes() {
            Ok(())
        } else {
            Err(EmetaError::unknown_node(id))
        }
    }

    fn check_operands(&self, args: &[Operand]) -> Result<()> {
        args.iter()
            .filter_map(Operand::node)
            .try_for_each(|id| self.check_node(id))
    }

    /// Feeds a value to an input leaf and invalidates its dependants.
    pub fn feed(&self, id: NodeId, data: Tensor) -> Result<()> {
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = nodes.get_mut(id.0).ok_or_else(|| EmetaError::unknown_node(id))?;
            match &mut node.kind {
                NodeKind::Input { value, .. } => *value = Some(data),
                _ => {
                    return Err(EmetaError::invalid_parameter(format!(
                        "{id} is not an input node"
                    )))
                }
            }
        }
        self.invalidate_forward(id);
        Ok(())
    }

    /// Evaluates a node.
    ///
    /// Without a context the memoized value is returned, computing and
    /// caching it on first use. With a context the node is computed afresh
    /// (memos are neither read nor written) and every node present in the
    /// context takes its value from there instead of being evaluated.
    pub fn evaluate(&self, id: NodeId, context: Option<&Context>) -> Result<Tensor> {
        self.check_node(id)?;
        let mut scratch = HashMap::new();
        self.eval_node(id, context, &mut scratch)
    }

    pub(crate) fn eval_node(
        &self,
        id: NodeId,
        context: Option<&Context>,
        scratch: &mut HashMap<NodeId, Tensor>,
    ) -> Result<Tensor> {
        match context {
            Some(ctx) => {
                if let Some(value) = ctx.get(&id) {
                    return Ok(value.clone());
                }
                if let Some(value) = scratch.get(&id) {
                    return Ok(value.clone());
                }
            }
            None => {
                if let Some(value) = self.get_value(id) {
                    trace!("cache hit for {id}");
                    return Ok(value);
                }
            }
        }

        let args = self.with_node(id, |node| node.args.clone())?;
        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args {
            inputs.push(match arg {
                Operand::Node(child) => self.eval_node(*child, context, scratch)?,
                Operand::Const(value) => value.clone(),
            });
        }

        let result = self.with_node(id, |node| node.kind.forward(&inputs))??;

        match context {
            Some(_) => {
                scratch.insert(id, result.clone());
            }
            None => {
                trace!("cache fill for {id}");
                self.nodes.borrow_mut()[id.0].value = Some(result.clone());
            }
        }
        Ok(result)
    }

    /// Gets the memoized value of a node.
    pub fn get_value(&self, id: NodeId) -> Option<Tensor> {
        self.nodes.borrow().get(id.0).and_then(|n| n.value.clone())
    }

    /// Whether a node currently holds a memoized value.
    pub fn is_cached(&self, id: NodeId) -> bool {
        self.nodes
            .borrow()
            .get(id.0)
            .is_some_and(|n| n.value.is_some())
    }

    /// Clears the cache of a node and, transitively, of all its dependants.
    ///
    /// Call after a leaf changed: everything downstream is stale.
    pub fn invalidate_forward(&self, id: NodeId) {
        self.invalidate(id, |node| &node.dependants);
    }

    /// Clears the cache of a node and, transitively, of all its
    /// dependencies.
    pub fn invalidate_backward(&self, id: NodeId) {
        self.invalidate(id, |node| &node.dependencies);
    }

    fn invalidate(&self, id: NodeId, next: impl Fn(&Node) -> &BTreeSet<NodeId>) {
        let mut nodes = self.nodes.borrow_mut();
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = nodes.get_mut(current.0) {
                node.value = None;
                stack.extend(next(node).iter().copied());
            }
        }
    }

    /// Clears all memoized values in the graph.
    pub fn clear_values(&self) {
        for node in self.nodes.borrow_mut().iter_mut() {
            node.value = None;
        }
    }

    /// Runs `f` on a node.
    pub(crate) fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Result<R> {
        let nodes = self.nodes.borrow();
        let node = nodes.get(id.0).ok_or_else(|| EmetaError::unknown_node(id))?;
        Ok(f(node))
    }

    /// Runs `f` on a node, mutably.
    pub(crate) fn with_node_mut<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<R> {
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes
            .get_mut(id.0)
            .ok_or_else(|| EmetaError::unknown_node(id))?;
        Ok(f(node))
    }

    /// Constructor arguments of a node.
    pub fn args(&self, id: NodeId) -> Result<Vec<Operand>> {
        self.with_node(id, |n| n.args.clone())
    }

    /// Direct children of a node.
    pub fn dependencies(&self, id: NodeId) -> Result<BTreeSet<NodeId>> {
        self.with_node(id, |n| n.dependencies.clone())
    }

    /// Direct parents of a node.
    pub fn dependants(&self, id: NodeId) -> Result<BTreeSet<NodeId>> {
        self.with_node(id, |n| n.dependants.clone())
    }

    /// Parameter nodes reachable from a node.
    pub fn params(&self, id: NodeId) -> Result<BTreeSet<NodeId>> {
        self.with_node(id, |n| n.params.clone())
    }

    /// Estimator nodes reachable from a node, in creation order.
    pub fn requires_update(&self, id: NodeId) -> Result<BTreeSet<NodeId>> {
        self.with_node(id, |n| n.requires_update.clone())
    }

    /// Operator class of a node, if it holds an operation.
    pub fn op_type(&self, id: NodeId) -> Option<OpType> {
        self.with_node(id, |n| match &n.kind {
            NodeKind::Op(op) => Some(op.op_type()),
            _ => None,
        })
        .ok()
        .flatten()
    }

    /// Nodes reachable from `root`, children before parents.
    ///
    /// Nodes present in `context` are treated as leaves.
    pub fn topological_order(&self, root: NodeId, context: Option<&Context>) -> Vec<NodeId> {
        let nodes = self.nodes.borrow();
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        // (node, children pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            let substituted = context.is_some_and(|ctx| ctx.contains_key(&id));
            if substituted {
                continue;
            }
            if let Some(node) = nodes.get(id.0) {
                for dep in node.dependencies.iter().rev() {
                    if !visited.contains(dep) {
                        stack.push((*dep, false));
                    }
                }
            }
        }
        order
    }

    /// Renders a node as an infix expression.
    pub fn describe(&self, id: NodeId) -> String {
        let Ok((args, parent_op)) = self.with_node(id, |n| {
            let parent = match &n.kind {
                NodeKind::Op(op) => BinaryOp::from_op_type(op.op_type()),
                _ => None,
            };
            (n.args.clone(), parent)
        }) else {
            return format!("<{id}>");
        };

        let rendered: Vec<String> = args
            .iter()
            .enumerate()
            .map(|(position, arg)| match arg {
                Operand::Const(t) => describe_constant(t),
                Operand::Node(child) => {
                    let text = self.describe(*child);
                    let child_op = self.op_type(*child).and_then(BinaryOp::from_op_type);
                    match (parent_op, child_op) {
                        (Some(parent), Some(child)) if needs_parens(parent, child, position) => {
                            format!("({text})")
                        }
                        (None, Some(_)) if self.op_type(id) == Some(OpType::Neg) => {
                            format!("({text})")
                        }
                        (None, Some(_)) if self.op_type(id) == Some(OpType::Method) && position == 0 => {
                            format!("({text})")
                        }
                        _ => text,
                    }
                }
            })
            .collect();

        self.with_node(id, |n| match &n.kind {
            NodeKind::Param(state) => state.name.clone(),
            NodeKind::Input { name, .. } => name.clone(),
            NodeKind::Op(op) => op.describe(&rendered),
            NodeKind::Estimator(estimator) => {
                format!("{}({})", estimator.name(), rendered.join(", "))
            }
        })
        .unwrap_or_else(|_| format!("<{id}>"))
    }
}

fn needs_parens(parent: BinaryOp, child: BinaryOp, position: usize) -> bool {
    let precedence = |op: BinaryOp| match op {
        BinaryOp::Sum | BinaryOp::Sub => 1,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 2,
        BinaryOp::Pow => 3,
    };
    let (p, c) = (precedence(parent), precedence(child));
    c < p || (c == p && position > 0) || (parent == BinaryOp::Pow && child == BinaryOp::Pow)
}

fn describe_constant(t: &Tensor) -> String {
    if t.nrows() == 1 && t.ncols() == 1 {
        format!("{}", t[(0, 0)])
    } else {
        format!("Tensor({}x{})", t.nrows(), t.ncols())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Fold, Negate};
    use emeta_core::types::scalar;

    #[test]
    fn test_graph_creation() {
        let graph = Graph::new();
        assert_eq!(graph.num_nodes(), 0);
    }

    #[test]
    fn test_edges_are_mutual() {
        let graph = Graph::new();
        let x = graph.input_node("x");
        let y = graph.input_node("y");
        let s = graph
            .apply_op(
                Box::new(Fold::new(BinaryOp::Sum)),
                vec![Operand::Node(x), Operand::Node(y), Operand::from(1.0)],
            )
            .unwrap();

        assert_eq!(graph.dependencies(s).unwrap(), [x, y].into_iter().collect());
        assert!(graph.dependants(x).unwrap().contains(&s));
        assert!(graph.dependants(y).unwrap().contains(&s));
    }

    #[test]
    fn test_unknown_operand_rejected() {
        let graph = Graph::new();
        let err = graph
            .apply_op(Box::new(Negate), vec![Operand::Node(NodeId(7))])
            .unwrap_err();
        assert!(matches!(err, EmetaError::UnknownNode { .. }));
    }

    #[test]
    fn test_missing_input() {
        let graph = Graph::new();
        let x = graph.input_node("positions");
        let err = graph.evaluate(x, None).unwrap_err();
        assert!(matches!(err, EmetaError::MissingInput { .. }));
    }

    #[test]
    fn test_feed_and_memoize() {
        let graph = Graph::new();
        let x = graph.input_node("x");
        let n = graph.apply_op(Box::new(Negate), vec![Operand::Node(x)]).unwrap();

        graph.feed(x, scalar(2.0)).unwrap();
        assert!(!graph.is_cached(n));
        assert_eq!(graph.evaluate(n, None).unwrap()[(0, 0)], -2.0);
        assert!(graph.is_cached(n));

        graph.feed(x, scalar(3.0)).unwrap();
        assert!(!graph.is_cached(n));
        assert_eq!(graph.evaluate(n, None).unwrap()[(0, 0)], -3.0);
    }

    #[test]
    fn test_context_does_not_touch_cache() {
        let graph = Graph::new();
        let x = graph.input_node("x");
        let n = graph.apply_op(Box::new(Negate), vec![Operand::Node(x)]).unwrap();

        let mut ctx = Context::new();
        ctx.insert(x, scalar(5.0));
        assert_eq!(graph.evaluate(n, Some(&ctx)).unwrap()[(0, 0)], -5.0);
        assert!(!graph.is_cached(n));
        assert!(!graph.is_cached(x));
    }

    #[test]
    fn test_invalidate_backward() {
        let graph = Graph::new();
        let x = graph.input_node("x");
        let n = graph.apply_op(Box::new(Negate), vec![Operand::Node(x)]).unwrap();
        graph.feed(x, scalar(1.0)).unwrap();
        graph.evaluate(n, None).unwrap();
        assert!(graph.is_cached(x));

        graph.invalidate_backward(n);
        assert!(!graph.is_cached(n));
        assert!(!graph.is_cached(x));
    }

    #[test]
    fn test_topological_order() {
        let graph = Graph::new();
        let x = graph.input_node("x");
        let n = graph.apply_op(Box::new(Negate), vec![Operand::Node(x)]).unwrap();
        let m = graph
            .apply_op(
                Box::new(Fold::new(BinaryOp::Mul)),
                vec![Operand::Node(n), Operand::Node(x)],
            )
            .unwrap();

        let order = graph.topological_order(m, None);
        assert_eq!(order, vec![x, n, m]);

        let mut ctx = Context::new();
        ctx.insert(n, scalar(0.0));
        let order = graph.topological_order(m, Some(&ctx));
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&m));
    }
}
