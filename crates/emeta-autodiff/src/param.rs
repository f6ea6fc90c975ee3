//! Parameter nodes.
//!
//! A parameter is a named leaf holding differentiable state together with
//! its accumulated gradient and a velocity used by integrators. Names are
//! unique within a [`Graph`]. Every mutation invalidates the parameter's
//! transitive dependants.

use crate::graph::{Graph, NodeId, NodeKind, Tensor};
use crate::var::Var;
use emeta_core::error::{EmetaError, Result};
use std::fmt;

/// State owned by a parameter node.
#[derive(Debug, Clone)]
pub struct ParamState {
    /// Unique name
    pub(crate) name: String,
    /// Current value
    pub(crate) data: Tensor,
    /// Whether backward passes accumulate into `grad`
    pub(crate) requires_grad: bool,
    /// Accumulated gradient, cleared by every mutation
    pub(crate) grad: Option<Tensor>,
    /// Velocity, shaped like `data`
    pub(crate) dot: Tensor,
}

impl ParamState {
    fn new(name: String, data: Tensor) -> Self {
        let dot = Tensor::zeros(data.nrows(), data.ncols());
        Self {
            name,
            data,
            requires_grad: true,
            grad: None,
            dot,
        }
    }

    /// Adds a gradient contribution.
    pub(crate) fn accumulate(&mut self, grad: &Tensor) {
        if !self.requires_grad {
            return;
        }
        self.grad = Some(match self.grad.take() {
            Some(g) if g.shape() == grad.shape() => g + grad,
            _ => grad.clone(),
        });
    }
}

impl Graph {
    /// Creates a named parameter initialized to `data`.
    ///
    /// Fails with [`EmetaError::DuplicateParameter`] if a parameter with
    /// the same name already exists in this graph.
    pub fn param(&self, name: impl Into<String>, data: Tensor) -> Result<Param<'_>> {
        let name = name.into();
        if self.param_names.borrow().contains_key(&name) {
            return Err(EmetaError::duplicate_parameter(name));
        }
        let id = self.add_node(NodeKind::Param(ParamState::new(name.clone(), data)), Vec::new());
        self.param_names.borrow_mut().insert(name, id);
        Ok(Param {
            var: self.var(id),
        })
    }

    /// Looks up a parameter by name.
    pub fn param_by_name(&self, name: &str) -> Option<Param<'_>> {
        let id = self.param_names.borrow().get(name).copied()?;
        Some(Param {
            var: self.var(id),
        })
    }

    /// Wraps an existing parameter node.
    pub fn param_handle(&self, id: NodeId) -> Result<Param<'_>> {
        self.with_param(id, |_| ())?;
        Ok(Param {
            var: self.var(id),
        })
    }

    pub(crate) fn with_param<R>(&self, id: NodeId, f: impl FnOnce(&ParamState) -> R) -> Result<R> {
        self.with_node(id, |node| match &node.kind {
            NodeKind::Param(state) => Some(f(state)),
            _ => None,
        })?
        .ok_or_else(|| EmetaError::not_a_parameter(id))
    }

    pub(crate) fn with_param_mut<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut ParamState) -> R,
    ) -> Result<R> {
        self.with_node_mut(id, |node| match &mut node.kind {
            NodeKind::Param(state) => Some(f(state)),
            _ => None,
        })?
        .ok_or_else(|| EmetaError::not_a_parameter(id))
    }

    /// Replaces a parameter's value, resets its gradient and invalidates
    /// its dependants.
    pub fn set_param(&self, id: NodeId, data: Tensor, requires_grad: bool) -> Result<()> {
        self.with_param_mut(id, |state| {
            if state.dot.shape() != data.shape() {
                state.dot = Tensor::zeros(data.nrows(), data.ncols());
            }
            state.data = data;
            state.requires_grad = requires_grad;
            state.grad = None;
        })?;
        self.invalidate_forward(id);
        Ok(())
    }

    /// Adds `delta` to a parameter's value in place, clears its gradient
    /// and invalidates its dependants.
    pub fn add_param(&self, id: NodeId, delta: &Tensor) -> Result<()> {
        self.with_param_mut(id, |state| {
            if state.data.shape() != delta.shape() {
                return Err(EmetaError::dimension_mismatch(
                    format!("{:?}", state.data.shape()),
                    format!("{:?}", delta.shape()),
                ));
            }
            state.data += delta;
            state.grad = None;
            Ok(())
        })??;
        self.invalidate_forward(id);
        Ok(())
    }

    /// Negative accumulated gradient, or `None` before any backward pass.
    pub fn param_force(&self, id: NodeId) -> Result<Option<Tensor>> {
        self.with_param(id, |state| state.grad.as_ref().map(|g| -g))
    }

    /// Accumulated gradient of a parameter.
    pub fn param_grad(&self, id: NodeId) -> Result<Option<Tensor>> {
        self.with_param(id, |state| state.grad.clone())
    }

    /// Drops the accumulated gradient of every parameter reachable from
    /// `root`.
    pub fn zero_grad(&self, root: NodeId) -> Result<()> {
        for id in self.params(root)? {
            self.with_param_mut(id, |state| state.grad = None)?;
        }
        Ok(())
    }
}

/// Handle to a parameter node.
#[derive(Clone, Copy)]
pub struct Param<'g> {
    var: Var<'g>,
}

impl<'g> Param<'g> {
    /// The parameter as an expression operand.
    pub fn var(&self) -> Var<'g> {
        self.var
    }

    /// Node id of the parameter.
    pub fn id(&self) -> NodeId {
        self.var.id()
    }

    fn graph(&self) -> &'g Graph {
        self.var.graph()
    }

    /// Name of the parameter.
    pub fn name(&self) -> Result<String> {
        self.graph().with_param(self.id(), |state| state.name.clone())
    }

    /// Current value.
    pub fn value(&self) -> Result<Tensor> {
        self.graph().with_param(self.id(), |state| state.data.clone())
    }

    /// Whether backward passes accumulate gradients into this parameter.
    pub fn requires_grad(&self) -> Result<bool> {
        self.graph().with_param(self.id(), |state| state.requires_grad)
    }

    /// Replaces the value and resets the gradient.
    pub fn set(&self, data: Tensor, requires_grad: bool) -> Result<()> {
        self.graph().set_param(self.id(), data, requires_grad)
    }

    /// Adds `delta` to the value in place.
    pub fn add(&self, delta: &Tensor) -> Result<()> {
        self.graph().add_param(self.id(), delta)
    }

    /// Accumulated gradient.
    pub fn grad(&self) -> Result<Option<Tensor>> {
        self.graph().param_grad(self.id())
    }

    /// Negative accumulated gradient, or `None` before any backward pass.
    pub fn force(&self) -> Result<Option<Tensor>> {
        self.graph().param_force(self.id())
    }

    /// Velocity.
    pub fn dot(&self) -> Result<Tensor> {
        self.graph().with_param(self.id(), |state| state.dot.clone())
    }

    /// Replaces the velocity.
    pub fn set_dot(&self, dot: Tensor) -> Result<()> {
        self.graph().with_param_mut(self.id(), |state| state.dot = dot)
    }

    /// Adds `delta` to the velocity.
    pub fn add_dot(&self, delta: &Tensor) -> Result<()> {
        self.graph().with_param_mut(self.id(), |state| {
            if state.dot.shape() == delta.shape() {
                state.dot += delta;
                Ok(())
            } else {
                Err(EmetaError::dimension_mismatch(
                    format!("{:?}", state.dot.shape()),
                    format!("{:?}", delta.shape()),
                ))
            }
        })?
    }
}

impl fmt::Debug for Param<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("id", &self.id())
            .field("name", &self.name().ok())
            .finish()
    }
}

impl<'g> From<Param<'g>> for Var<'g> {
    fn from(param: Param<'g>) -> Self {
        param.var
    }
}
