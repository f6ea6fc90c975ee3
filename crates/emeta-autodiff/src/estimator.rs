//! Stateful estimator nodes.
//!
//! An estimator observes the value of a single input node over simulation
//! time and exposes the resulting estimate as the value of its own node.
//! Estimator nodes register themselves in `requires_update` so that the
//! driver loop can reach every estimator of a bias expression from its
//! root.

use crate::graph::{Graph, NodeId, NodeKind, Tensor};
use crate::var::Var;
use emeta_core::error::{EmetaError, Result};
use log::debug;
use std::any::Any;
use std::fmt::Debug;

/// Trait for estimators held by graph nodes.
pub trait Estimator: Debug + Any {
    /// Short name used when rendering expressions.
    fn name(&self) -> &str;

    /// Evaluates the estimate at query points `x`.
    fn evaluate(&self, x: &Tensor) -> Result<Tensor>;

    /// Vector-Jacobian product of [`Estimator::evaluate`] with respect to
    /// the query.
    fn vjp(&self, x: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        let _ = (x, grad_output);
        Err(EmetaError::not_implemented(format!("{}::vjp", self.name())))
    }

    /// Incorporates one observation.
    fn update(&mut self, x: &Tensor) -> Result<()>;

    /// Frozen estimators ignore updates.
    fn is_fixed(&self) -> bool {
        false
    }

    /// Upcast for downcasting to the concrete estimator.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete estimator.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Graph {
    /// Creates an estimator node observing `input`.
    pub fn estimator<'g, E: Estimator>(&'g self, input: Var<'g>, estimator: E) -> Result<Var<'g>> {
        input.assert_graph(self);
        let id = self.estimator_node(input.id(), Box::new(estimator))?;
        Ok(self.var(id))
    }

    /// Feeds the current value of an estimator's input to the estimator.
    ///
    /// The input is evaluated without context. Frozen estimators are left
    /// untouched. The estimator's dependants are invalidated afterwards.
    pub fn update_estimator(&self, id: NodeId) -> Result<()> {
        let input = self.with_node(id, |node| match (&node.kind, node.args.first()) {
            (NodeKind::Estimator(_), Some(arg)) => arg.node(),
            _ => None,
        })?;
        let input = input.ok_or_else(|| EmetaError::not_an_estimator(id))?;
        let x = self.evaluate(input, None)?;

        let updated = self.with_node_mut(id, |node| match &mut node.kind {
            NodeKind::Estimator(estimator) if !estimator.is_fixed() => {
                estimator.update(&x).map(|()| true)
            }
            _ => Ok(false),
        })??;
        if updated {
            debug!("updated estimator at {id}");
            self.invalidate_forward(id);
        }
        Ok(())
    }

    /// Updates every estimator reachable from `root`, in creation order.
    pub fn update(&self, root: NodeId) -> Result<()> {
        for id in self.requires_update(root)? {
            self.update_estimator(id)?;
        }
        Ok(())
    }

    /// Runs `f` on the concrete estimator held by node `id`.
    pub fn with_estimator<E: Estimator, R>(&self, id: NodeId, f: impl FnOnce(&E) -> R) -> Result<R> {
        self.with_node(id, |node| match &node.kind {
            NodeKind::Estimator(estimator) => estimator.as_any().downcast_ref::<E>().map(f),
            _ => None,
        })?
        .ok_or_else(|| EmetaError::not_an_estimator(id))
    }

    /// Runs `f` on the concrete estimator held by node `id`, mutably.
    ///
    /// The node's dependants are invalidated since the estimate may have
    /// changed.
    pub fn with_estimator_mut<E: Estimator, R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut E) -> R,
    ) -> Result<R> {
        let result = self
            .with_node_mut(id, |node| match &mut node.kind {
                NodeKind::Estimator(estimator) => {
                    estimator.as_any_mut().downcast_mut::<E>().map(f)
                }
                _ => None,
            })?
            .ok_or_else(|| EmetaError::not_an_estimator(id))?;
        self.invalidate_forward(id);
        Ok(result)
    }
}
