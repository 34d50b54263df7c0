use std::sync::Arc;

use thiserror::Error;

use super::arena::PropertyId;
use super::cell::ElementId;
use super::graph::PropertyGraph;
use super::value::Value;

/// Outcome of delegating a write to the declaration.
pub enum Validated {
    /// The value, possibly corrected, to carry through the set pipeline.
    Accept(Arc<dyn Value>),
    /// Keep the prior value and flip the cell invalid.
    Reject,
}

/// Failure surfaced by a constraint function. Caught at the cell boundary;
/// the cell keeps its previous value for that cycle.
#[derive(Debug, Error)]
#[error("constraint evaluation failed: {message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// A derivation producing a cell's value from other cells.
///
/// Invoked mid-evaluation with the graph and the owning element as context;
/// `get` calls it makes are what grow the dependency edge store.
pub trait Constraint: Send + Sync {
    fn evaluate(
        &self,
        graph: &mut PropertyGraph,
        owner: ElementId,
    ) -> Result<Arc<dyn Value>, EvalError>;
}

impl<F> Constraint for F
where
    F: Fn(&mut PropertyGraph, ElementId) -> Result<Arc<dyn Value>, EvalError> + Send + Sync,
{
    fn evaluate(
        &self,
        graph: &mut PropertyGraph,
        owner: ElementId,
    ) -> Result<Arc<dyn Value>, EvalError> {
        self(graph, owner)
    }
}

/// Wrap a plain closure as a shared constraint function.
pub fn constraint<F>(function: F) -> Arc<dyn Constraint>
where
    F: Fn(&mut PropertyGraph, ElementId) -> Result<Arc<dyn Value>, EvalError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(function)
}

/// External descriptor supplying defaults, validation, and type metadata for
/// a cell. Owned by the language's declaration layer; the engine only calls
/// through this surface.
pub trait Declaration: Send + Sync {
    /// Validate (and possibly correct) a value about to be assigned.
    fn validate(&self, property: PropertyId, value: Arc<dyn Value>) -> Validated {
        let _ = property;
        Validated::Accept(value)
    }

    /// Default value used when initialization supplies nothing.
    fn default_value(&self, owner: ElementId) -> Option<Arc<dyn Value>> {
        let _ = owner;
        None
    }

    /// Default constraint function, mutually exclusive with `default_value`.
    fn value_function(&self) -> Option<Arc<dyn Constraint>> {
        None
    }

    /// Writes to this property are recorded while an accumulator is active.
    fn is_undoable(&self) -> bool {
        false
    }

    /// The cell points at its value but does not own it; structural
    /// listeners are not propagated into it.
    fn is_reference_only(&self) -> bool {
        false
    }

    /// Constant cells never change, so reads of them record no dependency
    /// edges.
    fn is_constant(&self) -> bool {
        false
    }

    fn is_static(&self) -> bool {
        false
    }

    /// Base-type identity for external type checks.
    fn base_type(&self) -> &'static str {
        "any"
    }
}
