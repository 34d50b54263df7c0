use std::sync::{Arc, Weak};

use super::arena::PropertyId;
use super::graph::PropertyGraph;
use super::value::Value;

/// Typed events delivered to a property's listeners.
#[derive(Clone, Debug)]
pub enum PropertyEvent {
    ValueWillChange { old: Arc<dyn Value>, new: Arc<dyn Value> },
    ValueChanged { old: Arc<dyn Value>, new: Arc<dyn Value> },
    ValidityChanged { valid: bool },
    MarkedOutOfDate,
    /// The ordered chain of properties involved, from the revisited property
    /// to the top of the evaluation stack.
    CycleDetected { chain: Vec<PropertyId> },
}

/// Observer of a property's event stream.
///
/// Listener invocation runs under a "notify" action tag, so `get` calls made
/// from inside `on_event` do not create dependency edges.
pub trait PropertyListener: Send + Sync {
    fn on_event(&self, graph: &mut PropertyGraph, property: PropertyId, event: &PropertyEvent);
}

/// Weakly-held listener registration. The property does not keep its
/// listeners alive; dead entries are pruned on dispatch.
pub struct ListenerEntry {
    pub listener: Weak<dyn PropertyListener>,
    /// Structural listeners are additionally deep-propagated into the
    /// current value's own sub-structure (unless the property is
    /// reference-only).
    pub structural: bool,
}
