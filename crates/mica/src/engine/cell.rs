use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use super::declaration::{Constraint, Declaration};
use super::edge::{IncomingEdge, OutgoingEdge};
use super::event::{ListenerEntry, PropertyListener};
use super::transition::ActiveTransition;
use super::value::{EmptyValue, Value};

/// Identity of the element owning a property. Opaque to the engine; carried
/// only so constraint functions receive their evaluation context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ElementId(pub u64);

/// A single reactive cell.
///
/// Holds either an explicit value or a constraint-derived one, plus the edge
/// bookkeeping that keeps derived values consistent: incoming edges name the
/// cells this one reads, outgoing edges name the cells reading this one.
pub struct Property {
    pub owner: ElementId,
    pub declaration: Arc<dyn Declaration>,
    /// Never a true null; the canonical empty marker stands in for "nothing".
    pub value: Arc<dyn Value>,
    pub constraint: Option<Arc<dyn Constraint>>,

    pub valid: bool,
    /// The stored value may not reflect the latest upstream state.
    pub out_of_date: bool,
    /// Mid-recomputation marker; doubles as the cycle detector.
    pub evaluating: bool,
    pub initialized: bool,
    /// First-ever evaluation treats the value as pending unconditionally.
    pub evaluated_once: bool,

    /// Bumped at the start of each recompute; edges refreshed during the
    /// recompute carry the new generation, everything older is stale.
    pub generation: u64,

    pub incoming: SmallVec<[IncomingEdge; 4]>,
    pub outgoing: SmallVec<[OutgoingEdge; 4]>,

    pub listeners: Vec<ListenerEntry>,
    pub views: Vec<Weak<dyn PropertyListener>>,

    pub transition: Option<ActiveTransition>,
}

impl Property {
    pub fn new(owner: ElementId, declaration: Arc<dyn Declaration>) -> Self {
        Self {
            owner,
            declaration,
            value: EmptyValue::shared(),
            constraint: None,
            valid: true,
            out_of_date: true,
            evaluating: false,
            initialized: false,
            evaluated_once: false,
            generation: 0,
            incoming: SmallVec::new(),
            outgoing: SmallVec::new(),
            listeners: Vec::new(),
            views: Vec::new(),
            transition: None,
        }
    }
}
