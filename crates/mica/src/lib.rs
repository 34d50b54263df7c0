//! Mica object model: the reactive evaluation core of the Mica language.
//!
//! A graph of mutable value cells ("properties") that hold either an explicit
//! value or a constraint computed from other cells, with lazy pull-evaluation,
//! push-invalidation, cycle detection, weakly-held listeners, validation
//! through external declarations, and an undo journal.

pub mod engine;

pub use engine::arena::{PropertyArena, PropertyId};
pub use engine::cell::{ElementId, Property};
pub use engine::declaration::{constraint, Constraint, Declaration, EvalError, Validated};
pub use engine::edge::{IncomingEdge, OutgoingEdge};
pub use engine::event::{PropertyEvent, PropertyListener};
pub use engine::graph::{ActionTag, GraphError, PropertyGraph};
pub use engine::journal::{Accumulator, UndoRecord};
pub use engine::transition::{ActiveTransition, Transition};
pub use engine::value::{EmptyValue, Value};
