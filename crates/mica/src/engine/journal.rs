use std::sync::Arc;

use super::arena::PropertyId;
use super::value::Value;

/// One reversible write: the property and the value it held before.
pub struct UndoRecord {
    pub property: PropertyId,
    pub old_value: Arc<dyn Value>,
}

/// A batch of reversible writes, filled while it sits on the graph's
/// accumulator stack and replayed in reverse by `undo`.
#[derive(Default)]
pub struct Accumulator {
    pub records: Vec<UndoRecord>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
