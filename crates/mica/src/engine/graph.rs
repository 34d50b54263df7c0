use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use super::arena::{PropertyArena, PropertyId};
use super::cell::{ElementId, Property};
use super::declaration::{Constraint, Declaration, Validated};
use super::edge::{IncomingEdge, OutgoingEdge};
use super::event::{ListenerEntry, PropertyEvent, PropertyListener};
use super::journal::{Accumulator, UndoRecord};
use super::transition::{ActiveTransition, Transition};
use super::value::{EmptyValue, Value};

/// Marker on the action stack distinguishing why the engine is currently
/// calling out. Dependency edges are recorded only under `Evaluate`; `Notify`
/// and `Initialize` suppress edge creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionTag {
    Evaluate,
    Notify,
    Initialize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("property {0:?} does not resolve to a live cell")]
    Dangling(PropertyId),
    #[error("property {0:?} was already initialized")]
    AlreadyInitialized(PropertyId),
}

/// The property graph: an arena of reactive cells plus the evaluation-session
/// state shared by every call into it.
///
/// All algorithms are single-threaded by design; concurrent callers must
/// serialize access externally (the graph is `Send`, so a `Mutex` around it
/// is the expected arrangement). The evaluation, action-tag, and accumulator
/// stacks have push/pop lifetimes scoped to the enclosing call and are empty
/// at rest.
pub struct PropertyGraph {
    pub arena: PropertyArena,
    pub eval_stack: Vec<PropertyId>,
    pub action_stack: Vec<ActionTag>,
    pub accumulators: Vec<Accumulator>,
    now_ms: f64,
}

impl PropertyGraph {
    pub fn new() -> Self {
        Self {
            arena: PropertyArena::new(),
            eval_stack: Vec::new(),
            action_stack: Vec::new(),
            accumulators: Vec::new(),
            now_ms: 0.0,
        }
    }

    /// Construct a cell owned by `owner`. The cell holds the canonical empty
    /// marker until [`initialize`](Self::initialize) runs.
    pub fn create_property(
        &mut self,
        owner: ElementId,
        declaration: Arc<dyn Declaration>,
    ) -> PropertyId {
        self.arena.insert(Property::new(owner, declaration))
    }

    /// Retire a cell. Edges pointing at it become unresolvable handles and
    /// are pruned lazily by the next walk that touches them.
    pub fn release(&mut self, id: PropertyId) {
        self.arena.release(id);
    }

    /// Virtual time in milliseconds. Transitions interpolate against this;
    /// the engine never reads a wall clock.
    pub fn now(&self) -> f64 {
        self.now_ms
    }

    pub fn advance_clock(&mut self, delta_ms: f64) {
        self.now_ms += delta_ms;
    }

    // ---- initialization ----------------------------------------------------

    /// Runs exactly once per cell, choosing among supplied value, supplied
    /// function, declaration default value, or declaration default function.
    /// Runs under an "initialize" action tag so no dependency edges are
    /// recorded on its behalf.
    pub fn initialize(
        &mut self,
        id: PropertyId,
        value: Option<Arc<dyn Value>>,
        function: Option<Arc<dyn Constraint>>,
        transition: Option<Arc<dyn Transition>>,
    ) -> Result<(), GraphError> {
        let cell = self.arena.get_mut(id).ok_or(GraphError::Dangling(id))?;
        if cell.initialized {
            return Err(GraphError::AlreadyInitialized(id));
        }
        cell.initialized = true;
        let owner = cell.owner;
        let declaration = cell.declaration.clone();

        self.action_stack.push(ActionTag::Initialize);
        let result = if let Some(value) = value {
            self.assign(id, Some(value), transition, false).map(|_| ())
        } else if let Some(function) = function {
            self.install_constraint(id, function);
            Ok(())
        } else if let Some(default) = declaration.default_value(owner) {
            self.assign(id, Some(default), transition, false).map(|_| ())
        } else if let Some(function) = declaration.value_function() {
            self.install_constraint(id, function);
            Ok(())
        } else {
            self.assign(id, None, transition, false).map(|_| ())
        };
        self.action_stack.pop();
        result
    }

    fn install_constraint(&mut self, id: PropertyId, function: Arc<dyn Constraint>) {
        if let Some(cell) = self.arena.get_mut(id) {
            cell.constraint = Some(function);
            cell.out_of_date = true;
        }
    }

    // ---- reads -------------------------------------------------------------

    /// Read the cell's value, recording a dependency edge toward whichever
    /// property is currently mid-evaluation (unless this cell is declared
    /// constant). The canonical empty marker reads as `None`.
    pub fn get(&mut self, id: PropertyId) -> Option<Arc<dyn Value>> {
        if matches!(self.action_stack.last(), Some(ActionTag::Evaluate)) {
            if let Some(dependent) = self.eval_stack.last().copied() {
                if dependent != id {
                    let constant = self
                        .arena
                        .get(id)
                        .map(|cell| cell.declaration.is_constant())
                        .unwrap_or(true);
                    if !constant {
                        self.update_dependency(id, dependent);
                    }
                }
            }
        }
        self.evaluate(id);
        self.read_value(id)
    }

    /// Read without recording a dependency edge, for plumbing reads that must
    /// not pollute the graph.
    pub fn peek(&mut self, id: PropertyId) -> Option<Arc<dyn Value>> {
        self.evaluate(id);
        self.read_value(id)
    }

    fn read_value(&mut self, id: PropertyId) -> Option<Arc<dyn Value>> {
        let now_ms = self.now_ms;
        let cell = self.arena.get_mut(id)?;
        if let Some(active) = cell.transition.clone() {
            if active.timing.is_complete(now_ms) {
                cell.transition = None;
            } else {
                let value = cell
                    .value
                    .transitional_value(&*active.timing, &*active.start, now_ms);
                return (!value.is_nothing()).then_some(value);
            }
        }
        let value = cell.value.clone();
        (!value.is_nothing()).then_some(value)
    }

    // ---- evaluation --------------------------------------------------------

    /// Bring the cell up to date, recomputing through its constraint when an
    /// upstream change warrants it. Idempotent; returns whether a recompute
    /// happened.
    pub fn evaluate(&mut self, id: PropertyId) -> bool {
        let (evaluating, out_of_date) = match self.arena.get(id) {
            Some(cell) => (cell.evaluating, cell.out_of_date),
            None => return false,
        };

        // Re-entry while mid-recomputation: tolerated for the cell itself at
        // the top of the stack (self-read during the tail of its own write),
        // a cycle for anything deeper.
        if evaluating {
            if self.eval_stack.last().copied() != Some(id) {
                let chain = self.cycle_chain(id);
                debug!(?id, ?chain, "dependency cycle detected");
                self.notify(id, &PropertyEvent::CycleDetected { chain });
            }
            return false;
        }
        if !out_of_date {
            return false;
        }

        {
            let cell = self.arena.get_mut(id).expect("resolved above");
            cell.out_of_date = false;
            cell.evaluating = true;
        }
        self.eval_stack.push(id);
        self.action_stack.push(ActionTag::Evaluate);

        let (first, my_generation) = {
            let cell = self.arena.get(id).expect("resolved above");
            (!cell.evaluated_once, cell.generation)
        };
        let mut has_pending = first;
        if first {
            if let Some(cell) = self.arena.get_mut(id) {
                cell.evaluated_once = true;
            }
        } else {
            let sources: Vec<PropertyId> = self
                .arena
                .get(id)
                .map(|cell| cell.incoming.iter().map(|edge| edge.source).collect())
                .unwrap_or_default();
            for source in sources {
                if !self.arena.contains(source) {
                    // Source reclaimed; its half of the pair died with it.
                    if let Some(cell) = self.arena.get_mut(id) {
                        cell.incoming.retain(|edge| edge.source != source);
                    }
                    continue;
                }
                match self.outgoing_use_generation(source, id) {
                    Some(use_generation) if use_generation >= my_generation => {
                        self.evaluate(source);
                        has_pending |= self.take_pending(source, id);
                    }
                    // Not read last round, or pair lost: drop the edge.
                    _ => self.drop_edge_pair(source, id),
                }
            }
        }

        let constraint = self.arena.get(id).and_then(|cell| cell.constraint.clone());
        let mut recomputed = false;
        match constraint {
            Some(function) if has_pending => {
                let owner = self.arena.get(id).expect("resolved above").owner;
                let generation = {
                    let cell = self.arena.get_mut(id).expect("resolved above");
                    cell.generation += 1;
                    cell.generation
                };
                debug!(?id, generation, "recomputing constrained cell");
                let result = function.evaluate(self, owner);
                self.eval_stack.pop();
                self.action_stack.pop();
                if let Some(cell) = self.arena.get_mut(id) {
                    cell.evaluating = false;
                }
                match result {
                    Ok(value) => {
                        let _ = self.assign(id, Some(value), None, true);
                        recomputed = true;
                    }
                    Err(error) => {
                        warn!(?id, %error, "constraint failed, keeping previous value");
                    }
                }
            }
            _ => {
                self.eval_stack.pop();
                self.action_stack.pop();
                if let Some(cell) = self.arena.get_mut(id) {
                    cell.evaluating = false;
                }
            }
        }

        // Listener callbacks run by the assignment may have flipped the flag
        // mid-flight; the value they saw is the one we just computed.
        if let Some(cell) = self.arena.get_mut(id) {
            cell.out_of_date = false;
        }
        recomputed
    }

    fn cycle_chain(&self, id: PropertyId) -> Vec<PropertyId> {
        match self.eval_stack.iter().position(|&entry| entry == id) {
            Some(position) => self.eval_stack[position..].to_vec(),
            None => vec![id],
        }
    }

    // ---- dependency edges --------------------------------------------------

    /// Create or refresh the paired edge "dependent reads source". Refreshing
    /// bumps the pair's use-generation to the dependent's current generation,
    /// marking it used this round; edges left behind go stale and are pruned
    /// by the next walk.
    fn update_dependency(&mut self, source: PropertyId, dependent: PropertyId) {
        if !self.arena.contains(source) || !self.arena.contains(dependent) {
            return;
        }
        let dependent_generation = self
            .arena
            .get(dependent)
            .expect("resolved above")
            .generation;
        let known = self
            .arena
            .get(dependent)
            .expect("resolved above")
            .incoming
            .iter()
            .any(|edge| edge.source == source);
        if known {
            if let Some(cell) = self.arena.get_mut(source) {
                if let Some(edge) = cell
                    .outgoing
                    .iter_mut()
                    .find(|edge| edge.dependent == dependent)
                {
                    edge.use_generation = dependent_generation;
                    return;
                }
                // Incoming half without its pair: restore the invariant.
                cell.outgoing
                    .push(OutgoingEdge::new(dependent, dependent_generation));
            }
            return;
        }
        if let Some(cell) = self.arena.get_mut(dependent) {
            cell.incoming.push(IncomingEdge { source });
        }
        if let Some(cell) = self.arena.get_mut(source) {
            cell.outgoing
                .push(OutgoingEdge::new(dependent, dependent_generation));
        }
    }

    fn outgoing_use_generation(&self, source: PropertyId, dependent: PropertyId) -> Option<u64> {
        self.arena
            .get(source)?
            .outgoing
            .iter()
            .find(|edge| edge.dependent == dependent)
            .map(|edge| edge.use_generation)
    }

    fn take_pending(&mut self, source: PropertyId, dependent: PropertyId) -> bool {
        if let Some(cell) = self.arena.get_mut(source) {
            if let Some(edge) = cell
                .outgoing
                .iter_mut()
                .find(|edge| edge.dependent == dependent)
            {
                let pending = edge.pending;
                edge.pending = false;
                return pending;
            }
        }
        false
    }

    fn set_pending(&mut self, source: PropertyId, dependent: PropertyId) {
        if let Some(cell) = self.arena.get_mut(source) {
            if let Some(edge) = cell
                .outgoing
                .iter_mut()
                .find(|edge| edge.dependent == dependent)
            {
                edge.pending = true;
            }
        }
    }

    fn drop_edge_pair(&mut self, source: PropertyId, dependent: PropertyId) {
        if let Some(cell) = self.arena.get_mut(source) {
            cell.outgoing.retain(|edge| edge.dependent != dependent);
        }
        if let Some(cell) = self.arena.get_mut(dependent) {
            cell.incoming.retain(|edge| edge.source != source);
        }
    }

    /// Live direct sources of `id` (dead and stale edges skipped, nothing
    /// mutated).
    pub fn depends_on(&self, id: PropertyId) -> Vec<PropertyId> {
        let Some(cell) = self.arena.get(id) else { return Vec::new() };
        cell.incoming
            .iter()
            .filter(|edge| {
                self.arena.get(edge.source).is_some_and(|source| {
                    source
                        .outgoing
                        .iter()
                        .find(|out| out.dependent == id)
                        .is_some_and(|out| !out.is_stale_for(cell.generation))
                })
            })
            .map(|edge| edge.source)
            .collect()
    }

    /// Live direct dependents of `id`.
    pub fn dependents_of(&self, id: PropertyId) -> Vec<PropertyId> {
        let Some(cell) = self.arena.get(id) else { return Vec::new() };
        cell.outgoing
            .iter()
            .filter(|edge| {
                self.arena
                    .get(edge.dependent)
                    .is_some_and(|dependent| !edge.is_stale_for(dependent.generation))
            })
            .map(|edge| edge.dependent)
            .collect()
    }

    // ---- invalidation ------------------------------------------------------

    /// Force the cell stale and push staleness through its live dependents.
    pub fn touch(&mut self, id: PropertyId) -> Result<(), GraphError> {
        self.mark_out_of_date(id)
    }

    pub fn mark_out_of_date(&mut self, id: PropertyId) -> Result<(), GraphError> {
        if !self.arena.contains(id) {
            return Err(GraphError::Dangling(id));
        }
        let already = self.arena.get(id).expect("resolved above").out_of_date;
        if !already {
            self.arena.get_mut(id).expect("resolved above").out_of_date = true;
            self.notify(id, &PropertyEvent::MarkedOutOfDate);
        }
        self.propagate_out_of_date(id);
        Ok(())
    }

    /// Push-phase walk of the changed cell's dependents. No values are
    /// recomputed here; only staleness and per-edge "something changed
    /// upstream" bits move. The out-of-date flag doubles as the visited
    /// marker, so each dependent is invalidated at most once per change.
    fn propagate_out_of_date(&mut self, id: PropertyId) {
        let dependents: Vec<PropertyId> = self
            .arena
            .get(id)
            .map(|cell| cell.outgoing.iter().map(|edge| edge.dependent).collect())
            .unwrap_or_default();
        for dependent in dependents {
            if !self.arena.contains(dependent) {
                // Target reclaimed while we still pointed at it.
                if let Some(cell) = self.arena.get_mut(id) {
                    cell.outgoing.retain(|edge| edge.dependent != dependent);
                }
                continue;
            }
            let target_generation = self
                .arena
                .get(dependent)
                .expect("resolved above")
                .generation;
            let Some(use_generation) = self.outgoing_use_generation(id, dependent) else {
                continue;
            };
            if use_generation < target_generation {
                // Target no longer reads this cell.
                self.drop_edge_pair(id, dependent);
                continue;
            }
            self.set_pending(id, dependent);
            let already = self
                .arena
                .get(dependent)
                .expect("resolved above")
                .out_of_date;
            if !already {
                self.arena
                    .get_mut(dependent)
                    .expect("resolved above")
                    .out_of_date = true;
                self.notify(dependent, &PropertyEvent::MarkedOutOfDate);
                self.propagate_out_of_date(dependent);
            }
        }
    }

    // ---- writes ------------------------------------------------------------

    /// Explicit write: validate, assign, invalidate dependents, notify,
    /// journal. Returns whether the stored value changed.
    pub fn set(
        &mut self,
        id: PropertyId,
        value: Option<Arc<dyn Value>>,
        transition: Option<Arc<dyn Transition>>,
    ) -> Result<bool, GraphError> {
        self.assign(id, value, transition, false)
    }

    fn assign(
        &mut self,
        id: PropertyId,
        value: Option<Arc<dyn Value>>,
        transition: Option<Arc<dyn Transition>>,
        from_evaluate: bool,
    ) -> Result<bool, GraphError> {
        if !self.arena.contains(id) {
            return Err(GraphError::Dangling(id));
        }
        let supplied = value.unwrap_or_else(EmptyValue::shared);
        let declaration = self.arena.get(id).expect("resolved above").declaration.clone();

        let accepted = match declaration.validate(id, supplied) {
            Validated::Accept(accepted) => accepted,
            Validated::Reject => {
                let cell = self.arena.get_mut(id).expect("resolved above");
                let flipped = cell.valid;
                cell.valid = false;
                let observed = if flipped {
                    self.notify(id, &PropertyEvent::ValidityChanged { valid: false })
                } else {
                    self.live_listener_count(id)
                };
                if observed == 0 {
                    warn!(?id, "write rejected by declaration with no listener observing");
                }
                return Ok(false);
            }
        };

        let old = self.arena.get(id).expect("resolved above").value.clone();
        let changed = !old.is_equivalent_to(&*accepted);

        if changed {
            self.notify(
                id,
                &PropertyEvent::ValueWillChange { old: old.clone(), new: accepted.clone() },
            );

            let reference_only = declaration.is_reference_only();
            let structural = self.structural_listeners(id);
            if !reference_only {
                for listener in &structural {
                    old.propagate_listener(listener, false);
                }
            }

            if let Some(cell) = self.arena.get_mut(id) {
                cell.value = accepted.clone();
            }
            old.unregister_property(id);
            accepted.register_property(id);

            if !reference_only {
                for listener in &structural {
                    accepted.propagate_listener(listener, true);
                }
            }

            self.propagate_out_of_date(id);

            if let Some(timing) = transition {
                timing.reset(self.now_ms);
                if let Some(cell) = self.arena.get_mut(id) {
                    cell.transition = Some(ActiveTransition { start: old.clone(), timing });
                }
            }

            let event = PropertyEvent::ValueChanged { old: old.clone(), new: accepted.clone() };
            self.notify(id, &event);
            self.notify_views(id, &event);
        }

        let validity_flipped = self
            .arena
            .get_mut(id)
            .map(|cell| {
                let flipped = !cell.valid;
                cell.valid = true;
                flipped
            })
            .unwrap_or(false);
        if validity_flipped {
            self.notify(id, &PropertyEvent::ValidityChanged { valid: true });
        }

        if declaration.is_undoable() && !self.accumulators.is_empty() {
            let record = UndoRecord { property: id, old_value: old.duplicate() };
            if let Some(active) = self.accumulators.last_mut() {
                active.records.push(record);
            }
        }

        // A constrained cell goes stale again so the next read re-derives
        // consistently with what was just written. An external write also
        // primes a full recompute; a write-from-evaluate must not, or the
        // value just computed would immediately be recomputed away.
        if let Some(cell) = self.arena.get_mut(id) {
            if cell.constraint.is_some() {
                cell.out_of_date = true;
                if !from_evaluate {
                    cell.evaluated_once = false;
                }
            }
        }

        Ok(changed)
    }

    // ---- listeners and views ----------------------------------------------

    /// Register a weakly-held listener. Structural listeners are immediately
    /// deep-propagated into the current value (unless the cell is
    /// reference-only).
    pub fn add_listener(
        &mut self,
        id: PropertyId,
        listener: &Arc<dyn PropertyListener>,
        structural: bool,
    ) -> Result<(), GraphError> {
        if !self.arena.contains(id) {
            return Err(GraphError::Dangling(id));
        }
        let reference_only = {
            let cell = self.arena.get_mut(id).expect("resolved above");
            cell.listeners.push(ListenerEntry {
                listener: Arc::downgrade(listener),
                structural,
            });
            cell.declaration.is_reference_only()
        };
        if structural && !reference_only {
            let value = self.arena.get(id).expect("resolved above").value.clone();
            value.propagate_listener(listener, true);
        }
        Ok(())
    }

    pub fn remove_listener(
        &mut self,
        id: PropertyId,
        listener: &Arc<dyn PropertyListener>,
    ) -> Result<(), GraphError> {
        if !self.arena.contains(id) {
            return Err(GraphError::Dangling(id));
        }
        let target = Arc::downgrade(listener);
        let mut removed_structural = false;
        let reference_only = {
            let cell = self.arena.get_mut(id).expect("resolved above");
            cell.listeners.retain(|entry| {
                let matches = Weak::ptr_eq(&entry.listener, &target);
                if matches && entry.structural {
                    removed_structural = true;
                }
                !matches
            });
            cell.declaration.is_reference_only()
        };
        if removed_structural && !reference_only {
            let value = self.arena.get(id).expect("resolved above").value.clone();
            value.propagate_listener(listener, false);
        }
        Ok(())
    }

    /// Register a presentation-layer observer; views receive the
    /// value-changed stream only.
    pub fn add_view(
        &mut self,
        id: PropertyId,
        view: &Arc<dyn PropertyListener>,
    ) -> Result<(), GraphError> {
        let cell = self.arena.get_mut(id).ok_or(GraphError::Dangling(id))?;
        cell.views.push(Arc::downgrade(view));
        Ok(())
    }

    pub fn remove_view(
        &mut self,
        id: PropertyId,
        view: &Arc<dyn PropertyListener>,
    ) -> Result<(), GraphError> {
        let cell = self.arena.get_mut(id).ok_or(GraphError::Dangling(id))?;
        let target = Arc::downgrade(view);
        cell.views.retain(|entry| !Weak::ptr_eq(entry, &target));
        Ok(())
    }

    /// Dispatch to the cell's listeners under a "notify" action tag; returns
    /// how many live listeners received the event. Dead entries are pruned.
    fn notify(&mut self, id: PropertyId, event: &PropertyEvent) -> usize {
        let snapshot: Vec<Weak<dyn PropertyListener>> = match self.arena.get(id) {
            Some(cell) => cell.listeners.iter().map(|entry| entry.listener.clone()).collect(),
            None => return 0,
        };
        self.action_stack.push(ActionTag::Notify);
        let mut delivered = 0;
        for weak in snapshot {
            if let Some(listener) = weak.upgrade() {
                listener.on_event(self, id, event);
                delivered += 1;
            }
        }
        self.action_stack.pop();
        if let Some(cell) = self.arena.get_mut(id) {
            cell.listeners.retain(|entry| entry.listener.strong_count() > 0);
        }
        delivered
    }

    fn notify_views(&mut self, id: PropertyId, event: &PropertyEvent) {
        let snapshot: Vec<Weak<dyn PropertyListener>> = match self.arena.get(id) {
            Some(cell) => cell.views.clone(),
            None => return,
        };
        self.action_stack.push(ActionTag::Notify);
        for weak in snapshot {
            if let Some(view) = weak.upgrade() {
                view.on_event(self, id, event);
            }
        }
        self.action_stack.pop();
        if let Some(cell) = self.arena.get_mut(id) {
            cell.views.retain(|entry| entry.strong_count() > 0);
        }
    }

    fn structural_listeners(&self, id: PropertyId) -> Vec<Arc<dyn PropertyListener>> {
        self.arena
            .get(id)
            .map(|cell| {
                cell.listeners
                    .iter()
                    .filter(|entry| entry.structural)
                    .filter_map(|entry| entry.listener.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn live_listener_count(&self, id: PropertyId) -> usize {
        self.arena
            .get(id)
            .map(|cell| {
                cell.listeners
                    .iter()
                    .filter(|entry| entry.listener.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }

    // ---- undo journal ------------------------------------------------------

    pub fn push_accumulator(&mut self) {
        self.accumulators.push(Accumulator::new());
    }

    pub fn pop_accumulator(&mut self) -> Option<Accumulator> {
        self.accumulators.pop()
    }

    /// Replay a batch in reverse chronological order via ordinary `set`
    /// calls. Undoing a write to a constrained cell is effectively a no-op:
    /// the constraint re-derives forward on the next read.
    pub fn undo(&mut self, batch: Accumulator) {
        for record in batch.records.into_iter().rev() {
            if !self.arena.contains(record.property) {
                continue;
            }
            let _ = self.set(record.property, Some(record.old_value), None);
        }
    }
}

impl Default for PropertyGraph {
    fn default() -> Self {
        Self::new()
    }
}
