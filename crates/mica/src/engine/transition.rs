use std::sync::Arc;

use super::value::Value;

/// Timing contract for an animated value change.
///
/// The engine never reads a wall clock; `now_ms` is the graph's virtual time,
/// advanced explicitly by the embedder.
pub trait Transition: Send + Sync {
    /// Stamp the start of the interpolation window.
    fn reset(&self, now_ms: f64);

    /// True once the transition has run its course; the engine then drops
    /// the in-flight state and reads return the end value directly.
    fn is_complete(&self, now_ms: f64) -> bool;

    /// Interpolation fraction in `[0, 1]`.
    fn progress(&self, now_ms: f64) -> f64;
}

/// In-flight transition state captured by `set`: the value the cell is
/// interpolating away from, plus its timing object.
#[derive(Clone)]
pub struct ActiveTransition {
    pub start: Arc<dyn Value>,
    pub timing: Arc<dyn Transition>,
}
