//! Immutable per-step record of a decoded sequence.

use serde::Serialize;

/// One step of the most likely state sequence.
///
/// `observation` is absent for steps seeded from initial state probabilities
/// and `transition_descriptor` is absent at sequence roots or when the caller
/// supplied no descriptor table. `smoothing_probability` is `NaN` unless the
/// decoder ran with forward-backward smoothing enabled.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceState<S, O, D> {
    pub state: S,
    pub observation: Option<O>,
    pub transition_descriptor: Option<D>,
    pub smoothing_probability: f64,
}
