//! Convenience facades driving the decoders over an observation stream.
//!
//! [`OfflineEstimator`] wraps the Viterbi engine (with optional smoothing)
//! for batch decoding; [`OnlineEstimator`] composes the online filter with a
//! k-State memory for streaming use. Both only forward to the underlying
//! engines; all invariants live there.

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

use crate::filter::{FilterOracle, HmmFilter, StateCandidate};
use crate::kstate::{KState, KStateError};
use crate::sequence::SequenceState;
use crate::transition::Transition;
use crate::viterbi::{ViterbiEngine, ViterbiError};

/// Errors surfaced by the estimator facades.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorError {
    #[error(transparent)]
    Decoder(#[from] ViterbiError),
    #[error(transparent)]
    Memory(#[from] KStateError),
}

/// Result type for estimator operations.
pub type Result<T> = std::result::Result<T, EstimatorError>;

/// Batch decoder: one Viterbi engine driven step by step.
pub struct OfflineEstimator<S, O, D>
where
    S: Eq + Hash + Clone,
{
    engine: ViterbiEngine<S, O, D>,
}

impl<S, O, D> Default for OfflineEstimator<S, O, D>
where
    S: Eq + Hash + Clone,
    O: Clone,
    D: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, O, D> OfflineEstimator<S, O, D>
where
    S: Eq + Hash + Clone,
    O: Clone,
    D: Clone,
{
    pub fn new() -> Self {
        Self {
            engine: ViterbiEngine::new(),
        }
    }

    /// Decode with smoothing probabilities attached to the result. Must be
    /// called before `start`.
    pub fn with_smoothing(mut self) -> Result<Self> {
        self.engine.set_compute_smoothing_probabilities(true)?;
        Ok(self)
    }

    pub fn start(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_log_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        self.engine
            .start_with_initial_observation(observation, candidates, emission_log_probabilities)?;
        Ok(())
    }

    pub fn start_with_initial_probabilities(
        &mut self,
        initial_states: &[S],
        initial_log_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        self.engine
            .start_with_initial_probabilities(initial_states, initial_log_probabilities)?;
        Ok(())
    }

    pub fn update(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_log_probabilities: &HashMap<S, f64>,
        transition_log_probabilities: &HashMap<Transition<S>, f64>,
        transition_descriptors: Option<&HashMap<Transition<S>, D>>,
    ) -> Result<()> {
        self.engine.next_step(
            observation,
            candidates,
            emission_log_probabilities,
            transition_log_probabilities,
            transition_descriptors,
        )?;
        Ok(())
    }

    /// The most likely sequence decoded so far.
    pub fn result(&self) -> Vec<SequenceState<S, O, D>> {
        self.engine.compute_most_likely_sequence()
    }

    pub fn is_broken(&self) -> bool {
        self.engine.is_broken()
    }

    pub fn engine(&self) -> &ViterbiEngine<S, O, D> {
        &self.engine
    }
}

/// Streaming estimator: online filter feeding a bounded state memory.
pub struct OnlineEstimator<M: FilterOracle> {
    filter: HmmFilter<M>,
    memory: KState<M::State, M::Transition, M::Sample>,
}

impl<M: FilterOracle> OnlineEstimator<M> {
    pub fn new(oracle: M, memory: KState<M::State, M::Transition, M::Sample>) -> Self {
        Self {
            filter: HmmFilter::new(oracle),
            memory,
        }
    }

    /// Filter one sample and retain the resulting vector.
    ///
    /// A sample on which every candidate dies produces an empty vector; the
    /// memory ignores it and the next sample re-initializes the filter.
    pub fn update(&mut self, sample: M::Sample) -> Result<()> {
        let predecessors: Vec<StateCandidate<M::State, M::Transition>> =
            self.memory.vector().to_vec();
        let vector = self
            .filter
            .execute(&predecessors, self.memory.last_sample(), &sample);
        self.memory.update(vector, sample)?;
        Ok(())
    }

    /// Most likely current candidate by filter probability.
    pub fn estimate(&self) -> Option<&StateCandidate<M::State, M::Transition>> {
        self.memory.estimate()
    }

    /// Most likely retained chain, chronological.
    pub fn sequence(&self) -> Vec<StateCandidate<M::State, M::Transition>> {
        self.memory.sequence()
    }

    pub fn memory(&self) -> &KState<M::State, M::Transition, M::Sample> {
        &self.memory
    }
}
