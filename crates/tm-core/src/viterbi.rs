//! Log-domain Viterbi decoding for time-inhomogeneous HMMs.
//!
//! The engine consumes one observation per step together with that step's
//! candidate states, emission log-probabilities, and transition
//! log-probabilities. Candidate sets and both tables may change at every
//! step. The forward message
//!
//!   m_t(c) = max_{p} [ m_{t-1}(p) + log p(p → c) ] + log e_t(c)
//!
//! is kept strictly in the natural-log domain; a missing transition is -inf,
//! and comparisons use strict `>` so the first maximizer in the
//! caller-supplied candidate order wins ties. Callers must therefore pass
//! candidate slices in a stable order; the engine keeps a defensive copy of
//! the previous step's order for exactly this reason.
//!
//! A step at which every candidate's score collapses to -inf is an *HMM
//! break*: not an error, but a terminal condition for stepping. The engine
//! latches `broken`, keeps the state of the last successful step, and
//! [`ViterbiEngine::compute_most_likely_sequence`] returns the prefix decoded
//! so far. Recovery means constructing a fresh engine.
//!
//! # Example
//!
//! ```ignore
//! use tm_core::viterbi::ViterbiEngine;
//!
//! let mut engine = ViterbiEngine::new();
//! engine.start_with_initial_observation(obs0, &candidates0, &emissions0)?;
//! for (obs, candidates, emissions, transitions) in steps {
//!     engine.next_step(obs, &candidates, &emissions, &transitions, None)?;
//!     if engine.is_broken() {
//!         break;
//!     }
//! }
//! let path = engine.compute_most_likely_sequence();
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::candidate::Candidate;
use crate::forward_backward::{ForwardBackward, ForwardBackwardError};
use crate::probability::{self, initial_capacity_hint, is_break, most_likely};
use crate::sequence::SequenceState;
use crate::transition::Transition;

/// Errors of the Viterbi decoder. All fail fast; an HMM break is not among
/// them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ViterbiError {
    #[error("next_step called before the engine was started")]
    NotStarted,
    #[error("the engine was already started")]
    AlreadyStarted,
    #[error("the sequence is broken; construct a new engine to continue")]
    BrokenSequence,
    #[error("a candidate is missing its emission log-probability")]
    MissingEmission,
    #[error("an initial state is missing its initial log-probability")]
    MissingInitialProbability,
    #[error("message history was not enabled on this engine")]
    HistoryUnavailable,
    #[error("smoothing engine rejected input: {0}")]
    Smoothing(#[from] ForwardBackwardError),
}

/// Result type for decoder operations.
pub type Result<T> = std::result::Result<T, ViterbiError>;

/// Most-likely-sequence decoder over a stream of candidate vectors.
///
/// One engine instance decodes one observation sequence; it cannot be
/// restarted. States within one step must be unique: messages are keyed by
/// state, so duplicate entries in a candidate slice collapse onto one key
/// and the last occurrence wins.
pub struct ViterbiEngine<S, O, D>
where
    S: Eq + Hash + Clone,
{
    keep_message_history: bool,
    compute_smoothing: bool,
    processing_started: bool,
    broken: bool,
    /// Forward message of the last successful step.
    message: Option<HashMap<S, f64>>,
    /// Leaves of the back-pointer DAG, one per reachable current state.
    last_extended_states: HashMap<S, Arc<Candidate<S, O, D>>>,
    /// Defensive copy of the last successful step's candidate order.
    prev_candidates: Vec<S>,
    message_history: Vec<HashMap<S, f64>>,
    forward_backward: Option<ForwardBackward<S, O>>,
}

impl<S, O, D> Default for ViterbiEngine<S, O, D>
where
    S: Eq + Hash + Clone,
    O: Clone,
    D: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, O, D> ViterbiEngine<S, O, D>
where
    S: Eq + Hash + Clone,
    O: Clone,
    D: Clone,
{
    pub fn new() -> Self {
        Self {
            keep_message_history: false,
            compute_smoothing: false,
            processing_started: false,
            broken: false,
            message: None,
            last_extended_states: HashMap::new(),
            prev_candidates: Vec::new(),
            message_history: Vec::new(),
            forward_backward: None,
        }
    }

    /// Retain every forward message for inspection (debug mode). Must be set
    /// before the engine is started; retention grows with sequence length.
    pub fn set_keep_message_history(&mut self, keep: bool) -> Result<()> {
        if self.processing_started {
            return Err(ViterbiError::AlreadyStarted);
        }
        self.keep_message_history = keep;
        if !keep {
            self.message_history.clear();
        }
        Ok(())
    }

    /// Run an embedded forward-backward pass alongside decoding so the
    /// decoded sequence carries smoothing probabilities. Must be set before
    /// the engine is started.
    pub fn set_compute_smoothing_probabilities(&mut self, compute: bool) -> Result<()> {
        if self.processing_started {
            return Err(ViterbiError::AlreadyStarted);
        }
        self.compute_smoothing = compute;
        if !compute {
            self.forward_backward = None;
        }
        Ok(())
    }

    pub fn processing_started(&self) -> bool {
        self.processing_started
    }

    /// Whether the sequence has broken. Latched: stays true for the lifetime
    /// of the engine.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Forward message of the last successful step, if any.
    pub fn current_message(&self) -> Option<&HashMap<S, f64>> {
        self.message.as_ref()
    }

    /// All retained forward messages, oldest first.
    pub fn message_history(&self) -> Result<&[HashMap<S, f64>]> {
        if !self.keep_message_history {
            return Err(ViterbiError::HistoryUnavailable);
        }
        Ok(&self.message_history)
    }

    /// Start from explicit initial state log-probabilities. The candidate
    /// nodes created here carry no observation.
    pub fn start_with_initial_probabilities(
        &mut self,
        initial_states: &[S],
        initial_log_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        if self.processing_started {
            return Err(ViterbiError::AlreadyStarted);
        }
        let mut message = HashMap::with_capacity(initial_capacity_hint(initial_states.len()));
        for state in initial_states {
            let lp = *initial_log_probabilities
                .get(state)
                .ok_or(ViterbiError::MissingInitialProbability)?;
            message.insert(state.clone(), lp);
        }
        self.processing_started = true;
        if is_break(&message) {
            debug!("initial message carries no probability mass; sequence is broken");
            self.broken = true;
            return Ok(());
        }
        if self.compute_smoothing {
            let mut smoother = ForwardBackward::new();
            smoother.start_with_initial_probabilities(
                initial_states,
                &probability::log_to_linear(&message),
            )?;
            self.forward_backward = Some(smoother);
        }
        let mut extended = HashMap::with_capacity(initial_capacity_hint(initial_states.len()));
        for state in initial_states {
            extended.insert(state.clone(), Arc::new(Candidate::root(state.clone(), None)));
        }
        self.install(message, extended, initial_states);
        Ok(())
    }

    /// Start from the first observation's emission log-probabilities.
    pub fn start_with_initial_observation(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_log_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        if self.processing_started {
            return Err(ViterbiError::AlreadyStarted);
        }
        let mut message = HashMap::with_capacity(initial_capacity_hint(candidates.len()));
        for state in candidates {
            let lp = *emission_log_probabilities
                .get(state)
                .ok_or(ViterbiError::MissingEmission)?;
            message.insert(state.clone(), lp);
        }
        self.processing_started = true;
        if is_break(&message) {
            debug!("initial message carries no probability mass; sequence is broken");
            self.broken = true;
            return Ok(());
        }
        if self.compute_smoothing {
            let mut smoother = ForwardBackward::new();
            smoother.start_with_initial_observation(
                observation.clone(),
                candidates,
                &probability::log_to_linear(&message),
            )?;
            self.forward_backward = Some(smoother);
        }
        let mut extended = HashMap::with_capacity(initial_capacity_hint(candidates.len()));
        for state in candidates {
            extended.insert(
                state.clone(),
                Arc::new(Candidate::root(state.clone(), Some(observation.clone()))),
            );
        }
        self.install(message, extended, candidates);
        Ok(())
    }

    /// Advance the recursion by one observation.
    ///
    /// A transition absent from `transition_log_probabilities` is impossible
    /// (-inf); a candidate absent from `emission_log_probabilities` is a
    /// contract violation. If the step breaks the sequence, `Ok` is returned,
    /// the previous step's state is kept, and the `broken` latch is set;
    /// any further call fails with [`ViterbiError::BrokenSequence`].
    pub fn next_step(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_log_probabilities: &HashMap<S, f64>,
        transition_log_probabilities: &HashMap<Transition<S>, f64>,
        transition_descriptors: Option<&HashMap<Transition<S>, D>>,
    ) -> Result<()> {
        if !self.processing_started {
            return Err(ViterbiError::NotStarted);
        }
        if self.broken {
            return Err(ViterbiError::BrokenSequence);
        }
        let Some(message) = self.message.as_ref() else {
            return Err(ViterbiError::BrokenSequence);
        };

        trace!(candidates = candidates.len(), "viterbi forward step");
        let hint = initial_capacity_hint(candidates.len());
        let mut new_message = HashMap::with_capacity(hint);
        let mut new_extended = HashMap::with_capacity(hint);
        for cur in candidates {
            let mut max_score = f64::NEG_INFINITY;
            let mut max_prev: Option<&S> = None;
            for prev in &self.prev_candidates {
                let prior = message.get(prev).copied().unwrap_or(f64::NEG_INFINITY);
                if prior == f64::NEG_INFINITY {
                    continue;
                }
                let transition = transition_log_probabilities
                    .get(&Transition::new(prev.clone(), cur.clone()))
                    .copied()
                    .unwrap_or(f64::NEG_INFINITY);
                let score = prior + transition;
                if score > max_score {
                    max_score = score;
                    max_prev = Some(prev);
                }
            }
            let emission = *emission_log_probabilities
                .get(cur)
                .ok_or(ViterbiError::MissingEmission)?;
            new_message.insert(cur.clone(), max_score + emission);
            if let Some(prev) = max_prev {
                if let Some(back) = self.last_extended_states.get(prev) {
                    let descriptor = transition_descriptors
                        .and_then(|table| table.get(&Transition::new(prev.clone(), cur.clone())))
                        .cloned();
                    new_extended.insert(
                        cur.clone(),
                        Arc::new(Candidate::extend(
                            cur.clone(),
                            Arc::clone(back),
                            observation.clone(),
                            descriptor,
                        )),
                    );
                }
            }
        }

        if is_break(&new_message) {
            debug!("forward step produced no probability mass; latching broken state");
            self.broken = true;
            return Ok(());
        }
        if let Some(smoother) = self.forward_backward.as_mut() {
            let linear_transitions: HashMap<Transition<S>, f64> = transition_log_probabilities
                .iter()
                .map(|(t, &lp)| (t.clone(), tm_math::log_to_linear(lp)))
                .collect();
            smoother.next_step(
                observation,
                candidates,
                &probability::log_to_linear(emission_log_probabilities),
                &linear_transitions,
            )?;
        }
        self.install(new_message, new_extended, candidates);
        Ok(())
    }

    /// Reconstruct the most likely state sequence decoded so far.
    ///
    /// Returns one entry per successful step, oldest first, with smoothing
    /// probabilities when enabled (`NaN` otherwise). Empty when the engine
    /// was never started or broke at the initial step. Idempotent.
    pub fn compute_most_likely_sequence(&self) -> Vec<SequenceState<S, O, D>> {
        let Some(message) = self.message.as_ref() else {
            return Vec::new();
        };
        let Some(last_state) = most_likely(self.prev_candidates.iter(), message) else {
            return Vec::new();
        };
        let Some(leaf) = self.last_extended_states.get(last_state) else {
            return Vec::new();
        };

        let mut chain: Vec<&Arc<Candidate<S, O, D>>> = Vec::new();
        let mut cursor = Some(leaf);
        while let Some(node) = cursor {
            chain.push(node);
            cursor = node.back_pointer();
        }

        let smoothing = self
            .forward_backward
            .as_ref()
            .map(|smoother| smoother.compute_smoothing_probabilities());
        let mut sequence = Vec::with_capacity(chain.len());
        for (age, node) in chain.iter().enumerate() {
            // The chain is newest-first; smoothing posteriors are oldest-first.
            let smoothing_probability = smoothing
                .as_ref()
                .and_then(|gammas| {
                    gammas
                        .len()
                        .checked_sub(age + 1)
                        .and_then(|index| gammas.get(index))
                })
                .and_then(|gamma| gamma.get(node.state()))
                .copied()
                .unwrap_or(f64::NAN);
            sequence.push(SequenceState {
                state: node.state().clone(),
                observation: node.observation().cloned(),
                transition_descriptor: node.transition_descriptor().cloned(),
                smoothing_probability,
            });
        }
        sequence.reverse();
        sequence
    }

    fn install(
        &mut self,
        message: HashMap<S, f64>,
        extended: HashMap<S, Arc<Candidate<S, O, D>>>,
        candidates: &[S],
    ) {
        if self.keep_message_history {
            self.message_history.push(message.clone());
        }
        self.message = Some(message);
        self.last_extended_states = extended;
        self.prev_candidates = candidates.to_vec();
    }
}
