//! Linear-domain forward-backward smoothing for time-inhomogeneous HMMs.
//!
//! The forward pass runs online: every recorded step keeps its candidate
//! order, emission and transition tables, and the unnormalized α message
//!
//!   α_t(s) = e_t(s) · Σ_{s'} α_{t-1}(s') · p(s' → s)
//!
//! The backward pass is computed on demand by
//! [`ForwardBackward::compute_smoothing_probabilities`], which returns the
//! per-step posteriors γ_t(s) ∝ α_t(s) · β_t(s), normalized within each step.
//!
//! All probabilities here are linear-domain; the log-domain decoder converts
//! explicitly before feeding this engine.

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

use crate::probability::initial_capacity_hint;
use crate::transition::Transition;

/// Errors of the smoothing engine. All are contract violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForwardBackwardError {
    #[error("next_step called before the engine was started")]
    NotStarted,
    #[error("the engine was already started")]
    AlreadyStarted,
    #[error("a candidate is missing its emission probability")]
    MissingEmission,
    #[error("an initial state is missing its initial probability")]
    MissingInitialProbability,
}

/// Result type for smoothing operations.
pub type Result<T> = std::result::Result<T, ForwardBackwardError>;

/// One recorded time step of the forward pass.
struct Step<S, O> {
    observation: Option<O>,
    candidates: Vec<S>,
    emission_probabilities: HashMap<S, f64>,
    /// Transition table *into* this step; empty for the initial step.
    transition_probabilities: HashMap<Transition<S>, f64>,
    forward_message: HashMap<S, f64>,
}

/// Linear-domain α/β recursion with retained forward history.
pub struct ForwardBackward<S, O> {
    steps: Vec<Step<S, O>>,
}

impl<S, O> Default for ForwardBackward<S, O>
where
    S: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, O> ForwardBackward<S, O>
where
    S: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Whether the engine has recorded its initial step.
    pub fn started(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Seed α₀ directly from initial state probabilities.
    pub fn start_with_initial_probabilities(
        &mut self,
        initial_states: &[S],
        initial_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        if self.started() {
            return Err(ForwardBackwardError::AlreadyStarted);
        }
        let seed = Self::collect_probabilities(
            initial_states,
            initial_probabilities,
            ForwardBackwardError::MissingInitialProbability,
        )?;
        self.start(None, initial_states, seed)
    }

    /// Seed α₀ from the first observation's emission probabilities.
    pub fn start_with_initial_observation(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_probabilities: &HashMap<S, f64>,
    ) -> Result<()> {
        if self.started() {
            return Err(ForwardBackwardError::AlreadyStarted);
        }
        let seed = Self::collect_probabilities(
            candidates,
            emission_probabilities,
            ForwardBackwardError::MissingEmission,
        )?;
        self.start(Some(observation), candidates, seed)
    }

    fn start(&mut self, observation: Option<O>, candidates: &[S], seed: HashMap<S, f64>) -> Result<()> {
        if self.started() {
            return Err(ForwardBackwardError::AlreadyStarted);
        }
        self.steps.push(Step {
            observation,
            candidates: candidates.to_vec(),
            emission_probabilities: seed.clone(),
            transition_probabilities: HashMap::new(),
            forward_message: seed,
        });
        Ok(())
    }

    /// Advance the forward recursion by one observation.
    ///
    /// Transitions absent from `transition_probabilities` have probability 0.
    pub fn next_step(
        &mut self,
        observation: O,
        candidates: &[S],
        emission_probabilities: &HashMap<S, f64>,
        transition_probabilities: &HashMap<Transition<S>, f64>,
    ) -> Result<()> {
        let (forward_message, emissions) = {
            let prev = self.steps.last().ok_or(ForwardBackwardError::NotStarted)?;
            let hint = initial_capacity_hint(candidates.len());
            let mut forward_message = HashMap::with_capacity(hint);
            let mut emissions = HashMap::with_capacity(hint);
            for cur in candidates {
                let emission = *emission_probabilities
                    .get(cur)
                    .ok_or(ForwardBackwardError::MissingEmission)?;
                let mut inbound = 0.0;
                for prev_state in &prev.candidates {
                    let alpha = prev.forward_message.get(prev_state).copied().unwrap_or(0.0);
                    if alpha == 0.0 {
                        continue;
                    }
                    let transition = transition_probabilities
                        .get(&Transition::new(prev_state.clone(), cur.clone()))
                        .copied()
                        .unwrap_or(0.0);
                    inbound += alpha * transition;
                }
                forward_message.insert(cur.clone(), emission * inbound);
                emissions.insert(cur.clone(), emission);
            }
            (forward_message, emissions)
        };
        self.steps.push(Step {
            observation: Some(observation),
            candidates: candidates.to_vec(),
            emission_probabilities: emissions,
            transition_probabilities: transition_probabilities.clone(),
            forward_message,
        });
        Ok(())
    }

    /// Run the backward pass and return per-step smoothing posteriors.
    ///
    /// The result has one map per recorded step, each normalized over its
    /// candidates. Steps whose α·β mass is entirely zero are returned as-is
    /// (all zeros) rather than divided into NaNs.
    pub fn compute_smoothing_probabilities(&self) -> Vec<HashMap<S, f64>> {
        let count = self.steps.len();
        if count == 0 {
            return Vec::new();
        }

        let mut betas: Vec<HashMap<S, f64>> = Vec::with_capacity(count);
        let mut beta: HashMap<S, f64> = self.steps[count - 1]
            .candidates
            .iter()
            .map(|s| (s.clone(), 1.0))
            .collect();
        for t in (0..count - 1).rev() {
            let step = &self.steps[t];
            let next = &self.steps[t + 1];
            let mut earlier = HashMap::with_capacity(initial_capacity_hint(step.candidates.len()));
            for state in &step.candidates {
                let mut outbound = 0.0;
                for next_state in &next.candidates {
                    let transition = next
                        .transition_probabilities
                        .get(&Transition::new(state.clone(), next_state.clone()))
                        .copied()
                        .unwrap_or(0.0);
                    if transition == 0.0 {
                        continue;
                    }
                    let emission = next
                        .emission_probabilities
                        .get(next_state)
                        .copied()
                        .unwrap_or(0.0);
                    let continuation = beta.get(next_state).copied().unwrap_or(0.0);
                    outbound += transition * emission * continuation;
                }
                earlier.insert(state.clone(), outbound);
            }
            betas.push(std::mem::replace(&mut beta, earlier));
        }
        betas.push(beta);
        betas.reverse();

        self.steps
            .iter()
            .zip(betas.iter())
            .map(|(step, beta)| {
                let mut gamma: HashMap<S, f64> = step
                    .candidates
                    .iter()
                    .map(|s| {
                        let alpha = step.forward_message.get(s).copied().unwrap_or(0.0);
                        let backward = beta.get(s).copied().unwrap_or(0.0);
                        (s.clone(), alpha * backward)
                    })
                    .collect();
                let total: f64 = gamma.values().sum();
                if total > 0.0 {
                    for mass in gamma.values_mut() {
                        *mass /= total;
                    }
                }
                gamma
            })
            .collect()
    }

    /// Retained (unnormalized) α messages, oldest first.
    pub fn forward_probabilities(&self) -> impl Iterator<Item = &HashMap<S, f64>> {
        self.steps.iter().map(|step| &step.forward_message)
    }

    /// Stored observations, oldest first; `None` marks an initial-probability
    /// seed step.
    pub fn observations(&self) -> impl Iterator<Item = Option<&O>> {
        self.steps.iter().map(|step| step.observation.as_ref())
    }

    fn collect_probabilities(
        states: &[S],
        table: &HashMap<S, f64>,
        missing: ForwardBackwardError,
    ) -> Result<HashMap<S, f64>> {
        let mut out = HashMap::with_capacity(initial_capacity_hint(states.len()));
        for state in states {
            let p = *table.get(state).ok_or(missing)?;
            out.insert(state.clone(), p);
        }
        Ok(out)
    }
}
