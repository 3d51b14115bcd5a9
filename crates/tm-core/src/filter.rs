//! Online HMM filtering over caller-supplied candidate and transition
//! oracles.
//!
//! One [`HmmFilter::execute`] call turns the previous step's weighted
//! candidate vector into the current one:
//!
//! 1. the oracle proposes candidates with linear-domain emission
//!    probabilities,
//! 2. transition mass flows from each predecessor (`filter_probability`,
//!    linear domain) while the best continuation per candidate is tracked in
//!    base-10 logs (`sequence_log_probability`),
//! 3. if nothing survives, or there were no predecessors, the vector is
//!    re-initialized from emissions alone, which is how an HMM break heals in
//!    streaming mode,
//! 4. filter probabilities are normalized to sum to 1.
//!
//! The oracle seam is a trait with two required methods; the inference loop
//! itself is concrete. Implementations that can batch their transition
//! computation (for example one routing query per predecessor) override
//! [`FilterOracle::transitions`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use tm_math::linear_to_log10;

/// An observation in streaming mode. Timestamps must be totally ordered and
/// non-decreasing along one sequence.
pub trait Sample {
    fn time(&self) -> DateTime<Utc>;
}

/// Identity of one weighted candidate within one filter instance.
///
/// Ids are allocated by the filter and never reused, so downstream state
/// memories can use them as registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CandidateId(u64);

#[cfg(test)]
impl CandidateId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// One weighted candidate of the current step.
#[derive(Debug, Clone, Serialize)]
pub struct StateCandidate<C, T> {
    id: CandidateId,
    state: C,
    /// Posterior probability within the current vector; linear domain,
    /// normalized across the vector.
    filter_probability: f64,
    /// Joint base-10 log-probability of the best path ending here;
    /// unnormalized running maximum.
    sequence_log_probability: f64,
    predecessor: Option<CandidateId>,
    transition: Option<T>,
}

impl<C, T> StateCandidate<C, T> {
    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn state(&self) -> &C {
        &self.state
    }

    pub fn filter_probability(&self) -> f64 {
        self.filter_probability
    }

    pub fn sequence_log_probability(&self) -> f64 {
        self.sequence_log_probability
    }

    pub fn predecessor(&self) -> Option<CandidateId> {
        self.predecessor
    }

    pub fn transition(&self) -> Option<&T> {
        self.transition.as_ref()
    }

    /// Detach from the predecessor chain; used when the retaining memory
    /// trims history and this candidate becomes a sequence root. The
    /// transition that led here is kept for output.
    pub(crate) fn clear_predecessor(&mut self) {
        self.predecessor = None;
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        id: CandidateId,
        state: C,
        filter_probability: f64,
        sequence_log_probability: f64,
        predecessor: Option<CandidateId>,
        transition: Option<T>,
    ) -> Self {
        Self {
            id,
            state,
            filter_probability,
            sequence_log_probability,
            predecessor,
            transition,
        }
    }
}

/// Caller-supplied model: candidate generation and transition scoring.
///
/// All probabilities are linear-domain; a `None` transition (or one with
/// probability 0) means the move is impossible.
pub trait FilterOracle {
    type State: Clone;
    type Transition: Clone;
    type Sample: Sample;

    /// Propose candidates for `sample` with their emission probabilities.
    /// `predecessors` is the previous step's vector (empty at a sequence
    /// start or right after a break).
    fn candidates(
        &self,
        predecessors: &[StateCandidate<Self::State, Self::Transition>],
        sample: &Self::Sample,
    ) -> Vec<(Self::State, f64)>;

    /// Score the move from one predecessor to one candidate state.
    fn transition(
        &self,
        predecessor: (&Self::Sample, &StateCandidate<Self::State, Self::Transition>),
        candidate: (&Self::Sample, &Self::State),
    ) -> Option<(Self::Transition, f64)>;

    /// Score all predecessor/candidate pairs at once; the result is indexed
    /// `[candidate][predecessor]`. The default forms the full cross product
    /// with [`FilterOracle::transition`].
    fn transitions(
        &self,
        predecessors: (&Self::Sample, &[StateCandidate<Self::State, Self::Transition>]),
        candidates: (&Self::Sample, &[Self::State]),
    ) -> Vec<Vec<Option<(Self::Transition, f64)>>> {
        let (previous_sample, previous) = predecessors;
        let (sample, states) = candidates;
        states
            .iter()
            .map(|state| {
                previous
                    .iter()
                    .map(|predecessor| {
                        self.transition((previous_sample, predecessor), (sample, state))
                    })
                    .collect()
            })
            .collect()
    }
}

/// Concrete per-sample inference loop over a [`FilterOracle`].
pub struct HmmFilter<M: FilterOracle> {
    oracle: M,
    next_id: u64,
}

impl<M: FilterOracle> HmmFilter<M> {
    pub fn new(oracle: M) -> Self {
        Self { oracle, next_id: 0 }
    }

    pub fn oracle(&self) -> &M {
        &self.oracle
    }

    /// Execute one filter step and return the new normalized candidate
    /// vector.
    ///
    /// `previous` is the sample the predecessors were produced for; it may be
    /// `None` only when `predecessors` is empty. An empty return value means
    /// the oracle proposed no candidate with positive emission: a full break,
    /// which the next call recovers from by re-initialization. A step whose
    /// surviving candidates all carry zero emission re-initializes the same
    /// way, keeping the output a proper distribution.
    pub fn execute(
        &mut self,
        predecessors: &[StateCandidate<M::State, M::Transition>],
        previous: Option<&M::Sample>,
        sample: &M::Sample,
    ) -> Vec<StateCandidate<M::State, M::Transition>> {
        let candidates = self.oracle.candidates(predecessors, sample);
        let mut result: Vec<StateCandidate<M::State, M::Transition>> =
            Vec::with_capacity(candidates.len());
        let mut normalizer = 0.0;

        if let (Some(previous_sample), false) = (previous, predecessors.is_empty()) {
            let states: Vec<M::State> =
                candidates.iter().map(|(state, _)| state.clone()).collect();
            let table = self
                .oracle
                .transitions((previous_sample, predecessors), (sample, &states));

            for (index, (state, emission)) in candidates.iter().enumerate() {
                let mut filter_probability = 0.0;
                let mut sequence_log_probability = f64::NEG_INFINITY;
                let mut elected_predecessor = None;
                let mut elected_transition = None;

                for (pred_index, predecessor) in predecessors.iter().enumerate() {
                    let Some((transition, probability)) = table[index][pred_index].as_ref() else {
                        continue;
                    };
                    if *probability <= 0.0 {
                        continue;
                    }
                    filter_probability += probability * predecessor.filter_probability;
                    let score = predecessor.sequence_log_probability
                        + linear_to_log10(*probability)
                        + linear_to_log10(*emission);
                    if score > sequence_log_probability {
                        elected_predecessor = Some(predecessor.id);
                        elected_transition = Some(transition.clone());
                        sequence_log_probability = score;
                    }
                }

                if filter_probability == 0.0 {
                    continue;
                }
                filter_probability *= emission;
                normalizer += filter_probability;
                result.push(StateCandidate {
                    id: self.allocate_id(),
                    state: state.clone(),
                    filter_probability,
                    sequence_log_probability,
                    predecessor: elected_predecessor,
                    transition: elected_transition,
                });
            }
        }

        if result.is_empty() || normalizer == 0.0 || predecessors.is_empty() {
            if !predecessors.is_empty() {
                debug!("no transition mass reached the new vector; re-initializing from emissions");
            }
            normalizer = 0.0;
            result.clear();
            for (state, emission) in &candidates {
                if *emission == 0.0 {
                    continue;
                }
                normalizer += emission;
                result.push(StateCandidate {
                    id: self.allocate_id(),
                    state: state.clone(),
                    filter_probability: *emission,
                    sequence_log_probability: linear_to_log10(*emission),
                    predecessor: None,
                    transition: None,
                });
            }
        }

        if normalizer > 0.0 {
            for candidate in &mut result {
                candidate.filter_probability /= normalizer;
            }
        }
        result
    }

    fn allocate_id(&mut self) -> CandidateId {
        let id = CandidateId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    /// Seconds-since-epoch sample used across the crate's tests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Tick(pub i64);

    impl Sample for Tick {
        fn time(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(self.0, 0).single().expect("valid tick")
        }
    }

    /// Stationary two-state oracle driven by per-tick emission tables.
    pub(crate) struct TableOracle {
        pub emissions: Vec<Vec<(&'static str, f64)>>,
        pub transitions: HashMap<(&'static str, &'static str), f64>,
    }

    impl FilterOracle for TableOracle {
        type State = &'static str;
        type Transition = (&'static str, &'static str);
        type Sample = Tick;

        fn candidates(
            &self,
            _predecessors: &[StateCandidate<Self::State, Self::Transition>],
            sample: &Tick,
        ) -> Vec<(Self::State, f64)> {
            self.emissions
                .get(sample.0 as usize)
                .cloned()
                .unwrap_or_default()
        }

        fn transition(
            &self,
            predecessor: (&Tick, &StateCandidate<Self::State, Self::Transition>),
            candidate: (&Tick, &Self::State),
        ) -> Option<(Self::Transition, f64)> {
            let edge = (*predecessor.1.state(), *candidate.1);
            self.transitions
                .get(&edge)
                .filter(|&&p| p > 0.0)
                .map(|&p| (edge, p))
        }
    }

    fn uniform_transitions() -> HashMap<(&'static str, &'static str), f64> {
        [
            (("a", "a"), 0.5),
            (("a", "b"), 0.5),
            (("b", "a"), 0.5),
            (("b", "b"), 0.5),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn initialization_keeps_emissions_already_normalized() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 0.2), ("b", 0.8)]],
            transitions: uniform_transitions(),
        };
        let mut filter = HmmFilter::new(oracle);
        let vector = filter.execute(&[], None, &Tick(0));
        assert_eq!(vector.len(), 2);
        assert!((vector[0].filter_probability() - 0.2).abs() < 1e-12);
        assert!((vector[1].filter_probability() - 0.8).abs() < 1e-12);
        assert!(vector.iter().all(|c| c.predecessor().is_none()));
    }

    #[test]
    fn initialization_normalizes_uniform_emissions() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 0.1), ("b", 0.1), ("c", 0.1), ("d", 0.1)]],
            transitions: HashMap::new(),
        };
        let mut filter = HmmFilter::new(oracle);
        let vector = filter.execute(&[], None, &Tick(0));
        assert_eq!(vector.len(), 4);
        for candidate in &vector {
            assert!((candidate.filter_probability() - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_emission_candidates_are_dropped_at_initialization() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 0.0), ("b", 0.5)]],
            transitions: uniform_transitions(),
        };
        let mut filter = HmmFilter::new(oracle);
        let vector = filter.execute(&[], None, &Tick(0));
        assert_eq!(vector.len(), 1);
        assert_eq!(*vector[0].state(), "b");
        assert!((vector[0].filter_probability() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn filter_step_normalizes_and_links_predecessors() {
        let oracle = TableOracle {
            emissions: vec![
                vec![("a", 0.5), ("b", 0.5)],
                vec![("a", 0.9), ("b", 0.1)],
            ],
            transitions: uniform_transitions(),
        };
        let mut filter = HmmFilter::new(oracle);
        let first = filter.execute(&[], None, &Tick(0));
        let second = filter.execute(&first, Some(&Tick(0)), &Tick(1));

        let total: f64 = second.iter().map(|c| c.filter_probability()).sum();
        assert!((total - 1.0).abs() < 1e-12);
        for candidate in &second {
            assert!(candidate.predecessor().is_some());
            assert!(candidate.transition().is_some());
        }
        // With symmetric transitions the posterior is the emission ratio.
        let a = second.iter().find(|c| *c.state() == "a").unwrap();
        assert!((a.filter_probability() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn sequence_log_probability_tracks_best_path_base10() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 1.0)], vec![("b", 0.1)]],
            transitions: [(("a", "b"), 0.5)].into_iter().collect(),
        };
        let mut filter = HmmFilter::new(oracle);
        let first = filter.execute(&[], None, &Tick(0));
        assert!((first[0].sequence_log_probability() - 0.0).abs() < 1e-12);
        let second = filter.execute(&first, Some(&Tick(0)), &Tick(1));
        // log10(1.0) + log10(0.5) + log10(0.1)
        let expected = 0.5f64.log10() + 0.1f64.log10();
        assert!((second[0].sequence_log_probability() - expected).abs() < 1e-12);
    }

    #[test]
    fn break_recovery_reinitializes_without_predecessors() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 1.0)], vec![("b", 0.4)]],
            // No edge from a to b: transition mass dies.
            transitions: [(("a", "a"), 1.0)].into_iter().collect(),
        };
        let mut filter = HmmFilter::new(oracle);
        let first = filter.execute(&[], None, &Tick(0));
        let second = filter.execute(&first, Some(&Tick(0)), &Tick(1));
        assert_eq!(second.len(), 1);
        assert_eq!(*second[0].state(), "b");
        assert!(second[0].predecessor().is_none());
        assert!((second[0].filter_probability() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn total_break_returns_empty_vector() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 1.0)], vec![]],
            transitions: uniform_transitions(),
        };
        let mut filter = HmmFilter::new(oracle);
        let first = filter.execute(&[], None, &Tick(0));
        let second = filter.execute(&first, Some(&Tick(0)), &Tick(1));
        assert!(second.is_empty());
    }

    #[test]
    fn candidate_ids_are_unique_across_steps() {
        let oracle = TableOracle {
            emissions: vec![vec![("a", 0.5), ("b", 0.5)], vec![("a", 0.5), ("b", 0.5)]],
            transitions: uniform_transitions(),
        };
        let mut filter = HmmFilter::new(oracle);
        let first = filter.execute(&[], None, &Tick(0));
        let second = filter.execute(&first, Some(&Tick(0)), &Tick(1));
        let mut ids: Vec<CandidateId> = first.iter().chain(second.iter()).map(|c| c.id()).collect();
        let before = ids.len();
        ids.sort_by_key(|id| id.0);
        ids.dedup();
        assert_eq!(ids.len(), before);
    }
}
