//! Bounded-history candidate memory with reference-counted pruning.
//!
//! The memory retains the most recent candidate vectors produced by the
//! online filter, bounded by a step count (κ + 1 entries) and/or a wall-clock
//! window (τ). Every candidate carries a reference count: the number of
//! direct predecessor links from the following step's vector. A candidate
//! whose count reaches zero no longer participates in any surviving chain and
//! is removed, cascading along its own predecessor link. One exception: each
//! entry's `estimated` candidate (the sequence-log-probability argmax at
//! insertion time) is always kept so the decoded sequence stays walkable.

use std::collections::{HashMap, VecDeque};
use std::collections::vec_deque;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::trace;

use crate::filter::{CandidateId, Sample, StateCandidate};

/// Errors of the state memory. Both are caller contract violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KStateError {
    #[error("out-of-order update: sample at {current} precedes the last retained sample at {previous}")]
    OutOfOrderUpdate {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("inconsistent update: a candidate's predecessor is not part of the previous vector")]
    InconsistentUpdate,
}

/// Result type for state-memory operations.
pub type Result<T> = std::result::Result<T, KStateError>;

struct Entry<C, T, S> {
    vector: Vec<StateCandidate<C, T>>,
    sample: S,
    /// Sequence-log-probability argmax of `vector` at insertion time; the
    /// walkable tail of the decoded sequence, never pruned.
    estimated: CandidateId,
}

/// Bounded sequence of candidate vectors with a reference-counted registry.
pub struct KState<C, T, S> {
    k: Option<usize>,
    tau: Option<Duration>,
    sequence: VecDeque<Entry<C, T, S>>,
    /// Direct back-link count per retained candidate.
    counters: HashMap<CandidateId, usize>,
}

impl<C, T, S> Default for KState<C, T, S>
where
    C: Clone,
    T: Clone,
    S: Sample,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, T, S> KState<C, T, S>
where
    C: Clone,
    T: Clone,
    S: Sample,
{
    /// Unbounded memory: every step is retained.
    pub fn new() -> Self {
        Self::with_bounds(None, None)
    }

    /// Memory bounded to `k` + 1 retained steps and/or a `tau` time window.
    /// `None` means unbounded in that dimension.
    pub fn with_bounds(k: Option<usize>, tau: Option<Duration>) -> Self {
        Self {
            k,
            tau,
            sequence: VecDeque::new(),
            counters: HashMap::new(),
        }
    }

    /// Append one filter step's candidate vector.
    ///
    /// An empty vector is a no-op (the filter reports a total break that
    /// way). Candidates with a predecessor must link into the previous
    /// entry's vector; anything else is an inconsistent update.
    pub fn update(&mut self, vector: Vec<StateCandidate<C, T>>, sample: S) -> Result<()> {
        if vector.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.sequence.back() {
            if sample.time() < last.sample.time() {
                return Err(KStateError::OutOfOrderUpdate {
                    previous: last.sample.time(),
                    current: sample.time(),
                });
            }
        }
        for candidate in &vector {
            if let Some(predecessor) = candidate.predecessor() {
                let linked = self
                    .sequence
                    .back()
                    .is_some_and(|last| last.vector.iter().any(|c| c.id() == predecessor));
                if !linked || !self.counters.contains_key(&predecessor) {
                    return Err(KStateError::InconsistentUpdate);
                }
            }
        }

        for candidate in &vector {
            self.counters.insert(candidate.id(), 0);
            if let Some(predecessor) = candidate.predecessor() {
                if let Some(count) = self.counters.get_mut(&predecessor) {
                    *count += 1;
                }
            }
        }

        let mut estimated = &vector[0];
        for candidate in &vector[1..] {
            if candidate.sequence_log_probability() > estimated.sequence_log_probability() {
                estimated = candidate;
            }
        }
        let estimated = estimated.id();

        if let Some(last_index) = self.sequence.len().checked_sub(1) {
            let unreferenced: Vec<CandidateId> = self.sequence[last_index]
                .vector
                .iter()
                .map(|c| c.id())
                .filter(|id| self.counters.get(id) == Some(&0))
                .collect();
            for id in unreferenced {
                self.remove(id, last_index);
            }
        }

        let time = sample.time();
        self.sequence.push_back(Entry {
            vector,
            sample,
            estimated,
        });

        loop {
            let over_window = match (self.tau, self.sequence.front()) {
                (Some(tau), Some(front)) => time.signed_duration_since(front.sample.time()) > tau,
                _ => false,
            };
            let over_length = self.k.is_some_and(|k| self.sequence.len() > k + 1);
            if !(over_window || over_length) {
                break;
            }
            let Some(dropped) = self.sequence.pop_front() else {
                break;
            };
            for candidate in &dropped.vector {
                self.counters.remove(&candidate.id());
            }
            if let Some(front) = self.sequence.front_mut() {
                for candidate in &mut front.vector {
                    candidate.clear_predecessor();
                }
            }
            trace!(dropped = dropped.vector.len(), "trimmed state memory head");
        }
        Ok(())
    }

    /// Remove a candidate from the entry at `index`, cascading along its
    /// predecessor chain while counts drop to zero. An entry's `estimated`
    /// candidate is kept at any depth.
    fn remove(&mut self, id: CandidateId, index: usize) {
        let mut id = id;
        let mut index = index;
        loop {
            let entry = &mut self.sequence[index];
            if entry.estimated == id {
                return;
            }
            let Some(position) = entry.vector.iter().position(|c| c.id() == id) else {
                return;
            };
            let candidate = entry.vector.swap_remove(position);
            self.counters.remove(&id);

            let Some(predecessor) = candidate.predecessor() else {
                return;
            };
            let Some(count) = self.counters.get_mut(&predecessor) else {
                return;
            };
            *count -= 1;
            if *count == 0 && index > 0 {
                id = predecessor;
                index -= 1;
            } else {
                return;
            }
        }
    }

    /// The last entry's candidate vector, or empty before the first update.
    pub fn vector(&self) -> &[StateCandidate<C, T>] {
        self.sequence
            .back()
            .map(|entry| entry.vector.as_slice())
            .unwrap_or(&[])
    }

    /// Filter-probability argmax over the current vector (first maximizer
    /// wins ties). Distinct from the sequence tail, which follows the
    /// sequence log-probability.
    pub fn estimate(&self) -> Option<&StateCandidate<C, T>> {
        let last = self.sequence.back()?;
        let mut best: Option<&StateCandidate<C, T>> = None;
        for candidate in &last.vector {
            match best {
                Some(top) if candidate.filter_probability() <= top.filter_probability() => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    /// The most likely retained chain, in chronological order.
    ///
    /// Walks predecessor links back from the last entry's `estimated`
    /// candidate; wherever the chain breaks mid-stream the entry's own
    /// `estimated` substitutes.
    pub fn sequence(&self) -> Vec<StateCandidate<C, T>> {
        let mut reversed = Vec::with_capacity(self.sequence.len());
        let mut chain: Option<CandidateId> = None;
        for index in (0..self.sequence.len()).rev() {
            let entry = &self.sequence[index];
            let id = chain.unwrap_or(entry.estimated);
            let candidate = entry
                .vector
                .iter()
                .find(|c| c.id() == id)
                .or_else(|| entry.vector.iter().find(|c| c.id() == entry.estimated));
            let Some(candidate) = candidate else {
                continue;
            };
            chain = candidate.predecessor();
            reversed.push(candidate.clone());
        }
        reversed.reverse();
        reversed
    }

    /// Stored samples, oldest first.
    pub fn samples(&self) -> Samples<'_, C, T, S> {
        Samples {
            inner: self.sequence.iter(),
        }
    }

    /// The most recently retained sample.
    pub fn last_sample(&self) -> Option<&S> {
        self.sequence.back().map(|entry| &entry.sample)
    }

    /// Number of retained steps.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Number of registered candidates across all retained steps.
    pub fn count(&self) -> usize {
        self.counters.len()
    }
}

/// Iterator over the retained samples, oldest first.
pub struct Samples<'a, C, T, S> {
    inner: vec_deque::Iter<'a, Entry<C, T, S>>,
}

impl<'a, C, T, S> Iterator for Samples<'a, C, T, S> {
    type Item = &'a S;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| &entry.sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::Tick;

    type Candidate = StateCandidate<&'static str, ()>;

    fn candidate(
        id: u64,
        state: &'static str,
        filtprob: f64,
        seqprob: f64,
        predecessor: Option<u64>,
    ) -> Candidate {
        StateCandidate::with_parts(
            CandidateId::from_raw(id),
            state,
            filtprob,
            seqprob,
            predecessor.map(CandidateId::from_raw),
            predecessor.map(|_| ()),
        )
    }

    fn ids(candidates: &[StateCandidate<&'static str, ()>]) -> Vec<CandidateId> {
        candidates.iter().map(|c| c.id()).collect()
    }

    #[test]
    fn empty_vector_is_a_no_op() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory.update(Vec::new(), Tick(0)).unwrap();
        assert!(memory.is_empty());
        assert!(memory.vector().is_empty());
    }

    #[test]
    fn out_of_order_update_fails() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(vec![candidate(1, "a", 1.0, 0.0, None)], Tick(10))
            .unwrap();
        let err = memory
            .update(vec![candidate(2, "a", 1.0, 0.0, None)], Tick(5))
            .unwrap_err();
        assert!(matches!(err, KStateError::OutOfOrderUpdate { .. }));
    }

    #[test]
    fn unknown_predecessor_fails() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(vec![candidate(1, "a", 1.0, 0.0, None)], Tick(0))
            .unwrap();
        let err = memory
            .update(vec![candidate(2, "b", 1.0, -1.0, Some(99))], Tick(1))
            .unwrap_err();
        assert_eq!(err, KStateError::InconsistentUpdate);
    }

    #[test]
    fn unreferenced_candidates_are_pruned() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(
                vec![
                    candidate(1, "a", 0.6, -1.0, None),
                    candidate(2, "b", 0.4, -2.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        // Both successors chain to candidate 1; candidate 2 loses its reason
        // to exist but candidate 1's entry keeps its estimated (also 1).
        memory
            .update(
                vec![
                    candidate(3, "a", 0.7, -1.5, Some(1)),
                    candidate(4, "b", 0.3, -2.5, Some(1)),
                ],
                Tick(1),
            )
            .unwrap();
        assert_eq!(memory.count(), 3);
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn estimated_survives_even_when_unreferenced() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(
                vec![
                    candidate(1, "a", 0.5, -1.0, None),
                    candidate(2, "b", 0.5, -2.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        // Nothing links back: a filter re-initialization after a break.
        memory
            .update(vec![candidate(3, "c", 1.0, -0.5, None)], Tick(1))
            .unwrap();
        // Candidate 1 (estimated of its entry) survives; candidate 2 is gone.
        assert_eq!(memory.count(), 2);
        let chain = memory.sequence();
        assert_eq!(chain.len(), 2);
        assert_eq!(*chain[0].state(), "a");
        assert_eq!(*chain[1].state(), "c");
    }

    #[test]
    fn retention_bound_trims_head_and_clears_roots() {
        let mut memory: KState<&str, (), Tick> = KState::with_bounds(Some(1), None);
        memory
            .update(
                vec![
                    candidate(1, "a", 0.6, -1.0, None),
                    candidate(2, "b", 0.4, -2.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        memory
            .update(
                vec![
                    candidate(3, "a", 0.7, -1.5, Some(1)),
                    candidate(4, "b", 0.3, -2.5, Some(1)),
                ],
                Tick(1),
            )
            .unwrap();
        memory
            .update(
                vec![
                    candidate(5, "a", 0.8, -2.0, Some(3)),
                    candidate(6, "b", 0.2, -3.0, Some(3)),
                ],
                Tick(2),
            )
            .unwrap();

        assert_eq!(memory.len(), 2);
        // Registry holds exactly the survivors of the last two steps.
        assert_eq!(memory.count(), 3);
        let samples: Vec<i64> = memory.samples().map(|t| t.0).collect();
        assert_eq!(samples, vec![1, 2]);
        // The new front became a sequence root.
        let chain = memory.sequence();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].predecessor().is_none());
        assert_eq!(
            ids(&chain),
            vec![CandidateId::from_raw(3), CandidateId::from_raw(5)]
        );
    }

    #[test]
    fn time_window_trims_head() {
        let mut memory: KState<&str, (), Tick> =
            KState::with_bounds(None, Some(Duration::seconds(10)));
        memory
            .update(vec![candidate(1, "a", 1.0, 0.0, None)], Tick(0))
            .unwrap();
        memory
            .update(vec![candidate(2, "a", 1.0, -1.0, Some(1))], Tick(5))
            .unwrap();
        memory
            .update(vec![candidate(3, "a", 1.0, -2.0, Some(2))], Tick(20))
            .unwrap();
        let samples: Vec<i64> = memory.samples().map(|t| t.0).collect();
        assert_eq!(samples, vec![20]);
        assert!(memory.vector()[0].predecessor().is_none());
    }

    #[test]
    fn estimate_follows_filter_probability_not_seqprob() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(
                vec![
                    candidate(1, "a", 0.3, -1.0, None),
                    candidate(2, "b", 0.7, -2.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        // estimate(): highest filter probability.
        assert_eq!(*memory.estimate().unwrap().state(), "b");
        // sequence tail: highest sequence log-probability.
        assert_eq!(*memory.sequence()[0].state(), "a");
    }

    #[test]
    fn cascade_removal_reaches_interior_entries() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(
                vec![
                    candidate(1, "a", 0.5, -1.0, None),
                    candidate(2, "b", 0.5, -2.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        memory
            .update(
                vec![
                    candidate(3, "a", 0.5, -1.5, Some(1)),
                    candidate(4, "b", 0.5, -2.5, Some(2)),
                ],
                Tick(1),
            )
            .unwrap();
        // Only candidate 3's chain continues: pruning candidate 4 must
        // cascade into the first entry and take candidate 2 with it.
        memory
            .update(vec![candidate(5, "a", 1.0, -2.0, Some(3))], Tick(2))
            .unwrap();
        assert_eq!(memory.count(), 3);
        let chain = memory.sequence();
        assert_eq!(
            ids(&chain),
            vec![
                CandidateId::from_raw(1),
                CandidateId::from_raw(3),
                CandidateId::from_raw(5)
            ]
        );
    }

    #[test]
    fn estimated_guard_holds_at_cascade_depth() {
        let mut memory: KState<&str, (), Tick> = KState::new();
        memory
            .update(
                vec![
                    candidate(1, "a", 0.5, -2.0, None),
                    candidate(2, "b", 0.5, -1.0, None),
                ],
                Tick(0),
            )
            .unwrap();
        // Candidate 3 chains to 1; candidate 2 is the first entry's
        // estimated, so it survives with a zero counter.
        memory
            .update(vec![candidate(3, "a", 1.0, -1.5, Some(1))], Tick(1))
            .unwrap();
        assert_eq!(memory.count(), 3);
        // The chain from the tail runs through 1, not the kept estimated 2.
        let chain = memory.sequence();
        assert_eq!(
            ids(&chain),
            vec![CandidateId::from_raw(1), CandidateId::from_raw(3)]
        );
    }
}
