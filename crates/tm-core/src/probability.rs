//! Message-level probability utilities shared by the inference engines.
//!
//! A *message* is a map from candidate state to probability (log or linear
//! domain depending on the engine). The helpers here are deliberately small:
//! the engines own the recursions, this module owns the conventions.

use std::collections::HashMap;
use std::hash::Hash;

use tm_math::log_sum_exp;

/// Exponentiate every value of a log-domain message, preserving keys.
pub fn log_to_linear<S>(log_probabilities: &HashMap<S, f64>) -> HashMap<S, f64>
where
    S: Eq + Hash + Clone,
{
    log_probabilities
        .iter()
        .map(|(state, &lp)| (state.clone(), tm_math::log_to_linear(lp)))
        .collect()
}

/// True iff the message carries no probability mass at all.
///
/// An empty message or one whose every entry is -inf means the model has no
/// way to continue: an HMM break.
pub fn is_break<S>(message: &HashMap<S, f64>) -> bool {
    if message.is_empty() {
        return true;
    }
    let values: Vec<f64> = message.values().copied().collect();
    log_sum_exp(&values) == f64::NEG_INFINITY
}

/// Hash-map capacity for an expected entry count, padded for the load factor.
pub fn initial_capacity_hint(expected_entries: usize) -> usize {
    expected_entries + expected_entries / 2 + 1
}

/// Stable argmax over a scored message.
///
/// Walks `order` and compares with strict `>`, so the first maximizer in the
/// caller-supplied iteration order wins ties. States absent from `scores` are
/// skipped.
pub fn most_likely<'a, S, I>(order: I, scores: &HashMap<S, f64>) -> Option<&'a S>
where
    S: Eq + Hash + 'a,
    I: IntoIterator<Item = &'a S>,
{
    let mut best: Option<(&'a S, f64)> = None;
    for state in order {
        let Some(&score) = scores.get(state) else {
            continue;
        };
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((state, score)),
        }
    }
    best.map(|(state, _)| state)
}
