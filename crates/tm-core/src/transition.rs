//! Ordered state pair used as the key of transition tables.

/// A directed transition between two candidate states.
///
/// Value-equal iff both components are equal, so it can key the transition
/// log-probability and descriptor maps handed to the decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

impl<S> Transition<S> {
    pub fn new(from: S, to: S) -> Self {
        Self { from, to }
    }
}
