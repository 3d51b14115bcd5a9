//! Back-pointer DAG nodes for most-likely-sequence reconstruction.

use std::sync::Arc;

/// One candidate state at one time step of the Viterbi recursion.
///
/// Nodes are immutable once constructed and share ownership of their chosen
/// predecessor, so the set of live leaves keeps exactly the chains that can
/// still be reconstructed. Back-pointers always address a strictly earlier
/// time step; cycles cannot form.
#[derive(Debug)]
pub struct Candidate<S, O, D> {
    state: S,
    back_pointer: Option<Arc<Candidate<S, O, D>>>,
    observation: Option<O>,
    transition_descriptor: Option<D>,
}

impl<S, O, D> Candidate<S, O, D> {
    /// A sequence root: no predecessor, no descriptor.
    pub(crate) fn root(state: S, observation: Option<O>) -> Self {
        Self {
            state,
            back_pointer: None,
            observation,
            transition_descriptor: None,
        }
    }

    /// A continuation of `back_pointer` elected during a forward step.
    pub(crate) fn extend(
        state: S,
        back_pointer: Arc<Candidate<S, O, D>>,
        observation: O,
        transition_descriptor: Option<D>,
    ) -> Self {
        Self {
            state,
            back_pointer: Some(back_pointer),
            observation: Some(observation),
            transition_descriptor,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn back_pointer(&self) -> Option<&Arc<Candidate<S, O, D>>> {
        self.back_pointer.as_ref()
    }

    pub fn observation(&self) -> Option<&O> {
        self.observation.as_ref()
    }

    pub fn transition_descriptor(&self) -> Option<&D> {
        self.transition_descriptor.as_ref()
    }
}

impl<S, O, D> Drop for Candidate<S, O, D> {
    fn drop(&mut self) {
        // Unlink the chain iteratively; a recursive drop would overflow the
        // stack on long observation sequences.
        let mut back = self.back_pointer.take();
        while let Some(node) = back {
            match Arc::try_unwrap(node) {
                Ok(mut sole) => back = sole.back_pointer.take(),
                Err(_) => break,
            }
        }
    }
}
