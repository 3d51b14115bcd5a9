//! Trackmatch HMM inference core.
//!
//! Maximum-a-posteriori decoding of a latent state sequence from a stream of
//! observations under a time-inhomogeneous Markov model: candidate states,
//! emission probabilities, and transition probabilities are supplied anew at
//! every step by the caller (typically a road-network matcher producing
//! position candidates and routed transitions).
//!
//! Three subsystems:
//! - [`viterbi`]: batch most-likely-sequence decoding with optional
//!   forward-backward smoothing ([`forward_backward`])
//! - [`filter`]: per-sample online filtering over caller-supplied candidate
//!   and transition oracles
//! - [`kstate`]: bounded-history retention of filtered candidate vectors
//!   with reference-counted pruning
//!
//! The [`estimator`] facades drive either path over an observation stream.
//! Graphs, geometry, and routing are out of scope: states, observations, and
//! transition descriptors are opaque type parameters here.

pub mod candidate;
pub mod estimator;
pub mod filter;
pub mod forward_backward;
pub mod kstate;
pub mod probability;
pub mod sequence;
pub mod transition;
pub mod viterbi;

pub use candidate::Candidate;
pub use estimator::{EstimatorError, OfflineEstimator, OnlineEstimator};
pub use filter::{CandidateId, FilterOracle, HmmFilter, Sample, StateCandidate};
pub use forward_backward::{ForwardBackward, ForwardBackwardError};
pub use kstate::{KState, KStateError};
pub use probability::{initial_capacity_hint, is_break, log_to_linear, most_likely};
pub use sequence::SequenceState;
pub use transition::Transition;
pub use viterbi::{ViterbiEngine, ViterbiError};
