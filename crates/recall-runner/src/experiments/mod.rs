//! Trial list builders, one module per experiment.
//!
//! Each builder takes its already-loaded stimulus pools, validates every
//! count it is about to slice, and only then draws from the RNG. Loading is
//! kept apart from building so pools can be supplied from memory in tests.

pub mod associative;
pub mod item_consolidation;
pub mod parameter_search;
pub mod time_associative;
pub mod timed_sequence;

use serde::{Deserialize, Serialize};

/// Subject and session stamped into every persisted trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub subject: String,
    pub session: String,
}

impl SessionIdentity {
    pub fn new(subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: session.into(),
        }
    }
}

/// `set` repeated round-robin until `len` items.
pub(crate) fn cycle_to(set: &[String], len: usize) -> Vec<String> {
    set.iter().cycle().take(len).cloned().collect()
}
