//! Request aggregate - domain model and status state machine.
//!
//! This module contains the core domain logic for requests:
//! - Request record, status/mode/type vocabularies and input drafts
//! - Validation (date order, type rules, group constraints)
//! - Status transitions and the delivery gate

pub mod transitions;
pub mod types;

// Re-export commonly used types
pub use transitions::{
    TransitionCheck, TransitionIssue, available_transitions, delivery_gate, group_delivery_gate,
    validate_transition,
};
pub use types::*;
