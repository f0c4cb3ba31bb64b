//! Status state machine for requests.
//!
//! Requests move between three statuses, every transition reversible:
//!
//! ```text
//!   pending ⇄ approved
//!      ⇅          ⇅
//!      └── denied ─┘
//! ```
//!
//! Every transition is gated on the delivery state: a status must never
//! imply a decision was made on a request the approver never actually
//! received. The gate passes once delivery is confirmed: an automatic
//! provider send succeeded, or the owner confirmed a manual send.
//!
//! Group transitions are two-phase: the gate is validated for *all* members
//! before *any* member is mutated, and the apply phase is a single atomic
//! storage mutation. A per-record loop would leave the group's status view
//! inconsistent if a late member failed its gate.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{LayoverError, Result};
use crate::request::{DeliveryState, GroupId, Request, RequestStatus};

/// A single problem found by the pre-flight transition check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "issue")]
pub enum TransitionIssue {
    /// The request already has the target status.
    AlreadyInStatus { status: RequestStatus },
    /// The notification has not been confirmed sent yet.
    DeliveryNotConfirmed { state: DeliveryState },
}

impl std::fmt::Display for TransitionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionIssue::AlreadyInStatus { status } => {
                write!(f, "already in status '{status}'")
            }
            TransitionIssue::DeliveryNotConfirmed { state } => {
                write!(f, "notification not confirmed sent (delivery state: {state})")
            }
        }
    }
}

/// Result of a read-only pre-flight transition check.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionCheck {
    pub is_valid: bool,
    pub issues: Vec<TransitionIssue>,
}

/// Pure pre-flight check: would `transition_request` accept this change?
///
/// Collects every issue rather than stopping at the first, so callers can
/// present complete feedback.
pub fn validate_transition(request: &Request, new_status: RequestStatus) -> TransitionCheck {
    let mut issues = Vec::new();

    if request.status == new_status {
        issues.push(TransitionIssue::AlreadyInStatus { status: new_status });
    }

    let state = request.delivery_state();
    if !state.is_confirmed() {
        issues.push(TransitionIssue::DeliveryNotConfirmed { state });
    }

    TransitionCheck {
        is_valid: issues.is_empty(),
        issues,
    }
}

/// The two statuses a request could move to from its current one.
pub fn available_transitions(current: RequestStatus) -> [RequestStatus; 2] {
    match current {
        RequestStatus::Pending => [RequestStatus::Approved, RequestStatus::Denied],
        RequestStatus::Approved => [RequestStatus::Pending, RequestStatus::Denied],
        RequestStatus::Denied => [RequestStatus::Pending, RequestStatus::Approved],
    }
}

/// Enforce the delivery gate for a single request.
pub fn delivery_gate(request: &Request) -> Result<()> {
    let state = request.delivery_state();
    if state.is_confirmed() {
        Ok(())
    } else {
        Err(LayoverError::PrerequisiteNotMet {
            request: request.id,
            state,
        })
    }
}

/// Validate the delivery gate for every member of a group.
///
/// Returns `GroupPrerequisiteNotMet` naming all blocking members; callers
/// must not mutate any member when this fails.
pub fn group_delivery_gate(group: GroupId, members: &[Request]) -> Result<()> {
    let blocked: Vec<_> = members
        .iter()
        .filter(|member| !member.delivery_state().is_confirmed())
        .map(|member| member.id)
        .collect();

    if blocked.is_empty() {
        Ok(())
    } else {
        Err(LayoverError::GroupPrerequisiteNotMet { group, blocked })
    }
}

impl Request {
    /// Apply a status change, recording provenance.
    ///
    /// Crate-internal: callers go through the manager entry points, which
    /// enforce the delivery gate first.
    pub(crate) fn apply_status(&mut self, new_status: RequestStatus, method: &str, at: DateTime<Utc>) {
        self.status = new_status;
        self.status_change_method = Some(method.to_string());
        self.status_changed_at = Some(at);
        self.approved_at = if new_status == RequestStatus::Approved {
            Some(at)
        } else {
            None
        };
    }
}
