//! Error types for the request lifecycle engine.

use thiserror::Error;

use crate::reply::ReplyId;
use crate::request::{DeliveryState, GroupId, RequestId};

/// Result type alias using the layover error type.
pub type Result<T> = std::result::Result<T, LayoverError>;

/// Main error type for the request lifecycle engine.
///
/// Delivery failures are deliberately *not* represented here: a failed send
/// is absorbed into the request's delivery fields so a transient provider
/// outage never loses the submitted request. Classification ambiguity is
/// likewise a non-error outcome (the reply lands in the review queue).
#[derive(Error, Debug)]
pub enum LayoverError {
    /// Request not found, or owned by someone else.
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// Group not found, or owned by someone else.
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    /// Reply not found, or its request is owned by someone else.
    #[error("reply not found: {0}")]
    ReplyNotFound(ReplyId),

    /// Malformed input (bad date order, bad type, missing or malformed
    /// flight reference, too many days, non-consecutive dates, ...).
    #[error("validation failed on {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// The submitted date range overlaps existing pending/approved requests.
    #[error("date range overlaps {} existing request(s)", .conflicting.len())]
    Conflict { conflicting: Vec<RequestId> },

    /// Status change attempted before the notification was confirmed sent.
    #[error("delivery not confirmed for request {request} (state: {state})")]
    PrerequisiteNotMet {
        request: RequestId,
        state: DeliveryState,
    },

    /// Group status change blocked by members without confirmed delivery.
    /// No member is mutated when this is returned.
    #[error("group {group} blocked: {} member(s) without confirmed delivery", .blocked.len())]
    GroupPrerequisiteNotMet {
        group: GroupId,
        blocked: Vec<RequestId>,
    },

    /// Group deletion attempted after at least one member was delivered.
    #[error("group {group} cannot be deleted: {blocked_count} member(s) already delivered")]
    DeletionBlocked {
        group: GroupId,
        blocked_count: usize,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow (storage backends wrap driver errors here).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LayoverError {
    /// Shorthand for a field-level validation error.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        LayoverError::Validation {
            field,
            message: message.into(),
        }
    }
}
