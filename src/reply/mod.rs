//! Inbound reply records and the review queue surface.
//!
//! Replies are created by an external ingestion collaborator when the
//! inbox poller discovers a new message on a request's thread. They are an
//! audit trail: mutated exactly once when processed, never deleted.

pub mod classifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::{Request, RequestId, RequestStatus};

/// Unique identifier for an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyId(pub Uuid);

impl std::fmt::Display for ReplyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for ReplyId {
    fn from(uuid: Uuid) -> Self {
        ReplyId(uuid)
    }
}

impl std::ops::Deref for ReplyId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// An inbound reply on a request's mail thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub id: ReplyId,
    pub request_id: RequestId,
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub from_address: String,
    pub snippet: String,
    pub full_text: String,
    pub received_at: DateTime<Utc>,

    /// Once true, reprocessing is a no-op returning the stored result.
    pub is_processed: bool,
    /// The status the reply resolved to; `None` for replies that could not
    /// be classified and await a human decision.
    pub resolved_status: Option<RequestStatus>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Provenance of the resolution ("auto_reply_detection", or the acting
    /// user for manual resolutions).
    pub processed_by: Option<String>,
}

impl ReplyRecord {
    /// True when the reply was consumed but left for a human decision.
    pub fn needs_review(&self) -> bool {
        self.is_processed && self.resolved_status.is_none()
    }
}

/// Reply data handed over by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReply {
    pub request_id: RequestId,
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub from_address: String,
    pub snippet: String,
    pub full_text: String,
    pub received_at: DateTime<Utc>,
}

impl NewReply {
    pub(crate) fn into_record(self) -> ReplyRecord {
        ReplyRecord {
            id: ReplyId(Uuid::new_v4()),
            request_id: self.request_id,
            provider_message_id: self.provider_message_id,
            provider_thread_id: self.provider_thread_id,
            from_address: self.from_address,
            snippet: self.snippet,
            full_text: self.full_text,
            received_at: self.received_at,
            is_processed: false,
            resolved_status: None,
            processed_at: None,
            processed_by: None,
        }
    }
}

/// Filter for listing an owner's replies.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReplyFilter {
    /// Restrict to processed (`Some(true)`) or unprocessed (`Some(false)`).
    pub processed: Option<bool>,
    /// When true, only replies awaiting a human decision.
    pub needs_review: bool,
}

impl ReplyFilter {
    pub fn matches(&self, reply: &ReplyRecord) -> bool {
        if let Some(processed) = self.processed {
            if reply.is_processed != processed {
                return false;
            }
        }
        if self.needs_review && !reply.needs_review() {
            return false;
        }
        true
    }
}

/// Outcome of processing one reply. Re-processing an already processed
/// reply returns the stored outcome with `already_processed` set and no
/// side effects.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub reply_id: ReplyId,
    pub request_id: RequestId,
    pub resolved_status: Option<RequestStatus>,
    /// Whether this call applied a status transition.
    pub transitioned: bool,
    pub needs_review: bool,
    pub already_processed: bool,
}

/// A reply message prepared for the transport collaborator to send.
///
/// Only available for automatic-mode requests: the system owns the mail
/// thread there and can address the original sender.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundResponse {
    pub reply_id: ReplyId,
    pub request_id: RequestId,
    pub to: String,
    pub provider_thread_id: Option<String>,
    /// Provider message id of the reply being answered.
    pub in_reply_to: String,
    pub body: String,
}

impl Request {
    /// Should the inbox poller re-scan this request's thread?
    ///
    /// True when the notification went out, no reply has arrived, and the
    /// last scan is absent or older than the re-check interval.
    pub fn needs_reply_check(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        if !matches!(self.delivery_state(), crate::request::DeliveryState::Sent) {
            return false;
        }
        if self.reply_received_at.is_some() {
            return false;
        }
        match self.reply_checked_at {
            None => true,
            Some(checked_at) => now - checked_at >= interval,
        }
    }
}
