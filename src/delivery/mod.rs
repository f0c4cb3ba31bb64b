//! Delivery tracker - per-request notification state.
//!
//! A request's notification reaches the approver one of two mutually
//! exclusive ways: the system sends it through the mail provider
//! (automatic), or the owner sends it themselves and confirms having done
//! so (manual). The tracker records outcomes on the request; transient
//! provider failures are absorbed into the record's delivery fields, never
//! surfaced as errors, so a provider outage cannot lose a submitted
//! request.
//!
//! These methods are the only mutation points for delivery fields.

use chrono::{DateTime, Utc};

use crate::error::{LayoverError, Result};
use crate::request::{DeliveryMode, DeliveryState, Request, RequestStatus};

impl Request {
    /// Derive the notification state from the mode and stored fields.
    ///
    /// Never stored; recomputed on demand.
    pub fn delivery_state(&self) -> DeliveryState {
        match self.delivery_mode {
            DeliveryMode::Automatic => {
                if self.delivery_failed {
                    DeliveryState::Failed
                } else if self.delivery_sent_at.is_some() {
                    DeliveryState::Sent
                } else {
                    DeliveryState::NotSent
                }
            }
            DeliveryMode::Manual => {
                if self.manual_confirmed {
                    DeliveryState::ReadyManual
                } else {
                    DeliveryState::PendingManual
                }
            }
        }
    }

    /// True when the notification is confirmed delivered.
    pub fn delivery_confirmed(&self) -> bool {
        self.delivery_state().is_confirmed()
    }

    /// Record a successful provider send: sent timestamp and provider ids
    /// are set, any earlier failure fields are cleared. Success and failure
    /// are never both set.
    pub fn record_send_success(
        &mut self,
        provider_message_id: &str,
        provider_thread_id: &str,
        at: DateTime<Utc>,
    ) {
        self.delivery_sent_at = Some(at);
        self.provider_message_id = Some(provider_message_id.to_string());
        self.provider_thread_id = Some(provider_thread_id.to_string());
        self.delivery_failed = false;
        self.delivery_failure_reason = None;
        self.delivery_failed_at = None;
    }

    /// Record a failed provider send: failure fields and timestamp are set,
    /// any earlier success fields are cleared.
    pub fn record_send_failure(&mut self, reason: &str, at: DateTime<Utc>) {
        self.delivery_failed = true;
        self.delivery_failure_reason = Some(reason.to_string());
        self.delivery_failed_at = Some(at);
        self.delivery_sent_at = None;
        self.provider_message_id = None;
        self.provider_thread_id = None;
    }

    /// Record the owner's confirmation that they sent the mail themselves.
    ///
    /// Only valid in manual mode. Functionally equals an automatic send
    /// success for gating purposes; the sent timestamp is stamped so both
    /// paths expose the same "when was this delivered" answer. Repeated
    /// confirmation keeps the original timestamp.
    pub fn confirm_manual(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.delivery_mode != DeliveryMode::Manual {
            return Err(LayoverError::validation(
                "delivery_mode",
                "manual confirmation only applies to manual-mode requests",
            ));
        }
        if self.manual_confirmed {
            return Ok(());
        }
        self.manual_confirmed = true;
        self.delivery_sent_at = Some(at);
        Ok(())
    }

    /// True when the transport collaborator may retry the send: automatic
    /// mode, last attempt failed, and no decision has been made yet.
    pub fn can_resend(&self) -> bool {
        self.delivery_mode == DeliveryMode::Automatic
            && self.delivery_failed
            && self.status == RequestStatus::Pending
    }

    /// Reset the failure fields ahead of a retry, returning the request to
    /// the not-sent state. Callers check [`Request::can_resend`] first.
    pub(crate) fn reset_for_resend(&mut self) {
        self.delivery_failed = false;
        self.delivery_failure_reason = None;
        self.delivery_failed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OwnerId, RequestDraft, RequestType};
    use uuid::Uuid;

    fn request(mode: DeliveryMode) -> Request {
        let draft = RequestDraft {
            start_date: "2025-05-01".parse().unwrap(),
            end_date: "2025-05-01".parse().unwrap(),
            request_type: RequestType::DayOff,
            flight_reference: None,
            note: None,
        };
        Request::new_single(OwnerId(Uuid::new_v4()), &draft, mode, Utc::now())
    }

    #[test]
    fn success_and_failure_are_mutually_exclusive() {
        let mut r = request(DeliveryMode::Automatic);

        r.record_send_failure("provider timeout", Utc::now());
        assert_eq!(r.delivery_state(), DeliveryState::Failed);
        assert!(r.delivery_failed_at.is_some());
        assert!(r.delivery_sent_at.is_none());

        r.record_send_success("msg-1", "thread-1", Utc::now());
        assert_eq!(r.delivery_state(), DeliveryState::Sent);
        assert!(!r.delivery_failed);
        assert!(r.delivery_failure_reason.is_none());
        assert!(r.delivery_failed_at.is_none());
        assert_eq!(r.provider_message_id.as_deref(), Some("msg-1"));

        r.record_send_failure("bounced", Utc::now());
        assert!(r.delivery_sent_at.is_none());
        assert!(r.provider_message_id.is_none());
        assert!(r.provider_thread_id.is_none());
    }

    #[test]
    fn manual_confirmation_rules() {
        let mut automatic = request(DeliveryMode::Automatic);
        assert!(automatic.confirm_manual(Utc::now()).is_err());

        let mut manual = request(DeliveryMode::Manual);
        assert_eq!(manual.delivery_state(), DeliveryState::PendingManual);

        manual.confirm_manual(Utc::now()).unwrap();
        assert_eq!(manual.delivery_state(), DeliveryState::ReadyManual);
        assert!(manual.delivery_confirmed());

        // repeated confirmation keeps the first timestamp
        let first = manual.delivery_sent_at;
        manual.confirm_manual(Utc::now()).unwrap();
        assert_eq!(manual.delivery_sent_at, first);
    }

    #[test]
    fn resend_only_for_failed_pending_automatic() {
        let mut r = request(DeliveryMode::Automatic);
        assert!(!r.can_resend());

        r.record_send_failure("timeout", Utc::now());
        assert!(r.can_resend());

        r.apply_status(RequestStatus::Denied, "admin_override", Utc::now());
        assert!(!r.can_resend());

        let mut manual = request(DeliveryMode::Manual);
        manual.delivery_failed = true;
        assert!(!manual.can_resend());
    }
}
