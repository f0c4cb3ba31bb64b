//! Main trait for the request lifecycle engine.
//!
//! This module defines the `Storage` trait. Backends implement the required
//! low-level persistence methods; the lifecycle operations (creation,
//! delivery tracking, status transitions, reply processing) are default
//! methods built on top of them, so the gating and atomicity rules live in
//! one place regardless of backend.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::config::RequestPolicy;
use crate::error::{LayoverError, Result};
use crate::reply::classifier;
use crate::reply::{NewReply, OutboundResponse, ProcessOutcome, ReplyFilter, ReplyId, ReplyRecord};
use crate::request::{
    DeliveryMode, DeliveryState, GroupDraft, GroupId, OwnerId, Request, RequestDraft, RequestId,
    RequestStatus, delivery_gate, group_delivery_gate,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Result of a status update, single or group-wide.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    /// Number of requests actually mutated. A same-status update is an
    /// idempotent no-op and reports zero.
    pub updated_count: u64,
    pub status: RequestStatus,
}

/// Result of deleting a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupDeletion {
    pub deleted_count: u64,
}

/// Storage trait for persisting requests and replies, plus the lifecycle
/// operations implemented as default methods.
///
/// # Atomicity contract for implementors
///
/// - `insert_requests` persists all records or none.
/// - `apply_group_status` mutates every group member in a single
///   transaction or lock scope; no concurrent reader may observe a
///   partially updated group.
/// - `mark_reply_processed` is an atomic check-and-set on `is_processed`:
///   it returns `true` for exactly one caller per reply.
#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Required low-level methods
    // ------------------------------------------------------------------

    /// The validation/classification policy this backend was built with.
    fn policy(&self) -> &RequestPolicy;

    /// The owner's current delivery-mode preference (default: automatic).
    async fn owner_delivery_mode(&self, owner: OwnerId) -> Result<DeliveryMode>;

    /// Update the owner's delivery-mode preference. Historical requests
    /// keep the mode frozen onto them at creation time.
    async fn set_owner_delivery_mode(&self, owner: OwnerId, mode: DeliveryMode) -> Result<()>;

    /// Persist a batch of freshly created requests, all-or-nothing.
    async fn insert_requests(&self, requests: &[Request]) -> Result<()>;

    /// Get a request by id.
    async fn get_request(&self, id: RequestId) -> Result<Request>;

    /// Get all members of a group. An unknown group yields an empty vec.
    async fn get_group(&self, group_id: GroupId) -> Result<Vec<Request>>;

    /// List an owner's requests, ordered by start date.
    async fn list_requests(&self, owner: OwnerId) -> Result<Vec<Request>>;

    /// Pending/approved requests of the owner whose [start, end] range
    /// overlaps the given one, optionally excluding a group (for in-place
    /// edits of that group).
    async fn find_overlapping(
        &self,
        owner: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        exclude_group: Option<GroupId>,
    ) -> Result<Vec<Request>>;

    /// Update an existing request's record in storage.
    async fn persist(&self, request: &Request) -> Result<()>;

    /// Atomically set the status (and provenance fields) of every member
    /// of a group. Returns the number of members updated.
    async fn apply_group_status(
        &self,
        group_id: GroupId,
        status: RequestStatus,
        method: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete all members of an owner's group, returning the count.
    /// Callers check the deletion gate first.
    async fn remove_group(&self, owner: OwnerId, group_id: GroupId) -> Result<u64>;

    /// Requests whose notification was sent automatically and which have
    /// no reply recorded yet (candidates for inbox re-scans).
    async fn list_sent_unreplied(&self) -> Result<Vec<Request>>;

    /// Persist a freshly ingested reply.
    async fn insert_reply(&self, reply: &ReplyRecord) -> Result<()>;

    /// Get a reply by id.
    async fn get_reply(&self, id: ReplyId) -> Result<ReplyRecord>;

    /// List replies on the owner's requests, newest first.
    async fn list_replies(&self, owner: OwnerId, filter: ReplyFilter) -> Result<Vec<ReplyRecord>>;

    /// Number of unprocessed replies on the owner's requests.
    async fn count_unprocessed_replies(&self, owner: OwnerId) -> Result<u64>;

    /// Atomic check-and-set: mark the reply processed with the given
    /// resolution iff it is not processed yet. Returns whether this call
    /// won the race.
    async fn mark_reply_processed(
        &self,
        id: ReplyId,
        resolved: Option<RequestStatus>,
        processed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Update an existing reply's record in storage.
    async fn persist_reply(&self, reply: &ReplyRecord) -> Result<()>;

    // ------------------------------------------------------------------
    // Request store operations
    // ------------------------------------------------------------------

    /// Get a request, resolving foreign ownership as not-found so record
    /// existence is never disclosed across owners.
    async fn owned_request(&self, owner: OwnerId, id: RequestId) -> Result<Request> {
        let request = self.get_request(id).await?;
        if request.owner_id != owner {
            return Err(LayoverError::RequestNotFound(id));
        }
        Ok(request)
    }

    /// Create a single request: validate, conflict-check, freeze the
    /// owner's current delivery mode, persist.
    #[tracing::instrument(skip(self, draft), fields(owner = %owner))]
    async fn create_request(&self, owner: OwnerId, draft: RequestDraft) -> Result<Request> {
        draft.validate(self.policy())?;

        let conflicting = self
            .find_overlapping(owner, draft.start_date, draft.end_date, None)
            .await?;
        if !conflicting.is_empty() {
            return Err(LayoverError::Conflict {
                conflicting: conflicting.into_iter().map(|r| r.id).collect(),
            });
        }

        let mode = self.owner_delivery_mode(owner).await?;
        let request = Request::new_single(owner, &draft, mode, Utc::now());
        self.insert_requests(std::slice::from_ref(&request)).await?;

        counter!("layover_requests_created_total", "mode" => mode.as_str()).increment(1);
        tracing::info!(
            request_id = %request.id,
            start = %request.start_date,
            end = %request.end_date,
            "created request"
        );
        Ok(request)
    }

    /// Create a grouped multi-day submission as one all-or-nothing unit.
    /// Every member shares one group id and the mode frozen at creation.
    #[tracing::instrument(skip(self, draft), fields(owner = %owner, days = draft.days.len()))]
    async fn create_group(&self, owner: OwnerId, draft: GroupDraft) -> Result<Vec<Request>> {
        draft.validate(self.policy())?;

        for day in &draft.days {
            let conflicting = self
                .find_overlapping(owner, day.date, day.date, None)
                .await?;
            if !conflicting.is_empty() {
                return Err(LayoverError::Conflict {
                    conflicting: conflicting.into_iter().map(|r| r.id).collect(),
                });
            }
        }

        let mode = self.owner_delivery_mode(owner).await?;
        let group_id = GroupId(Uuid::new_v4());
        let now = Utc::now();
        let members: Vec<Request> = draft
            .days
            .iter()
            .map(|day| {
                Request::new_group_member(owner, group_id, day, draft.note.as_deref(), mode, now)
            })
            .collect();

        self.insert_requests(&members).await?;

        counter!("layover_requests_created_total", "mode" => mode.as_str())
            .increment(members.len() as u64);
        tracing::info!(group_id = %group_id, members = members.len(), "created group");
        Ok(members)
    }

    /// Symmetric interval-overlap query over the owner's pending/approved
    /// requests.
    async fn conflicts(
        &self,
        owner: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        exclude_group: Option<GroupId>,
    ) -> Result<Vec<Request>> {
        if end < start {
            return Err(LayoverError::validation(
                "end_date",
                format!("end date {end} precedes start date {start}"),
            ));
        }
        self.find_overlapping(owner, start, end, exclude_group).await
    }

    /// Delete a whole group, permitted only while no member has a
    /// confirmed delivery.
    #[tracing::instrument(skip(self), fields(owner = %owner, group_id = %group_id))]
    async fn delete_group(&self, owner: OwnerId, group_id: GroupId) -> Result<GroupDeletion> {
        let members = self.get_group(group_id).await?;
        if members.is_empty() || members.iter().any(|m| m.owner_id != owner) {
            return Err(LayoverError::GroupNotFound(group_id));
        }

        let blocked_count = members.iter().filter(|m| m.delivery_confirmed()).count();
        if blocked_count > 0 {
            return Err(LayoverError::DeletionBlocked {
                group: group_id,
                blocked_count,
            });
        }

        let deleted_count = self.remove_group(owner, group_id).await?;
        tracing::info!(deleted_count, "deleted group");
        Ok(GroupDeletion { deleted_count })
    }

    // ------------------------------------------------------------------
    // Delivery tracker operations
    // ------------------------------------------------------------------

    /// Record a successful provider send reported by the transport
    /// collaborator. Repeating an identical report is a no-op.
    async fn record_send_success(
        &self,
        id: RequestId,
        provider_message_id: &str,
        provider_thread_id: &str,
    ) -> Result<Request> {
        let mut request = self.get_request(id).await?;

        let already_recorded = request.delivery_sent_at.is_some()
            && request.provider_message_id.as_deref() == Some(provider_message_id)
            && request.provider_thread_id.as_deref() == Some(provider_thread_id);
        if already_recorded {
            return Ok(request);
        }

        request.record_send_success(provider_message_id, provider_thread_id, Utc::now());
        self.persist(&request).await?;

        counter!("layover_delivery_total", "outcome" => "sent").increment(1);
        tracing::debug!(request_id = %id, "recorded send success");
        Ok(request)
    }

    /// Record a failed provider send. The failure is absorbed into the
    /// record's delivery fields, never raised as an error, so a transient
    /// outage cannot lose the submitted request. Repeating an identical
    /// report is a no-op.
    async fn record_send_failure(&self, id: RequestId, reason: &str) -> Result<Request> {
        let mut request = self.get_request(id).await?;

        if request.delivery_failed && request.delivery_failure_reason.as_deref() == Some(reason) {
            return Ok(request);
        }

        request.record_send_failure(reason, Utc::now());
        self.persist(&request).await?;

        counter!("layover_delivery_total", "outcome" => "failed").increment(1);
        tracing::warn!(request_id = %id, reason, "recorded send failure");
        Ok(request)
    }

    /// The owner confirms having sent the notification themselves.
    /// Manual-mode requests only; idempotent.
    async fn confirm_manual(&self, owner: OwnerId, id: RequestId) -> Result<Request> {
        let mut request = self.owned_request(owner, id).await?;
        if request.manual_confirmed {
            return Ok(request);
        }
        request.confirm_manual(Utc::now())?;
        self.persist(&request).await?;

        counter!("layover_delivery_total", "outcome" => "manual_confirmed").increment(1);
        tracing::debug!(request_id = %id, "manual delivery confirmed");
        Ok(request)
    }

    /// Clear the failure fields of a failed automatic send so the
    /// transport collaborator may retry. Valid only while the request is
    /// pending; calling again before the retry happened is a no-op.
    async fn resend(&self, owner: OwnerId, id: RequestId) -> Result<Request> {
        let mut request = self.owned_request(owner, id).await?;

        if request.can_resend() {
            request.reset_for_resend();
            self.persist(&request).await?;
            counter!("layover_delivery_total", "outcome" => "resend").increment(1);
            tracing::info!(request_id = %id, "reset for resend");
            return Ok(request);
        }

        if matches!(request.delivery_state(), DeliveryState::NotSent) {
            // Already reset (or never attempted); nothing to do.
            return Ok(request);
        }

        Err(LayoverError::validation(
            "delivery",
            format!(
                "resend not available (mode: {}, delivery state: {}, status: {})",
                request.delivery_mode.as_str(),
                request.delivery_state(),
                request.status
            ),
        ))
    }

    // ------------------------------------------------------------------
    // Status state machine operations
    // ------------------------------------------------------------------

    /// System-level status transition on one request.
    ///
    /// Same-status updates are idempotent no-ops. All other transitions
    /// pass the delivery gate or fail `PrerequisiteNotMet`.
    async fn transition_request(
        &self,
        id: RequestId,
        new_status: RequestStatus,
        method: &str,
    ) -> Result<StatusUpdate> {
        let mut request = self.get_request(id).await?;

        if request.status == new_status {
            return Ok(StatusUpdate {
                updated_count: 0,
                status: new_status,
            });
        }

        delivery_gate(&request)?;
        request.apply_status(new_status, method, Utc::now());
        self.persist(&request).await?;

        counter!(
            "layover_status_transitions_total",
            "status" => new_status.as_str(),
            "method" => method.to_string()
        )
        .increment(1);
        tracing::info!(request_id = %id, status = %new_status, method, "status updated");
        Ok(StatusUpdate {
            updated_count: 1,
            status: new_status,
        })
    }

    /// System-level group-atomic status transition.
    ///
    /// Two-phase: the delivery gate is validated for every member before
    /// any member is mutated; the apply phase is a single atomic storage
    /// mutation. On gate failure no member changes and the error names the
    /// blocking members.
    async fn transition_group(
        &self,
        group_id: GroupId,
        new_status: RequestStatus,
        method: &str,
    ) -> Result<StatusUpdate> {
        let members = self.get_group(group_id).await?;
        if members.is_empty() {
            return Err(LayoverError::GroupNotFound(group_id));
        }

        group_delivery_gate(group_id, &members)?;

        let updated_count = self
            .apply_group_status(group_id, new_status, method, Utc::now())
            .await?;

        counter!(
            "layover_status_transitions_total",
            "status" => new_status.as_str(),
            "method" => method.to_string()
        )
        .increment(updated_count);
        tracing::info!(
            group_id = %group_id,
            status = %new_status,
            updated_count,
            method,
            "group status updated"
        );
        Ok(StatusUpdate {
            updated_count,
            status: new_status,
        })
    }

    /// Owner-facing status update. With `update_group` the change
    /// escalates to the request's whole group.
    async fn update_status(
        &self,
        owner: OwnerId,
        id: RequestId,
        new_status: RequestStatus,
        method: Option<&str>,
        update_group: bool,
    ) -> Result<StatusUpdate> {
        let request = self.owned_request(owner, id).await?;
        let method = method.unwrap_or("manual_user_update");

        if update_group {
            self.transition_group(request.group_id, new_status, method)
                .await
        } else {
            self.transition_request(id, new_status, method).await
        }
    }

    /// Owner-facing group status update.
    async fn update_group_status(
        &self,
        owner: OwnerId,
        group_id: GroupId,
        new_status: RequestStatus,
        method: Option<&str>,
    ) -> Result<StatusUpdate> {
        let members = self.get_group(group_id).await?;
        if members.is_empty() || members.iter().any(|m| m.owner_id != owner) {
            return Err(LayoverError::GroupNotFound(group_id));
        }
        self.transition_group(group_id, new_status, method.unwrap_or("manual_user_update"))
            .await
    }

    // ------------------------------------------------------------------
    // Reply operations
    // ------------------------------------------------------------------

    /// Record a reply discovered by the ingestion collaborator, stamping
    /// the owning request's reply fields.
    #[tracing::instrument(skip(self, reply), fields(request_id = %reply.request_id))]
    async fn record_reply_received(&self, reply: NewReply) -> Result<ReplyRecord> {
        let mut request = self.get_request(reply.request_id).await?;

        let record = reply.into_record();
        self.insert_reply(&record).await?;

        request.reply_received_at = Some(record.received_at);
        request.reply_text = Some(record.snippet.clone());
        self.persist(&request).await?;

        counter!("layover_replies_received_total").increment(1);
        tracing::info!(reply_id = %record.id, "reply recorded");
        Ok(record)
    }

    /// Classify a reply and drive the status state machine.
    ///
    /// Idempotent: the processed check-and-set serializes concurrent
    /// calls, and only the winner mutates state. An unambiguous verdict is
    /// applied with method `auto_reply_detection`; anything else (unknown
    /// text, ambiguous match, or an unconfirmed delivery) lands in the
    /// needs-review queue with the request untouched.
    #[tracing::instrument(skip(self), fields(reply_id = %reply_id))]
    async fn process_reply(&self, reply_id: ReplyId) -> Result<ProcessOutcome> {
        let reply = self.get_reply(reply_id).await?;
        if reply.is_processed {
            return Ok(ProcessOutcome {
                reply_id,
                request_id: reply.request_id,
                resolved_status: reply.resolved_status,
                transitioned: false,
                needs_review: reply.needs_review(),
                already_processed: true,
            });
        }

        let request = self.get_request(reply.request_id).await?;
        let verdict = classifier::classify(&self.policy().keywords, &reply.full_text);

        let resolved = match verdict.auto_status() {
            Some(status) if request.status == status => Some(status),
            Some(status) => {
                if request.delivery_confirmed() {
                    Some(status)
                } else {
                    // A reply on a delivery we never confirmed sending is
                    // suspect; leave the decision to a human.
                    tracing::warn!(
                        request_id = %request.id,
                        delivery_state = %request.delivery_state(),
                        "reply classified but delivery unconfirmed, escalating to review"
                    );
                    None
                }
            }
            None => None,
        };

        let now = Utc::now();
        let processed_by = resolved.map(|_| "auto_reply_detection");
        let won = self
            .mark_reply_processed(reply_id, resolved, processed_by, now)
            .await?;
        if !won {
            let stored = self.get_reply(reply_id).await?;
            return Ok(ProcessOutcome {
                reply_id,
                request_id: stored.request_id,
                resolved_status: stored.resolved_status,
                transitioned: false,
                needs_review: stored.needs_review(),
                already_processed: true,
            });
        }

        let mut transitioned = false;
        match resolved {
            Some(status) => {
                let mut request = self.get_request(reply.request_id).await?;
                if request.status != status {
                    request.apply_status(status, "auto_reply_detection", now);
                    transitioned = true;
                }
                request.auto_resolved = true;
                self.persist(&request).await?;

                counter!("layover_replies_auto_resolved_total", "status" => status.as_str())
                    .increment(1);
                tracing::info!(
                    request_id = %reply.request_id,
                    status = %status,
                    transitioned,
                    "reply auto-resolved"
                );
            }
            None => {
                counter!("layover_replies_needs_review_total").increment(1);
                tracing::info!(request_id = %reply.request_id, "reply needs review");
            }
        }

        Ok(ProcessOutcome {
            reply_id,
            request_id: reply.request_id,
            resolved_status: resolved,
            transitioned,
            needs_review: resolved.is_none(),
            already_processed: false,
        })
    }

    /// Human decision on a reply the classifier could not resolve (or that
    /// was never processed). Applies the transition with method
    /// `manual_user_update` and records who decided.
    async fn resolve_reply(
        &self,
        owner: OwnerId,
        reply_id: ReplyId,
        status: RequestStatus,
    ) -> Result<ProcessOutcome> {
        let reply = self.get_reply(reply_id).await?;
        let request = self
            .owned_request(owner, reply.request_id)
            .await
            .map_err(|_| LayoverError::ReplyNotFound(reply_id))?;

        if let Some(resolved) = reply.resolved_status {
            if resolved == status {
                // Repeating an identical decision is a no-op.
                return Ok(ProcessOutcome {
                    reply_id,
                    request_id: reply.request_id,
                    resolved_status: Some(resolved),
                    transitioned: false,
                    needs_review: false,
                    already_processed: true,
                });
            }
            return Err(LayoverError::validation(
                "reply",
                format!("reply already resolved as {resolved}"),
            ));
        }

        // Transition first: if the gate rejects, the reply stays in the
        // review queue so the decision can be retried after delivery is
        // confirmed.
        let update = self
            .transition_request(request.id, status, "manual_user_update")
            .await?;

        let now = Utc::now();
        let decider = owner.0.to_string();
        let reply_request_id = reply.request_id;
        if reply.is_processed {
            let mut stored = reply;
            stored.resolved_status = Some(status);
            stored.processed_by = Some(decider);
            stored.processed_at = Some(now);
            self.persist_reply(&stored).await?;
        } else {
            let won = self
                .mark_reply_processed(reply_id, Some(status), Some(&decider), now)
                .await?;
            if !won {
                // Lost to a concurrent auto-processing pass; report what
                // is stored now.
                let stored = self.get_reply(reply_id).await?;
                return Ok(ProcessOutcome {
                    reply_id,
                    request_id: stored.request_id,
                    resolved_status: stored.resolved_status,
                    transitioned: update.updated_count > 0,
                    needs_review: stored.needs_review(),
                    already_processed: true,
                });
            }
        }

        tracing::info!(reply_id = %reply_id, status = %status, "reply resolved by user");
        Ok(ProcessOutcome {
            reply_id,
            request_id: reply_request_id,
            resolved_status: Some(status),
            transitioned: update.updated_count > 0,
            needs_review: false,
            already_processed: false,
        })
    }

    /// Prepare an in-thread answer to a reply for the transport
    /// collaborator. Requires the owning request to be in automatic mode:
    /// only then does the system own the mail thread.
    async fn prepare_response(
        &self,
        owner: OwnerId,
        reply_id: ReplyId,
        message: &str,
    ) -> Result<OutboundResponse> {
        let reply = self.get_reply(reply_id).await?;
        let request = self
            .owned_request(owner, reply.request_id)
            .await
            .map_err(|_| LayoverError::ReplyNotFound(reply_id))?;

        if request.delivery_mode != DeliveryMode::Automatic {
            return Err(LayoverError::validation(
                "delivery_mode",
                "responding in-thread requires automatic delivery mode",
            ));
        }

        Ok(OutboundResponse {
            reply_id,
            request_id: request.id,
            to: reply.from_address.clone(),
            provider_thread_id: reply
                .provider_thread_id
                .clone()
                .or_else(|| request.provider_thread_id.clone()),
            in_reply_to: reply.provider_message_id.clone(),
            body: message.to_string(),
        })
    }

    /// Sent requests with no reply yet whose last inbox scan is absent or
    /// stale. Consumed by the external poller to decide what to re-scan.
    async fn requests_needing_reply_check(&self, now: DateTime<Utc>) -> Result<Vec<Request>> {
        let interval = self.policy().reply_recheck_interval();
        let candidates = self.list_sent_unreplied().await?;
        Ok(candidates
            .into_iter()
            .filter(|request| request.needs_reply_check(now, interval))
            .collect())
    }

    /// Stamp an inbox scan on a request so it is not re-checked before the
    /// interval elapses.
    async fn record_reply_check(&self, id: RequestId, now: DateTime<Utc>) -> Result<()> {
        let mut request = self.get_request(id).await?;
        request.reply_checked_at = Some(now);
        self.persist(&request).await
    }
}
