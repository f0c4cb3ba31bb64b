//! Reply ingestion, classification and idempotent processing.

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use layover::manager::memory::MemoryRequestManager;
use layover::manager::Storage;
use layover::{
    DeliveryMode, LayoverError, NewReply, OwnerId, Request, RequestDraft, RequestStatus,
    RequestType, ReplyFilter,
};

fn owner() -> OwnerId {
    OwnerId(Uuid::new_v4())
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn day_off(start: &str) -> RequestDraft {
    RequestDraft {
        start_date: date(start),
        end_date: date(start),
        request_type: RequestType::DayOff,
        flight_reference: None,
        note: None,
    }
}

/// Create a request whose notification already went out.
async fn sent_request(manager: &MemoryRequestManager, owner: OwnerId, start: &str) -> Request {
    let request = manager.create_request(owner, day_off(start)).await.unwrap();
    manager
        .record_send_success(request.id, &format!("m-{}", request.id), "t-1")
        .await
        .unwrap()
}

fn reply_to(request: &Request, text: &str) -> NewReply {
    NewReply {
        request_id: request.id,
        provider_message_id: format!("reply-{}", Uuid::new_v4()),
        provider_thread_id: request.provider_thread_id.clone(),
        from_address: "chief.pilot@example.com".to_string(),
        snippet: text.chars().take(80).collect(),
        full_text: text.to_string(),
        received_at: Utc::now(),
    }
}

#[test_log::test(tokio::test)]
async fn approval_reply_resolves_the_request() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "Approved, please proceed"))
        .await
        .unwrap();

    let outcome = manager.process_reply(reply.id).await.unwrap();
    assert_eq!(outcome.resolved_status, Some(RequestStatus::Approved));
    assert!(outcome.transitioned);
    assert!(!outcome.needs_review);
    assert!(!outcome.already_processed);

    let stored = manager.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Approved);
    assert!(stored.auto_resolved);
    assert!(stored.reply_received_at.is_some());
    assert_eq!(
        stored.status_change_method.as_deref(),
        Some("auto_reply_detection")
    );
}

#[tokio::test]
async fn denial_reply_resolves_the_request() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "Denied due to staffing"))
        .await
        .unwrap();

    let outcome = manager.process_reply(reply.id).await.unwrap();
    assert_eq!(outcome.resolved_status, Some(RequestStatus::Denied));

    let stored = manager.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Denied);
}

#[test_log::test(tokio::test)]
async fn processing_is_idempotent() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "Approved"))
        .await
        .unwrap();

    let first = manager.process_reply(reply.id).await.unwrap();
    let second = manager.process_reply(reply.id).await.unwrap();

    assert_eq!(first.resolved_status, second.resolved_status);
    assert!(first.transitioned);
    assert!(second.already_processed);
    assert!(!second.transitioned, "the transition applies at most once");

    let stamped = manager.get_request(request.id).await.unwrap().status_changed_at;
    let third = manager.process_reply(reply.id).await.unwrap();
    assert!(third.already_processed);
    assert_eq!(
        manager.get_request(request.id).await.unwrap().status_changed_at,
        stamped,
        "reprocessing must not restamp the decision"
    );
}

#[tokio::test]
async fn unknown_reply_lands_in_review_queue() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "Let me get back to you next week"))
        .await
        .unwrap();

    let outcome = manager.process_reply(reply.id).await.unwrap();
    assert_eq!(outcome.resolved_status, None);
    assert!(outcome.needs_review);
    assert!(!outcome.transitioned);

    let stored = manager.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Pending, "request untouched");
    assert!(!stored.auto_resolved);

    let queue = manager
        .list_replies(
            owner,
            ReplyFilter {
                processed: None,
                needs_review: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, reply.id);
}

#[tokio::test]
async fn ambiguous_reply_is_never_auto_applied() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(
            &request,
            "Approved for Monday but denied for the rest",
        ))
        .await
        .unwrap();

    let outcome = manager.process_reply(reply.id).await.unwrap();
    assert!(outcome.needs_review);
    assert_eq!(outcome.resolved_status, None);

    let stored = manager.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Pending);
}

#[tokio::test]
async fn human_decision_resolves_a_reviewed_reply() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let request = sent_request(&manager, owner, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "hmm"))
        .await
        .unwrap();
    manager.process_reply(reply.id).await.unwrap();

    let outcome = manager
        .resolve_reply(owner, reply.id, RequestStatus::Approved)
        .await
        .unwrap();
    assert!(outcome.transitioned);
    assert_eq!(outcome.resolved_status, Some(RequestStatus::Approved));

    let stored_request = manager.get_request(request.id).await.unwrap();
    assert_eq!(stored_request.status, RequestStatus::Approved);
    assert_eq!(
        stored_request.status_change_method.as_deref(),
        Some("manual_user_update")
    );

    let stored_reply = manager.get_reply(reply.id).await.unwrap();
    assert_eq!(stored_reply.resolved_status, Some(RequestStatus::Approved));
    assert_eq!(
        stored_reply.processed_by.as_deref(),
        Some(owner.0.to_string().as_str())
    );

    // Repeating the identical decision is a no-op...
    let again = manager
        .resolve_reply(owner, reply.id, RequestStatus::Approved)
        .await
        .unwrap();
    assert!(again.already_processed);

    // ...while a contradicting one is rejected.
    let err = manager
        .resolve_reply(owner, reply.id, RequestStatus::Denied)
        .await
        .unwrap_err();
    assert!(matches!(err, LayoverError::Validation { .. }));
}

#[tokio::test]
async fn reply_surface_is_owner_scoped() {
    let manager = MemoryRequestManager::new();
    let owner_a = owner();
    let owner_b = owner();
    let request = sent_request(&manager, owner_a, "2025-07-01").await;

    let reply = manager
        .record_reply_received(reply_to(&request, "Approved"))
        .await
        .unwrap();

    assert!(
        manager
            .list_replies(owner_b, ReplyFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(manager.count_unprocessed_replies(owner_a).await.unwrap(), 1);
    assert_eq!(manager.count_unprocessed_replies(owner_b).await.unwrap(), 0);

    let err = manager
        .resolve_reply(owner_b, reply.id, RequestStatus::Approved)
        .await
        .unwrap_err();
    assert!(matches!(err, LayoverError::ReplyNotFound(_)));

    let err = manager
        .prepare_response(owner_b, reply.id, "thanks!")
        .await
        .unwrap_err();
    assert!(matches!(err, LayoverError::ReplyNotFound(_)));
}

#[tokio::test]
async fn respond_requires_automatic_mode() {
    let manager = MemoryRequestManager::new();
    let owner = owner();

    // Automatic mode: the system owns the thread and can answer in it.
    let request = sent_request(&manager, owner, "2025-07-01").await;
    let reply = manager
        .record_reply_received(reply_to(&request, "Can you swap with Kim instead?"))
        .await
        .unwrap();

    let outbound = manager
        .prepare_response(owner, reply.id, "Kim is on rest days then.")
        .await
        .unwrap();
    assert_eq!(outbound.to, "chief.pilot@example.com");
    assert_eq!(outbound.in_reply_to, reply.provider_message_id);
    assert_eq!(outbound.provider_thread_id.as_deref(), Some("t-1"));

    // Manual mode: the thread lives in the owner's own mailbox.
    manager
        .set_owner_delivery_mode(owner, DeliveryMode::Manual)
        .await
        .unwrap();
    let manual = manager
        .create_request(owner, day_off("2025-08-01"))
        .await
        .unwrap();
    manager.confirm_manual(owner, manual.id).await.unwrap();
    let manual_reply = manager
        .record_reply_received(reply_to(&manual, "ok"))
        .await
        .unwrap();

    let err = manager
        .prepare_response(owner, manual_reply.id, "thanks")
        .await
        .unwrap_err();
    assert!(matches!(err, LayoverError::Validation { field: "delivery_mode", .. }));
}

#[tokio::test]
async fn poller_schedule_respects_recheck_interval() {
    let manager = MemoryRequestManager::new();
    let owner = owner();
    let now = Utc::now();

    let sent = sent_request(&manager, owner, "2025-07-01").await;
    let unsent = manager
        .create_request(owner, day_off("2025-08-01"))
        .await
        .unwrap();

    let due = manager.requests_needing_reply_check(now).await.unwrap();
    assert_eq!(due.len(), 1, "only sent, reply-less requests are scanned");
    assert_eq!(due[0].id, sent.id);
    assert!(!due.iter().any(|r| r.id == unsent.id));

    // A fresh scan removes it from the schedule until the interval passes.
    manager.record_reply_check(sent.id, now).await.unwrap();
    assert!(manager.requests_needing_reply_check(now).await.unwrap().is_empty());

    let later = now + manager.policy().reply_recheck_interval();
    assert_eq!(manager.requests_needing_reply_check(later).await.unwrap().len(), 1);

    // Once a reply arrives the request leaves the schedule for good.
    manager
        .record_reply_received(reply_to(&sent, "Approved"))
        .await
        .unwrap();
    assert!(manager.requests_needing_reply_check(later).await.unwrap().is_empty());
}
