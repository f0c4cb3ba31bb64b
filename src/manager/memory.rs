//! In-memory implementation of the Storage trait.
//!
//! Used by the test suite and for embedding without a database. Every
//! operation runs under a single mutex and never awaits while holding it,
//! which gives the same atomicity guarantees the SQL backend gets from
//! transactions: group mutations happen in one lock scope and the reply
//! check-and-set is serialized.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::Storage;
use crate::config::RequestPolicy;
use crate::error::{LayoverError, Result};
use crate::reply::{ReplyFilter, ReplyId, ReplyRecord};
use crate::request::{
    DeliveryMode, DeliveryState, GroupId, OwnerId, Request, RequestId, RequestStatus,
    ranges_overlap,
};

/// In-memory request manager.
///
/// # Example
/// ```
/// use layover::manager::memory::MemoryRequestManager;
/// use layover::config::RequestPolicy;
///
/// let manager = MemoryRequestManager::new()
///     .with_policy(RequestPolicy::default());
/// ```
pub struct MemoryRequestManager {
    policy: RequestPolicy,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, Request>,
    replies: HashMap<ReplyId, ReplyRecord>,
    owner_modes: HashMap<OwnerId, DeliveryMode>,
}

impl MemoryRequestManager {
    pub fn new() -> Self {
        MemoryRequestManager {
            policy: RequestPolicy::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Set a custom policy. Builder method chained after `new()`.
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test; the data is still
        // consistent because sections are short and infallible mid-way.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRequestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryRequestManager {
    fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    async fn owner_delivery_mode(&self, owner: OwnerId) -> Result<DeliveryMode> {
        Ok(self
            .lock()
            .owner_modes
            .get(&owner)
            .copied()
            .unwrap_or(DeliveryMode::Automatic))
    }

    async fn set_owner_delivery_mode(&self, owner: OwnerId, mode: DeliveryMode) -> Result<()> {
        self.lock().owner_modes.insert(owner, mode);
        Ok(())
    }

    async fn insert_requests(&self, requests: &[Request]) -> Result<()> {
        let mut inner = self.lock();
        // All-or-nothing: verify the whole batch before the first insert.
        for (i, request) in requests.iter().enumerate() {
            if inner.requests.contains_key(&request.id)
                || requests[..i].iter().any(|r| r.id == request.id)
            {
                return Err(LayoverError::validation(
                    "id",
                    format!("request {} already exists", request.id),
                ));
            }
        }
        for request in requests {
            inner.requests.insert(request.id, request.clone());
        }
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        self.lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or(LayoverError::RequestNotFound(id))
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Vec<Request>> {
        let mut members: Vec<Request> = self
            .lock()
            .requests
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by_key(|r| r.start_date);
        Ok(members)
    }

    async fn list_requests(&self, owner: OwnerId) -> Result<Vec<Request>> {
        let mut requests: Vec<Request> = self
            .lock()
            .requests
            .values()
            .filter(|r| r.owner_id == owner)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.start_date);
        Ok(requests)
    }

    async fn find_overlapping(
        &self,
        owner: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        exclude_group: Option<GroupId>,
    ) -> Result<Vec<Request>> {
        let mut overlapping: Vec<Request> = self
            .lock()
            .requests
            .values()
            .filter(|r| r.owner_id == owner)
            .filter(|r| {
                matches!(
                    r.status,
                    RequestStatus::Pending | RequestStatus::Approved
                )
            })
            .filter(|r| exclude_group != Some(r.group_id))
            .filter(|r| ranges_overlap(r.start_date, r.end_date, start, end))
            .cloned()
            .collect();
        overlapping.sort_by_key(|r| r.start_date);
        Ok(overlapping)
    }

    async fn persist(&self, request: &Request) -> Result<()> {
        let mut inner = self.lock();
        match inner.requests.get_mut(&request.id) {
            Some(stored) => {
                *stored = request.clone();
                Ok(())
            }
            None => Err(LayoverError::RequestNotFound(request.id)),
        }
    }

    async fn apply_group_status(
        &self,
        group_id: GroupId,
        status: RequestStatus,
        method: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for request in inner.requests.values_mut() {
            if request.group_id == group_id {
                request.apply_status(status, method, at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn remove_group(&self, owner: OwnerId, group_id: GroupId) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.requests.len();
        inner
            .requests
            .retain(|_, r| !(r.group_id == group_id && r.owner_id == owner));
        Ok((before - inner.requests.len()) as u64)
    }

    async fn list_sent_unreplied(&self) -> Result<Vec<Request>> {
        Ok(self
            .lock()
            .requests
            .values()
            .filter(|r| r.delivery_state() == DeliveryState::Sent)
            .filter(|r| r.reply_received_at.is_none())
            .cloned()
            .collect())
    }

    async fn insert_reply(&self, reply: &ReplyRecord) -> Result<()> {
        let mut inner = self.lock();
        if inner.replies.contains_key(&reply.id) {
            return Err(LayoverError::validation(
                "id",
                format!("reply {} already exists", reply.id),
            ));
        }
        inner.replies.insert(reply.id, reply.clone());
        Ok(())
    }

    async fn get_reply(&self, id: ReplyId) -> Result<ReplyRecord> {
        self.lock()
            .replies
            .get(&id)
            .cloned()
            .ok_or(LayoverError::ReplyNotFound(id))
    }

    async fn list_replies(&self, owner: OwnerId, filter: ReplyFilter) -> Result<Vec<ReplyRecord>> {
        let inner = self.lock();
        let mut replies: Vec<ReplyRecord> = inner
            .replies
            .values()
            .filter(|reply| {
                inner
                    .requests
                    .get(&reply.request_id)
                    .is_some_and(|r| r.owner_id == owner)
            })
            .filter(|reply| filter.matches(reply))
            .cloned()
            .collect();
        replies.sort_by_key(|r| std::cmp::Reverse(r.received_at));
        Ok(replies)
    }

    async fn count_unprocessed_replies(&self, owner: OwnerId) -> Result<u64> {
        let inner = self.lock();
        let count = inner
            .replies
            .values()
            .filter(|reply| !reply.is_processed)
            .filter(|reply| {
                inner
                    .requests
                    .get(&reply.request_id)
                    .is_some_and(|r| r.owner_id == owner)
            })
            .count();
        Ok(count as u64)
    }

    async fn mark_reply_processed(
        &self,
        id: ReplyId,
        resolved: Option<RequestStatus>,
        processed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let reply = inner
            .replies
            .get_mut(&id)
            .ok_or(LayoverError::ReplyNotFound(id))?;
        if reply.is_processed {
            return Ok(false);
        }
        reply.is_processed = true;
        reply.resolved_status = resolved;
        reply.processed_by = processed_by.map(str::to_owned);
        reply.processed_at = Some(at);
        Ok(true)
    }

    async fn persist_reply(&self, reply: &ReplyRecord) -> Result<()> {
        let mut inner = self.lock();
        match inner.replies.get_mut(&reply.id) {
            Some(stored) => {
                *stored = reply.clone();
                Ok(())
            }
            None => Err(LayoverError::ReplyNotFound(reply.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestDraft, RequestType};
    use uuid::Uuid;

    fn draft(start: &str, end: &str) -> RequestDraft {
        RequestDraft {
            start_date: start.parse().unwrap(),
            end_date: end.parse().unwrap(),
            request_type: RequestType::DayOff,
            flight_reference: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn insert_is_all_or_nothing() {
        let manager = MemoryRequestManager::new();
        let owner = OwnerId(Uuid::new_v4());
        let a = Request::new_single(owner, &draft("2025-06-01", "2025-06-01"), DeliveryMode::Automatic, Utc::now());
        let b = a.clone(); // duplicate id

        assert!(manager.insert_requests(&[a.clone(), b]).await.is_err());
        assert!(
            manager.get_request(a.id).await.is_err(),
            "nothing may be inserted when the batch fails"
        );
    }

    #[tokio::test]
    async fn reply_check_and_set_wins_once() {
        let manager = MemoryRequestManager::new();
        let owner = OwnerId(Uuid::new_v4());
        let request = Request::new_single(
            owner,
            &draft("2025-06-01", "2025-06-01"),
            DeliveryMode::Automatic,
            Utc::now(),
        );
        manager.insert_requests(std::slice::from_ref(&request)).await.unwrap();

        let reply = crate::reply::NewReply {
            request_id: request.id,
            provider_message_id: "m-1".into(),
            provider_thread_id: None,
            from_address: "chief@example.com".into(),
            snippet: "ok".into(),
            full_text: "ok".into(),
            received_at: Utc::now(),
        }
        .into_record();
        manager.insert_reply(&reply).await.unwrap();

        let first = manager
            .mark_reply_processed(reply.id, Some(RequestStatus::Approved), None, Utc::now())
            .await
            .unwrap();
        let second = manager
            .mark_reply_processed(reply.id, Some(RequestStatus::Denied), None, Utc::now())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let stored = manager.get_reply(reply.id).await.unwrap();
        assert_eq!(stored.resolved_status, Some(RequestStatus::Approved));
    }
}
