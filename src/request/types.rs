//! Core types for the day-off request system.
//!
//! This module defines the request record, its closed status/mode/type
//! vocabularies, and the input drafts accepted by the store. Statuses and
//! modes are tagged unions with one authoritative string form (`as_str` /
//! `FromStr`) which is also the database column encoding.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RequestPolicy;
use crate::error::{LayoverError, Result};

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

/// Shared identifier for a multi-day submission.
///
/// A single request's group id equals its own id; every request carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

/// Identifier of the crew member owning a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

macro_rules! impl_id_newtype {
    ($name:ident) => {
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Display only first 8 characters for readability in logs
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

impl_id_newtype!(RequestId);
impl_id_newtype!(GroupId);
impl_id_newtype!(OwnerId);

/// Kind of duty change being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Full day off.
    DayOff,
    /// Morning off.
    AmOff,
    /// Afternoon off.
    PmOff,
    /// Assignment to a specific flight, identified by a flight reference.
    FlightDuty,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::DayOff => "day_off",
            RequestType::AmOff => "am_off",
            RequestType::PmOff => "pm_off",
            RequestType::FlightDuty => "flight_duty",
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "day_off" => Ok(RequestType::DayOff),
            "am_off" => Ok(RequestType::AmOff),
            "pm_off" => Ok(RequestType::PmOff),
            "flight_duty" => Ok(RequestType::FlightDuty),
            other => Err(format!("unknown request type: {other}")),
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval status of a request.
///
/// All transitions between these states are reversible; this models a
/// correctable approval workflow, not a one-way pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "denied" => Ok(RequestStatus::Denied),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the approval notification reaches the approver.
///
/// Frozen onto the request at creation time from the owner's current
/// preference; later preference changes never rewrite historical requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The system sends the notification through the mail provider API.
    Automatic,
    /// The owner sends the mail themselves and confirms having done so.
    Manual,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Automatic => "automatic",
            DeliveryMode::Manual => "manual",
        }
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(DeliveryMode::Automatic),
            "manual" => Ok(DeliveryMode::Manual),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

/// Derived view of a request's notification state.
///
/// Never stored; computed from the delivery mode and the stored delivery
/// fields. Used for external exposure and for the status-change gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Automatic send succeeded.
    Sent,
    /// Automatic send failed; eligible for resend while pending.
    Failed,
    /// Manual mode, owner has not yet confirmed sending.
    PendingManual,
    /// Manual mode, owner confirmed sending; ready for a decision.
    ReadyManual,
    /// Automatic mode, no send attempt recorded yet.
    NotSent,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::Failed => "failed",
            DeliveryState::PendingManual => "pending_manual",
            DeliveryState::ReadyManual => "ready_manual",
            DeliveryState::NotSent => "not_sent",
        }
    }

    /// True when the notification is confirmed delivered (automatic success
    /// or manual confirmation) and a decision may therefore be recorded.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::ReadyManual)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A day-off / flight-duty request.
///
/// Status and delivery fields must only be mutated through the delivery
/// tracker and status state machine entry points so the gating invariants
/// cannot be bypassed by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub owner_id: OwnerId,
    /// Shared identifier for multi-day submissions; equals `id` for singles.
    pub group_id: GroupId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub request_type: RequestType,
    /// Required (and prefix-validated) iff `request_type` is flight duty.
    pub flight_reference: Option<String>,
    pub status: RequestStatus,
    pub note: Option<String>,
    pub delivery_mode: DeliveryMode,

    // Delivery fields. Success and failure field groups are mutually
    // exclusive: a send outcome clears the other group entirely.
    pub delivery_sent_at: Option<DateTime<Utc>>,
    pub delivery_failed: bool,
    pub delivery_failure_reason: Option<String>,
    pub delivery_failed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub manual_confirmed: bool,

    // Reply tracking.
    pub reply_received_at: Option<DateTime<Utc>>,
    pub reply_text: Option<String>,
    pub reply_checked_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,

    // Decision provenance.
    pub status_change_method: Option<String>,
    pub status_changed_at: Option<DateTime<Utc>>,
    /// Set iff `status` is approved.
    pub approved_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Request {
    /// Build a freshly submitted single request. The group id equals the
    /// request's own id; this is an explicit step of creation, not a hidden
    /// persistence hook, so the "group id always present" invariant holds by
    /// construction.
    pub fn new_single(
        owner: OwnerId,
        draft: &RequestDraft,
        mode: DeliveryMode,
        now: DateTime<Utc>,
    ) -> Self {
        let id = RequestId(Uuid::new_v4());
        Request {
            id,
            owner_id: owner,
            group_id: GroupId(id.0),
            start_date: draft.start_date,
            end_date: draft.end_date,
            request_type: draft.request_type,
            flight_reference: draft.flight_reference.clone(),
            status: RequestStatus::Pending,
            note: draft.note.clone(),
            delivery_mode: mode,
            delivery_sent_at: None,
            delivery_failed: false,
            delivery_failure_reason: None,
            delivery_failed_at: None,
            provider_message_id: None,
            provider_thread_id: None,
            manual_confirmed: false,
            reply_received_at: None,
            reply_text: None,
            reply_checked_at: None,
            auto_resolved: false,
            status_change_method: None,
            status_changed_at: None,
            approved_at: None,
            created_at: now,
        }
    }

    /// Build one member of a grouped submission.
    pub fn new_group_member(
        owner: OwnerId,
        group_id: GroupId,
        day: &GroupDayDraft,
        note: Option<&str>,
        mode: DeliveryMode,
        now: DateTime<Utc>,
    ) -> Self {
        let draft = RequestDraft {
            start_date: day.date,
            end_date: day.date,
            request_type: day.request_type,
            flight_reference: day.flight_reference.clone(),
            note: note.map(str::to_owned),
        };
        let mut request = Request::new_single(owner, &draft, mode, now);
        request.group_id = group_id;
        request
    }

    /// True for a single-day submission that was not part of a group.
    pub fn is_single(&self) -> bool {
        self.group_id.0 == self.id.0
    }
}

/// Input for creating a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDraft {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub request_type: RequestType,
    pub flight_reference: Option<String>,
    pub note: Option<String>,
}

/// One day of a grouped submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDayDraft {
    pub date: NaiveDate,
    pub request_type: RequestType,
    pub flight_reference: Option<String>,
}

/// Input for creating a grouped multi-day submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDraft {
    pub days: Vec<GroupDayDraft>,
    pub note: Option<String>,
}

impl RequestDraft {
    /// Validate date order and type rules against the policy.
    pub fn validate(&self, policy: &RequestPolicy) -> Result<()> {
        if self.end_date < self.start_date {
            return Err(LayoverError::validation(
                "end_date",
                format!(
                    "end date {} precedes start date {}",
                    self.end_date, self.start_date
                ),
            ));
        }
        validate_flight_reference(self.request_type, self.flight_reference.as_deref(), policy)
    }
}

impl GroupDraft {
    /// Validate every entry independently, then the group-level constraints:
    /// entry count cap and (when required) the no-gap/no-overlap
    /// consecutive-day rule.
    pub fn validate(&self, policy: &RequestPolicy) -> Result<()> {
        if self.days.is_empty() {
            return Err(LayoverError::validation("days", "no days submitted"));
        }
        if self.days.len() > policy.max_group_days {
            return Err(LayoverError::validation(
                "days",
                format!(
                    "{} days submitted, at most {} allowed per group",
                    self.days.len(),
                    policy.max_group_days
                ),
            ));
        }

        for day in &self.days {
            validate_flight_reference(day.request_type, day.flight_reference.as_deref(), policy)?;
        }

        if policy.require_consecutive_days {
            let mut dates: Vec<NaiveDate> = self.days.iter().map(|d| d.date).collect();
            dates.sort_unstable();
            for pair in dates.windows(2) {
                let gap = (pair[1] - pair[0]).num_days();
                if gap == 0 {
                    return Err(LayoverError::validation(
                        "days",
                        format!("duplicate date {} in group", pair[0]),
                    ));
                }
                if gap > 1 {
                    return Err(LayoverError::validation(
                        "days",
                        format!("gap between {} and {}: days must be consecutive", pair[0], pair[1]),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn validate_flight_reference(
    request_type: RequestType,
    flight_reference: Option<&str>,
    policy: &RequestPolicy,
) -> Result<()> {
    match (request_type, flight_reference) {
        (RequestType::FlightDuty, None) => Err(LayoverError::validation(
            "flight_reference",
            "flight duty requests require a flight reference",
        )),
        (RequestType::FlightDuty, Some(reference)) => {
            let reference = reference.trim();
            let prefix = policy.flight_reference_prefix.as_str();
            if !reference.starts_with(prefix) || reference.len() <= prefix.len() {
                return Err(LayoverError::validation(
                    "flight_reference",
                    format!("flight reference must start with '{prefix}' followed by the flight number"),
                ));
            }
            Ok(())
        }
        (_, Some(_)) => Err(LayoverError::validation(
            "flight_reference",
            format!("flight reference only applies to flight duty requests, not {request_type}"),
        )),
        (_, None) => Ok(()),
    }
}

/// Symmetric closed-interval overlap test over [start, end] date ranges.
pub fn ranges_overlap(
    a_start: NaiveDate,
    a_end: NaiveDate,
    b_start: NaiveDate,
    b_end: NaiveDate,
) -> bool {
    a_start <= b_end && b_start <= a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn policy() -> RequestPolicy {
        RequestPolicy::default()
    }

    fn draft(start: &str, end: &str) -> RequestDraft {
        RequestDraft {
            start_date: date(start),
            end_date: date(end),
            request_type: RequestType::DayOff,
            flight_reference: None,
            note: None,
        }
    }

    #[test]
    fn end_before_start_is_rejected() {
        let err = draft("2025-03-10", "2025-03-08").validate(&policy()).unwrap_err();
        assert!(matches!(err, LayoverError::Validation { field: "end_date", .. }));
        assert!(draft("2025-03-10", "2025-03-10").validate(&policy()).is_ok());
        assert!(draft("2025-03-10", "2025-03-12").validate(&policy()).is_ok());
    }

    #[test]
    fn flight_duty_requires_prefixed_reference() {
        let mut d = draft("2025-03-10", "2025-03-10");
        d.request_type = RequestType::FlightDuty;
        assert!(matches!(
            d.validate(&policy()).unwrap_err(),
            LayoverError::Validation { field: "flight_reference", .. }
        ));

        d.flight_reference = Some("1234".to_string());
        assert!(d.validate(&policy()).is_err());

        d.flight_reference = Some("FL".to_string());
        assert!(d.validate(&policy()).is_err(), "bare prefix is not a flight number");

        d.flight_reference = Some("FL1234".to_string());
        assert!(d.validate(&policy()).is_ok());
    }

    #[test]
    fn flight_reference_rejected_on_day_off() {
        let mut d = draft("2025-03-10", "2025-03-10");
        d.flight_reference = Some("FL1234".to_string());
        assert!(matches!(
            d.validate(&policy()).unwrap_err(),
            LayoverError::Validation { field: "flight_reference", .. }
        ));
    }

    #[test]
    fn group_rejects_gaps_and_duplicates() {
        let day = |s: &str| GroupDayDraft {
            date: date(s),
            request_type: RequestType::DayOff,
            flight_reference: None,
        };

        let consecutive = GroupDraft {
            days: vec![day("2025-03-12"), day("2025-03-10"), day("2025-03-11")],
            note: None,
        };
        assert!(consecutive.validate(&policy()).is_ok(), "order of entries is irrelevant");

        let gapped = GroupDraft {
            days: vec![day("2025-03-10"), day("2025-03-12")],
            note: None,
        };
        assert!(gapped.validate(&policy()).is_err());

        let duplicated = GroupDraft {
            days: vec![day("2025-03-10"), day("2025-03-10")],
            note: None,
        };
        assert!(duplicated.validate(&policy()).is_err());

        let mut lenient = policy();
        lenient.require_consecutive_days = false;
        assert!(gapped.validate(&lenient).is_ok());
    }

    #[test]
    fn group_enforces_day_cap() {
        let days: Vec<GroupDayDraft> = (1..=15)
            .map(|i| GroupDayDraft {
                date: date(&format!("2025-03-{i:02}")),
                request_type: RequestType::DayOff,
                flight_reference: None,
            })
            .collect();
        let oversized = GroupDraft { days, note: None };
        assert!(matches!(
            oversized.validate(&policy()).unwrap_err(),
            LayoverError::Validation { field: "days", .. }
        ));
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = (date("2025-03-10"), date("2025-03-12"));
        let b = (date("2025-03-12"), date("2025-03-14"));
        let c = (date("2025-03-13"), date("2025-03-14"));

        assert!(ranges_overlap(a.0, a.1, b.0, b.1));
        assert!(ranges_overlap(b.0, b.1, a.0, a.1));
        assert!(!ranges_overlap(a.0, a.1, c.0, c.1));
        assert!(!ranges_overlap(c.0, c.1, a.0, a.1));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [RequestStatus::Pending, RequestStatus::Approved, RequestStatus::Denied] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RequestStatus>().is_err());
    }
}
