//! Policy configuration for request validation and reply handling.

use crate::reply::classifier::KeywordPolicy;

/// Tunable policy for request creation and reply scanning.
///
/// Backends hold one of these and expose it through `Storage::policy()`.
/// Customize with `.with_policy()` on the backend constructors.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// Maximum number of days accepted in one grouped submission.
    pub max_group_days: usize,

    /// When true, grouped days must form a gapless run of consecutive
    /// calendar days (duplicates count as overlaps and are rejected).
    pub require_consecutive_days: bool,

    /// Required prefix for flight references on flight-duty requests
    /// (e.g. the operator's flight-number designator).
    pub flight_reference_prefix: String,

    /// Minimum minutes between inbox re-scans for a request that is sent
    /// but has no reply yet.
    pub reply_recheck_minutes: i64,

    /// Keyword sets driving reply classification.
    pub keywords: KeywordPolicy,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        RequestPolicy {
            max_group_days: 14,
            require_consecutive_days: true,
            flight_reference_prefix: "FL".to_string(),
            reply_recheck_minutes: 30,
            keywords: KeywordPolicy::default(),
        }
    }
}

impl RequestPolicy {
    /// Re-check interval as a chrono duration.
    pub fn reply_recheck_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reply_recheck_minutes)
    }
}
