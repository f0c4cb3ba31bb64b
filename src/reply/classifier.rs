//! Keyword classifier for inbound approval replies.
//!
//! Maps free-form reply text onto the bounded status vocabulary. The
//! classifier is conservative: when a reply matches both keyword sets the
//! verdict is denial flagged as ambiguous, and ambiguous verdicts are never
//! auto-applied; they land in the review queue for a human decision.

use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::request::RequestStatus;

/// Independently configurable keyword sets for approval and denial.
///
/// Keywords are matched case-insensitively on word boundaries; multi-word
/// phrases are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordPolicy {
    pub approval: Vec<String>,
    pub denial: Vec<String>,
}

impl Default for KeywordPolicy {
    fn default() -> Self {
        KeywordPolicy {
            approval: [
                "approved", "approve", "accepted", "granted", "confirmed",
            ]
            .map(str::to_owned)
            .to_vec(),
            denial: [
                "denied",
                "deny",
                "declined",
                "decline",
                "rejected",
                "reject",
                "refused",
                "not approved",
            ]
            .map(str::to_owned)
            .to_vec(),
        }
    }
}

/// Verdict of classifying one reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum ReplyVerdict {
    Approved,
    Denied {
        /// True when approval keywords also matched. Ambiguous denials are
        /// the conservative tie-break verdict and require human review.
        ambiguous: bool,
    },
    /// Neither keyword set matched.
    Unknown,
}

impl ReplyVerdict {
    /// The status this verdict maps to, regardless of ambiguity.
    pub fn status(&self) -> Option<RequestStatus> {
        match self {
            ReplyVerdict::Approved => Some(RequestStatus::Approved),
            ReplyVerdict::Denied { .. } => Some(RequestStatus::Denied),
            ReplyVerdict::Unknown => None,
        }
    }

    /// The status safe to apply without a human in the loop.
    pub fn auto_status(&self) -> Option<RequestStatus> {
        match self {
            ReplyVerdict::Approved => Some(RequestStatus::Approved),
            ReplyVerdict::Denied { ambiguous: false } => Some(RequestStatus::Denied),
            ReplyVerdict::Denied { ambiguous: true } | ReplyVerdict::Unknown => None,
        }
    }
}

/// Classify a reply text against the keyword policy.
///
/// The text is lowercased and every non-alphanumeric run collapses to a
/// single space before matching, so "Approved," matches the keyword
/// "approved" while "disapproved" does not.
pub fn classify(policy: &KeywordPolicy, text: &str) -> ReplyVerdict {
    let haystack = normalize(text);

    let approval = matches_any(&haystack, &policy.approval);
    let denial = matches_any(&haystack, &policy.denial);

    let verdict = match (approval, denial) {
        (true, false) => ReplyVerdict::Approved,
        (false, true) => ReplyVerdict::Denied { ambiguous: false },
        // Both sets matched: prefer denial over silently approving, and
        // flag the reply for human review.
        (true, true) => ReplyVerdict::Denied { ambiguous: true },
        (false, false) => ReplyVerdict::Unknown,
    };

    if matches!(verdict, ReplyVerdict::Denied { ambiguous: true }) {
        counter!("layover_replies_ambiguous_total").increment(1);
        tracing::debug!("reply matched both keyword sets, flagging for review");
    }

    verdict
}

/// Lowercase and collapse every non-alphanumeric run to one space, padding
/// the ends so keyword matches can anchor on word boundaries.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    if !last_was_space {
        out.push(' ');
    }
    out
}

fn matches_any(haystack: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|keyword| {
        let needle = normalize(keyword);
        needle.trim() != "" && haystack.contains(&needle)
    })
}
