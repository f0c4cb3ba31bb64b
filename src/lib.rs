//! Request lifecycle and delivery-state engine for crew day-off requests.
//!
//! This crate provides 'managers' that accept submitted day-off and
//! flight-duty requests and track them through an email-based approval
//! workflow. Requests are created singly or as grouped multi-day
//! submissions, their notification delivery is tracked through two mutually
//! exclusive paths (provider-sent or manually confirmed), and status
//! changes are gated so no decision can be recorded on a request the
//! approver never received. Inbound replies are classified against a
//! keyword policy and drive status transitions idempotently.
//!
//! The actual email transport and inbox polling are external
//! collaborators: the core consumes "send succeeded/failed" and "reply
//! received" events and exposes the queries the poller needs.

pub mod config;
pub mod delivery;
pub mod error;
pub mod manager;
pub mod reply;
pub mod request;

// Re-export commonly used types
pub use config::RequestPolicy;
pub use error::{LayoverError, Result};
pub use manager::memory::MemoryRequestManager;
#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresRequestManager;
pub use manager::{GroupDeletion, StatusUpdate, Storage};
pub use reply::classifier::{KeywordPolicy, ReplyVerdict, classify};
pub use reply::{NewReply, OutboundResponse, ProcessOutcome, ReplyFilter, ReplyId, ReplyRecord};
pub use request::*;

/// Get the layover database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
