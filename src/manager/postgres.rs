//! PostgreSQL implementation of the Storage trait.
//!
//! Group mutations run as single statements (one `UPDATE ... WHERE
//! group_id = $1`), batch inserts run in a transaction, and the reply
//! check-and-set is a conditional `UPDATE ... WHERE NOT is_processed`, so
//! the atomicity contract of the trait holds without application-side
//! locking.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::Storage;
use crate::config::RequestPolicy;
use crate::error::{LayoverError, Result};
use crate::reply::{ReplyFilter, ReplyId, ReplyRecord};
use crate::request::{
    DeliveryMode, GroupId, OwnerId, Request, RequestId, RequestStatus, RequestType,
};

/// PostgreSQL-backed request manager.
///
/// # Example
/// ```ignore
/// use layover::manager::postgres::PostgresRequestManager;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/layover").await?;
/// layover::migrator().run(&pool).await?;
/// let manager = PostgresRequestManager::new(pool);
/// ```
pub struct PostgresRequestManager {
    pool: PgPool,
    policy: RequestPolicy,
}

impl PostgresRequestManager {
    /// Create a manager with the default policy. Customize with
    /// `.with_policy()` if needed.
    pub fn new(pool: PgPool) -> Self {
        PostgresRequestManager {
            pool,
            policy: RequestPolicy::default(),
        }
    }

    /// Set a custom policy. Builder method chained after `new()`.
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db(e: sqlx::Error) -> LayoverError {
    LayoverError::Other(anyhow!("database error: {e}"))
}

fn parse_field<T>(value: &str, field: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| LayoverError::Other(anyhow!("corrupt {field} column: {e}")))
}

fn request_from_row(row: &PgRow) -> Result<Request> {
    let request_type: String = row.try_get("request_type").map_err(db)?;
    let status: String = row.try_get("status").map_err(db)?;
    let delivery_mode: String = row.try_get("delivery_mode").map_err(db)?;

    Ok(Request {
        id: RequestId(row.try_get::<Uuid, _>("id").map_err(db)?),
        owner_id: OwnerId(row.try_get::<Uuid, _>("owner_id").map_err(db)?),
        group_id: GroupId(row.try_get::<Uuid, _>("group_id").map_err(db)?),
        start_date: row.try_get("start_date").map_err(db)?,
        end_date: row.try_get("end_date").map_err(db)?,
        request_type: parse_field::<RequestType>(&request_type, "request_type")?,
        flight_reference: row.try_get("flight_reference").map_err(db)?,
        status: parse_field::<RequestStatus>(&status, "status")?,
        note: row.try_get("note").map_err(db)?,
        delivery_mode: parse_field::<DeliveryMode>(&delivery_mode, "delivery_mode")?,
        delivery_sent_at: row.try_get("delivery_sent_at").map_err(db)?,
        delivery_failed: row.try_get("delivery_failed").map_err(db)?,
        delivery_failure_reason: row.try_get("delivery_failure_reason").map_err(db)?,
        delivery_failed_at: row.try_get("delivery_failed_at").map_err(db)?,
        provider_message_id: row.try_get("provider_message_id").map_err(db)?,
        provider_thread_id: row.try_get("provider_thread_id").map_err(db)?,
        manual_confirmed: row.try_get("manual_confirmed").map_err(db)?,
        reply_received_at: row.try_get("reply_received_at").map_err(db)?,
        reply_text: row.try_get("reply_text").map_err(db)?,
        reply_checked_at: row.try_get("reply_checked_at").map_err(db)?,
        auto_resolved: row.try_get("auto_resolved").map_err(db)?,
        status_change_method: row.try_get("status_change_method").map_err(db)?,
        status_changed_at: row.try_get("status_changed_at").map_err(db)?,
        approved_at: row.try_get("approved_at").map_err(db)?,
        created_at: row.try_get("created_at").map_err(db)?,
    })
}

fn reply_from_row(row: &PgRow) -> Result<ReplyRecord> {
    let resolved: Option<String> = row.try_get("resolved_status").map_err(db)?;
    let resolved_status = match resolved {
        Some(value) => Some(parse_field::<RequestStatus>(&value, "resolved_status")?),
        None => None,
    };

    Ok(ReplyRecord {
        id: ReplyId(row.try_get::<Uuid, _>("id").map_err(db)?),
        request_id: RequestId(row.try_get::<Uuid, _>("request_id").map_err(db)?),
        provider_message_id: row.try_get("provider_message_id").map_err(db)?,
        provider_thread_id: row.try_get("provider_thread_id").map_err(db)?,
        from_address: row.try_get("from_address").map_err(db)?,
        snippet: row.try_get("snippet").map_err(db)?,
        full_text: row.try_get("full_text").map_err(db)?,
        received_at: row.try_get("received_at").map_err(db)?,
        is_processed: row.try_get("is_processed").map_err(db)?,
        resolved_status,
        processed_at: row.try_get("processed_at").map_err(db)?,
        processed_by: row.try_get("processed_by").map_err(db)?,
    })
}

const INSERT_REQUEST_SQL: &str = r#"
    INSERT INTO requests (
        id, owner_id, group_id, start_date, end_date, request_type,
        flight_reference, status, note, delivery_mode,
        delivery_sent_at, delivery_failed, delivery_failure_reason,
        delivery_failed_at, provider_message_id, provider_thread_id,
        manual_confirmed, reply_received_at, reply_text, reply_checked_at,
        auto_resolved, status_change_method, status_changed_at,
        approved_at, created_at
    )
    VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
        $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
    )
"#;

fn bind_request_values<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    request: &'q Request,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(request.id.0)
        .bind(request.owner_id.0)
        .bind(request.group_id.0)
        .bind(request.start_date)
        .bind(request.end_date)
        .bind(request.request_type.as_str())
        .bind(request.flight_reference.as_deref())
        .bind(request.status.as_str())
        .bind(request.note.as_deref())
        .bind(request.delivery_mode.as_str())
        .bind(request.delivery_sent_at)
        .bind(request.delivery_failed)
        .bind(request.delivery_failure_reason.as_deref())
        .bind(request.delivery_failed_at)
        .bind(request.provider_message_id.as_deref())
        .bind(request.provider_thread_id.as_deref())
        .bind(request.manual_confirmed)
        .bind(request.reply_received_at)
        .bind(request.reply_text.as_deref())
        .bind(request.reply_checked_at)
        .bind(request.auto_resolved)
        .bind(request.status_change_method.as_deref())
        .bind(request.status_changed_at)
        .bind(request.approved_at)
        .bind(request.created_at)
}

#[async_trait]
impl Storage for PostgresRequestManager {
    fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    async fn owner_delivery_mode(&self, owner: OwnerId) -> Result<DeliveryMode> {
        let row = sqlx::query("SELECT delivery_mode FROM owner_preferences WHERE owner_id = $1")
            .bind(owner.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;

        match row {
            Some(row) => {
                let mode: String = row.try_get("delivery_mode").map_err(db)?;
                parse_field::<DeliveryMode>(&mode, "delivery_mode")
            }
            None => Ok(DeliveryMode::Automatic),
        }
    }

    async fn set_owner_delivery_mode(&self, owner: OwnerId, mode: DeliveryMode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owner_preferences (owner_id, delivery_mode)
            VALUES ($1, $2)
            ON CONFLICT (owner_id) DO UPDATE SET delivery_mode = EXCLUDED.delivery_mode
            "#,
        )
        .bind(owner.0)
        .bind(mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn insert_requests(&self, requests: &[Request]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for request in requests {
            bind_request_values(sqlx::query(INSERT_REQUEST_SQL), request)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    LayoverError::Other(anyhow!("failed to insert request {}: {e}", request.id))
                })?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or(LayoverError::RequestNotFound(id))?;
        request_from_row(&row)
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Vec<Request>> {
        let rows = sqlx::query("SELECT * FROM requests WHERE group_id = $1 ORDER BY start_date")
            .bind(group_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn list_requests(&self, owner: OwnerId) -> Result<Vec<Request>> {
        let rows = sqlx::query("SELECT * FROM requests WHERE owner_id = $1 ORDER BY start_date")
            .bind(owner.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn find_overlapping(
        &self,
        owner: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
        exclude_group: Option<GroupId>,
    ) -> Result<Vec<Request>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM requests
            WHERE owner_id = $1
              AND status IN ('pending', 'approved')
              AND start_date <= $3
              AND end_date >= $2
              AND ($4::uuid IS NULL OR group_id <> $4)
            ORDER BY start_date
            "#,
        )
        .bind(owner.0)
        .bind(start)
        .bind(end)
        .bind(exclude_group.map(|g| g.0))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn persist(&self, request: &Request) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET
                start_date = $2,
                end_date = $3,
                request_type = $4,
                flight_reference = $5,
                status = $6,
                note = $7,
                delivery_sent_at = $8,
                delivery_failed = $9,
                delivery_failure_reason = $10,
                delivery_failed_at = $11,
                provider_message_id = $12,
                provider_thread_id = $13,
                manual_confirmed = $14,
                reply_received_at = $15,
                reply_text = $16,
                reply_checked_at = $17,
                auto_resolved = $18,
                status_change_method = $19,
                status_changed_at = $20,
                approved_at = $21
            WHERE id = $1
            "#,
        )
        .bind(request.id.0)
        .bind(request.start_date)
        .bind(request.end_date)
        .bind(request.request_type.as_str())
        .bind(request.flight_reference.as_deref())
        .bind(request.status.as_str())
        .bind(request.note.as_deref())
        .bind(request.delivery_sent_at)
        .bind(request.delivery_failed)
        .bind(request.delivery_failure_reason.as_deref())
        .bind(request.delivery_failed_at)
        .bind(request.provider_message_id.as_deref())
        .bind(request.provider_thread_id.as_deref())
        .bind(request.manual_confirmed)
        .bind(request.reply_received_at)
        .bind(request.reply_text.as_deref())
        .bind(request.reply_checked_at)
        .bind(request.auto_resolved)
        .bind(request.status_change_method.as_deref())
        .bind(request.status_changed_at)
        .bind(request.approved_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(LayoverError::RequestNotFound(request.id));
        }
        Ok(())
    }

    async fn apply_group_status(
        &self,
        group_id: GroupId,
        status: RequestStatus,
        method: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        // One statement mutates every member; no reader can observe a
        // partially updated group.
        let result = sqlx::query(
            r#"
            UPDATE requests SET
                status = $2,
                status_change_method = $3,
                status_changed_at = $4,
                approved_at = CASE WHEN $2 = 'approved' THEN $4 ELSE NULL END
            WHERE group_id = $1
            "#,
        )
        .bind(group_id.0)
        .bind(status.as_str())
        .bind(method)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn remove_group(&self, owner: OwnerId, group_id: GroupId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM requests WHERE group_id = $1 AND owner_id = $2")
            .bind(group_id.0)
            .bind(owner.0)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn list_sent_unreplied(&self) -> Result<Vec<Request>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM requests
            WHERE delivery_mode = 'automatic'
              AND delivery_sent_at IS NOT NULL
              AND NOT delivery_failed
              AND reply_received_at IS NULL
            ORDER BY delivery_sent_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(request_from_row).collect()
    }

    async fn insert_reply(&self, reply: &ReplyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replies (
                id, request_id, provider_message_id, provider_thread_id,
                from_address, snippet, full_text, received_at,
                is_processed, resolved_status, processed_at, processed_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(reply.id.0)
        .bind(reply.request_id.0)
        .bind(reply.provider_message_id.as_str())
        .bind(reply.provider_thread_id.as_deref())
        .bind(reply.from_address.as_str())
        .bind(reply.snippet.as_str())
        .bind(reply.full_text.as_str())
        .bind(reply.received_at)
        .bind(reply.is_processed)
        .bind(reply.resolved_status.map(|s| s.as_str()))
        .bind(reply.processed_at)
        .bind(reply.processed_by.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_reply(&self, id: ReplyId) -> Result<ReplyRecord> {
        let row = sqlx::query("SELECT * FROM replies WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or(LayoverError::ReplyNotFound(id))?;
        reply_from_row(&row)
    }

    async fn list_replies(&self, owner: OwnerId, filter: ReplyFilter) -> Result<Vec<ReplyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT r.* FROM replies r
            JOIN requests q ON q.id = r.request_id
            WHERE q.owner_id = $1
              AND ($2::boolean IS NULL OR r.is_processed = $2)
              AND (NOT $3::boolean OR (r.is_processed AND r.resolved_status IS NULL))
            ORDER BY r.received_at DESC
            "#,
        )
        .bind(owner.0)
        .bind(filter.processed)
        .bind(filter.needs_review)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(reply_from_row).collect()
    }

    async fn count_unprocessed_replies(&self, owner: OwnerId) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS unprocessed FROM replies r
            JOIN requests q ON q.id = r.request_id
            WHERE q.owner_id = $1 AND NOT r.is_processed
            "#,
        )
        .bind(owner.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        let count: i64 = row.try_get("unprocessed").map_err(db)?;
        Ok(count as u64)
    }

    async fn mark_reply_processed(
        &self,
        id: ReplyId,
        resolved: Option<RequestStatus>,
        processed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        // Conditional update is the check-and-set: concurrent calls
        // serialize on the row and only one sees is_processed = FALSE.
        let result = sqlx::query(
            r#"
            UPDATE replies SET
                is_processed = TRUE,
                resolved_status = $2,
                processed_by = $3,
                processed_at = $4
            WHERE id = $1 AND NOT is_processed
            "#,
        )
        .bind(id.0)
        .bind(resolved.map(|s| s.as_str()))
        .bind(processed_by)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish "lost the race" from "no such reply".
        let exists = sqlx::query("SELECT 1 AS present FROM replies WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        if exists.is_none() {
            return Err(LayoverError::ReplyNotFound(id));
        }
        Ok(false)
    }

    async fn persist_reply(&self, reply: &ReplyRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE replies SET
                is_processed = $2,
                resolved_status = $3,
                processed_at = $4,
                processed_by = $5
            WHERE id = $1
            "#,
        )
        .bind(reply.id.0)
        .bind(reply.is_processed)
        .bind(reply.resolved_status.map(|s| s.as_str()))
        .bind(reply.processed_at)
        .bind(reply.processed_by.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(LayoverError::ReplyNotFound(reply.id));
        }
        Ok(())
    }
}
