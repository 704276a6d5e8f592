//! Postgres-backed outbox.
//!
//! ## Claiming
//!
//! `claim_due` is a single statement: a `FOR UPDATE SKIP LOCKED` select of due
//! rows feeding an `UPDATE … RETURNING` that stamps the claimant token and lease.
//! Concurrent claimers skip each other's locked rows instead of waiting, and once
//! the statement commits the token (not the row lock) marks ownership. Every
//! later write filters on `claimed_by = token`, so a worker whose lease lapsed
//! cannot overwrite the outcome recorded by the worker that took over.
//!
//! ## Error Mapping
//!
//! | SQLx error | Code | OutboxStoreError |
//! |------------|------|------------------|
//! | unique violation | `23505` | `Conflict` |
//! | anything else | - | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use outpost_core::{ClaimToken, EventId};
use outpost_events::{NewOutboxEvent, OutboxEvent, OutboxStatus, PublishedEvent};

use super::store::{ClaimRequest, OutboxStats, OutboxStore, OutboxStoreError};
use crate::db::{self, SqlxErrorKind};

const OUTBOX_COLUMNS: &str = r#"
    id, aggregate_type, aggregate_id, event_type, payload, status, created_at,
    processed_at, attempt_count, next_attempt_at, last_error, dead_letter,
    claimed_by, claimed_until
"#;

/// Writes outbox rows inside a caller-owned transaction.
///
/// This is the only way rows enter the Postgres outbox: the business write and
/// the event write commit or roll back together.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgOutboxWriter;

impl PgOutboxWriter {
    #[instrument(
        skip(tx, event),
        fields(aggregate_type = %event.aggregate_type, event_type = %event.event_type),
        err
    )]
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
        created_at: DateTime<Utc>,
    ) -> Result<OutboxEvent, OutboxStoreError> {
        let row = event.into_event(created_at);

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_type, aggregate_id, event_type, payload,
                status, created_at, attempt_count, dead_letter
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, FALSE)
            "#,
        )
        .bind(row.id.as_uuid())
        .bind(&row.aggregate_type)
        .bind(&row.aggregate_id)
        .bind(&row.event_type)
        .bind(&row.payload)
        .bind(row.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(row)
    }
}

/// Postgres-backed [`OutboxStore`].
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: Arc<PgPool>,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    #[instrument(
        skip(self, request),
        fields(claimer = %request.token, limit = request.limit),
        err
    )]
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM outbox_events
                WHERE status = 'pending'
                  AND dead_letter = FALSE
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events AS o
            SET claimed_by = $3, claimed_until = $4
            FROM due
            WHERE o.id = due.id
            RETURNING o.*
            "#,
        )
        .bind(request.now)
        .bind(db::limit_param(request.limit))
        .bind(request.token.as_uuid())
        .bind(request.lease_until)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = decode_rows(rows)?;
        // RETURNING does not preserve the CTE's order.
        claimed.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimed)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn extend_claim(
        &self,
        event_id: EventId,
        token: ClaimToken,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_until = $4
            WHERE id = $1
              AND claimed_by = $2
              AND status = 'pending'
              AND claimed_until > $3
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(token.as_uuid())
        .bind(now)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_claim", e))?;

        if updated.rows_affected() == 0 {
            return Err(OutboxStoreError::ClaimLost(event_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn mark_processed(
        &self,
        event_id: EventId,
        token: ClaimToken,
        topic: &str,
        published_at: DateTime<Utc>,
    ) -> Result<PublishedEvent, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'processed',
                processed_at = $3,
                next_attempt_at = NULL,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(token.as_uuid())
        .bind(published_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(OutboxStoreError::ClaimLost(event_id));
        }

        sqlx::query(
            r#"
            INSERT INTO published_events (source_event_id, topic, published_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_event_id) DO NOTHING
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(topic)
        .bind(published_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_receipt", e))?;

        let row = sqlx::query(
            r#"
            SELECT source_event_id, topic, published_at
            FROM published_events
            WHERE source_event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_receipt", e))?;
        let receipt = decode_receipt(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(receipt)
    }

    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, attempt_count = event.attempt_count, status = %event.status),
        err
    )]
    async fn mark_failed(&self, event: &OutboxEvent, token: ClaimToken) -> Result<(), OutboxStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempt_count = $3,
                last_error = $4,
                next_attempt_at = $5,
                status = $6,
                dead_letter = $7,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(token.as_uuid())
        .bind(i32::try_from(event.attempt_count).unwrap_or(i32::MAX))
        .bind(event.last_error.as_deref())
        .bind(event.next_attempt_at)
        .bind(event.status.as_str())
        .bind(event.dead_letter)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if updated.rows_affected() == 0 {
            return Err(OutboxStoreError::ClaimLost(event.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn receipt(&self, event_id: EventId) -> Result<Option<PublishedEvent>, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_event_id, topic, published_at
            FROM published_events
            WHERE source_event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("receipt", e))?;

        row.map(|r| decode_receipt(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxStoreError> {
        // Receipts follow through ON DELETE CASCADE.
        let deleted = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE id IN (
                SELECT id
                FROM outbox_events
                WHERE status IN ('processed', 'dead')
                  AND created_at < $1
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(cutoff)
        .bind(db::limit_param(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_terminal_before", e))?;

        Ok(deleted.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total, MIN(created_at) AS oldest
            FROM outbox_events
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            let oldest: Option<DateTime<Utc>> = row.try_get("oldest").map_err(decode_error)?;
            let total = u64::try_from(total).unwrap_or(0);

            match parse_status(&status)? {
                OutboxStatus::Pending => {
                    stats.pending = total;
                    stats.oldest_pending_at = oldest;
                }
                OutboxStatus::Processed => stats.processed = total,
                OutboxStatus::Dead => stats.dead = total,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox_events
            WHERE status = 'dead'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(db::limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn requeue_dead_letter(&self, event_id: EventId) -> Result<OutboxEvent, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_dead_letter", e))?
            .ok_or(OutboxStoreError::NotFound(event_id))?;

        let mut event = decode_row(&row)?;
        event
            .requeue()
            .map_err(|e| OutboxStoreError::Conflict(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                dead_letter = FALSE,
                attempt_count = 0,
                next_attempt_at = NULL,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(event)
    }
}

/// Map SQLx errors to OutboxStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    let msg = db::describe(operation, &err);
    match db::classify(&err) {
        SqlxErrorKind::UniqueViolation => OutboxStoreError::Conflict(msg),
        _ => OutboxStoreError::Storage(msg),
    }
}

fn decode_error(err: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Storage(format!("failed to deserialize outbox row: {}", err))
}

fn parse_status(status: &str) -> Result<OutboxStatus, OutboxStoreError> {
    status
        .parse()
        .map_err(|e: outpost_core::DomainError| OutboxStoreError::Storage(e.to_string()))
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<OutboxEvent, OutboxStoreError> {
    OutboxRow::from_row(row)
        .map_err(decode_error)?
        .try_into()
}

fn decode_receipt(row: &PgRow) -> Result<PublishedEvent, OutboxStoreError> {
    let source_event_id: Uuid = row.try_get("source_event_id").map_err(decode_error)?;
    Ok(PublishedEvent {
        source_event_id: EventId::from_uuid(source_event_id),
        topic: row.try_get("topic").map_err(decode_error)?,
        published_at: row.try_get("published_at").map_err(decode_error)?,
    })
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: JsonValue,
    status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    dead_letter: bool,
    claimed_by: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            attempt_count: row.try_get("attempt_count")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            dead_letter: row.try_get("dead_letter")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: EventId::from_uuid(row.id),
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            processed_at: row.processed_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            dead_letter: row.dead_letter,
            claimed_by: row.claimed_by.map(ClaimToken::from_uuid),
            claimed_until: row.claimed_until,
        })
    }
}
