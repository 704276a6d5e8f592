//! Postgres-backed gifts and activation log.
//!
//! Gift writes and their outbox rows share one transaction through
//! [`PgOutboxWriter`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use outpost_core::{DomainError, GiftId};
use outpost_events::NewOutboxEvent;
use outpost_gifts::{ActivationAttempt, Gift};

use super::store::{ActivationLog, GiftStore, GiftStoreError, activation_error};
use crate::db::{self, SqlxErrorKind};
use crate::outbox::PgOutboxWriter;

const GIFT_COLUMNS: &str = r#"
    id, purchaser_ref, recipient_email, amount_minor, currency, message,
    activation_token, status, expires_at, created_at, activated_at
"#;

#[derive(Debug, Clone)]
pub struct PgGiftStore {
    pool: Arc<PgPool>,
}

impl PgGiftStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl GiftStore for PgGiftStore {
    #[instrument(skip(self, gift, creation_key, event), fields(gift_id = %gift.id), err)]
    async fn insert(
        &self,
        gift: &Gift,
        creation_key: Option<&str>,
        event: NewOutboxEvent,
    ) -> Result<GiftId, GiftStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // NULL keys never conflict, so keyless inserts behave as plain inserts.
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO gifts (
                id, purchaser_ref, recipient_email, amount_minor, currency, message,
                activation_token, status, expires_at, created_at, activated_at, creation_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (creation_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(gift.id.as_uuid())
        .bind(&gift.purchaser_ref)
        .bind(&gift.recipient_email)
        .bind(gift.amount_minor)
        .bind(&gift.currency)
        .bind(gift.message.as_deref())
        .bind(&gift.activation_token)
        .bind(gift.status.as_str())
        .bind(gift.expires_at)
        .bind(gift.created_at)
        .bind(gift.activated_at)
        .bind(creation_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if db::classify(&e) == SqlxErrorKind::UniqueViolation {
                GiftStoreError::Duplicate(gift.id)
            } else {
                map_sqlx_error("insert_gift", e)
            }
        })?;

        if inserted.is_none() {
            let holder: Uuid = sqlx::query_scalar("SELECT id FROM gifts WHERE creation_key = $1")
                .bind(creation_key)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("find_creation_key_holder", e))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(GiftId::from_uuid(holder));
        }

        PgOutboxWriter::enqueue(&mut tx, event, gift.created_at).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(gift.id)
    }

    #[instrument(skip(self, key), err)]
    async fn find_by_creation_key(&self, key: &str) -> Result<Option<Gift>, GiftStoreError> {
        let sql = format!("SELECT {GIFT_COLUMNS} FROM gifts WHERE creation_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_creation_key", e))?;
        row.map(|r| decode_gift(&r)).transpose()
    }

    #[instrument(skip(self), fields(gift_id = %id), err)]
    async fn get(&self, id: GiftId) -> Result<Option<Gift>, GiftStoreError> {
        let sql = format!("SELECT {GIFT_COLUMNS} FROM gifts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_gift", e))?;
        row.map(|r| decode_gift(&r)).transpose()
    }

    #[instrument(skip(self, token), err)]
    async fn find_by_token(&self, token: &str) -> Result<Option<Gift>, GiftStoreError> {
        let sql = format!("SELECT {GIFT_COLUMNS} FROM gifts WHERE activation_token = $1");
        let row = sqlx::query(&sql)
            .bind(token)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_token", e))?;
        row.map(|r| decode_gift(&r)).transpose()
    }

    #[instrument(skip(self), fields(gift_id = %id), err)]
    async fn activate(&self, id: GiftId, now: DateTime<Utc>) -> Result<Gift, GiftStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {GIFT_COLUMNS} FROM gifts WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_gift", e))?
            .ok_or(GiftStoreError::NotFound(id))?;

        let mut gift = decode_gift(&row)?;
        if let Err(e) = gift.activate(now) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(activation_error(id, e));
        }
        let event = gift
            .activated_event()
            .ok_or_else(|| GiftStoreError::Storage(format!("gift {id} has no activation time")))?;

        sqlx::query(
            r#"
            UPDATE gifts
            SET status = $2, activated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(gift.status.as_str())
        .bind(gift.activated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("activate_gift", e))?;

        PgOutboxWriter::enqueue(&mut tx, NewOutboxEvent::from_domain(&event)?, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(gift)
    }
}

/// Postgres-backed [`ActivationLog`].
#[derive(Debug, Clone)]
pub struct PgActivationLog {
    pool: Arc<PgPool>,
}

impl PgActivationLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ActivationLog for PgActivationLog {
    #[instrument(skip(self, attempt), fields(outcome = attempt.outcome.as_str()), err)]
    async fn append(&self, attempt: &ActivationAttempt) -> Result<(), GiftStoreError> {
        sqlx::query(
            r#"
            INSERT INTO gift_activation_attempts (id, token, ip, user_agent, outcome, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id.as_uuid())
        .bind(&attempt.token)
        .bind(attempt.ip.map(|ip| ip.to_string()))
        .bind(attempt.user_agent.as_deref())
        .bind(attempt.outcome.as_str())
        .bind(attempt.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_attempt", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> GiftStoreError {
    GiftStoreError::Storage(db::describe(operation, &err))
}

fn decode_gift(row: &PgRow) -> Result<Gift, GiftStoreError> {
    GiftRow::from_row(row)
        .map_err(|e| GiftStoreError::Storage(format!("failed to deserialize gift row: {}", e)))?
        .try_into()
}

#[derive(Debug)]
struct GiftRow {
    id: Uuid,
    purchaser_ref: String,
    recipient_email: String,
    amount_minor: i64,
    currency: String,
    message: Option<String>,
    activation_token: String,
    status: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for GiftRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(GiftRow {
            id: row.try_get("id")?,
            purchaser_ref: row.try_get("purchaser_ref")?,
            recipient_email: row.try_get("recipient_email")?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            message: row.try_get("message")?,
            activation_token: row.try_get("activation_token")?,
            status: row.try_get("status")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            activated_at: row.try_get("activated_at")?,
        })
    }
}

impl TryFrom<GiftRow> for Gift {
    type Error = GiftStoreError;

    fn try_from(row: GiftRow) -> Result<Self, Self::Error> {
        Ok(Gift {
            id: GiftId::from_uuid(row.id),
            purchaser_ref: row.purchaser_ref,
            recipient_email: row.recipient_email,
            amount_minor: row.amount_minor,
            currency: row.currency.trim_end().to_string(),
            message: row.message,
            activation_token: row.activation_token,
            status: row
                .status
                .parse()
                .map_err(|e: DomainError| GiftStoreError::Storage(e.to_string()))?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            activated_at: row.activated_at,
        })
    }
}
