//! Postgres-backed idempotency records.
//!
//! `begin` never holds a lock across the guarded operation. Ownership is
//! decided by single statements: `INSERT … ON CONFLICT DO NOTHING` for a fresh
//! key, a conditional `UPDATE` on `updated_at` for taking over a stale one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{IdempotencyStore, IdempotencyStoreError};
use super::types::{Begin, IdempotencyKey, IdempotencyRecord, IdempotencyScope};
use crate::db::{self, SqlxErrorKind};

#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: Arc<PgPool>,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    #[instrument(skip(self), fields(scope = %scope, key = %key), err)]
    async fn begin(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Begin, IdempotencyStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (scope, key, success, result_id, created_at, updated_at)
            VALUES ($1, $2, FALSE, NULL, $3, $3)
            ON CONFLICT (scope, key) DO NOTHING
            "#,
        )
        .bind(scope.as_str())
        .bind(key.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() == 1 => return Ok(Begin::Acquired),
            Ok(_) => {}
            // A racing insert can still surface as a unique violation.
            Err(e) if db::classify(&e) == SqlxErrorKind::UniqueViolation => {
                return Ok(Begin::InFlight);
            }
            Err(e) => return Err(map_sqlx_error("insert_record", e)),
        }

        let taken_over = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET updated_at = $3
            WHERE scope = $1 AND key = $2 AND success = FALSE AND updated_at <= $4
            "#,
        )
        .bind(scope.as_str())
        .bind(key.as_str())
        .bind(now)
        .bind(stale_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("take_over_record", e))?;

        if taken_over.rows_affected() == 1 {
            tracing::warn!(scope = %scope, key = %key, "taking over stale idempotency record");
            return Ok(Begin::Acquired);
        }

        match self.get(scope, key).await?.and_then(|r| r.completed_result()) {
            Some(result) => Ok(Begin::Completed(result)),
            // Unfinished, or abandoned between our statements: poll again later.
            None => Ok(Begin::InFlight),
        }
    }

    #[instrument(skip(self), fields(scope = %scope, key = %key), err)]
    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
        result_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET success = TRUE, result_id = $3, updated_at = $4
            WHERE scope = $1 AND key = $2
            "#,
        )
        .bind(scope.as_str())
        .bind(key.as_str())
        .bind(result_id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if updated.rows_affected() == 0 {
            return Err(IdempotencyStoreError::NotFound {
                scope,
                key: key.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(scope = %scope, key = %key), err)]
    async fn abandon(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<(), IdempotencyStoreError> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE scope = $1 AND key = $2 AND success = FALSE
            "#,
        )
        .bind(scope.as_str())
        .bind(key.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("abandon", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(scope = %scope, key = %key), err)]
    async fn get(
        &self,
        scope: IdempotencyScope,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
        let row = sqlx::query(
            r#"
            SELECT scope, key, success, result_id, created_at, updated_at
            FROM idempotency_records
            WHERE scope = $1 AND key = $2
            "#,
        )
        .bind(scope.as_str())
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| {
            RecordRow::from_row(&r)
                .map_err(|e| {
                    IdempotencyStoreError::Storage(format!("failed to deserialize record: {}", e))
                })?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete_expired_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, IdempotencyStoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE (scope, key) IN (
                SELECT scope, key
                FROM idempotency_records
                WHERE success = TRUE
                  AND result_id IS NOT NULL
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
        .map_err(|e| map_sqlx_error("delete_expired_before", e))?;

        Ok(deleted.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyStoreError {
    IdempotencyStoreError::Storage(db::describe(operation, &err))
}

#[derive(Debug)]
struct RecordRow {
    scope: String,
    key: String,
    success: bool,
    result_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            scope: row.try_get("scope")?,
            key: row.try_get("key")?,
            success: row.try_get("success")?,
            result_id: row.try_get("result_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RecordRow> for IdempotencyRecord {
    type Error = IdempotencyStoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let invalid = |e: outpost_core::DomainError| IdempotencyStoreError::Storage(e.to_string());
        Ok(IdempotencyRecord {
            scope: row.scope.parse().map_err(invalid)?,
            key: IdempotencyKey::new(row.key).map_err(invalid)?,
            success: row.success,
            result_id: row.result_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
