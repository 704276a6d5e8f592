//! Postgres wiring shared by the stores: pool setup, bundled migrations and
//! SQLx error classification.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Apply the bundled schema (`crates/infra/migrations`).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// What a failed statement means to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlxErrorKind {
    /// `23505`
    UniqueViolation,
    /// `23503`
    ForeignKeyViolation,
    /// `23514`
    CheckViolation,
    Other,
}

pub(crate) fn classify(err: &sqlx::Error) -> SqlxErrorKind {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return match code.as_ref() {
                "23505" => SqlxErrorKind::UniqueViolation,
                "23503" => SqlxErrorKind::ForeignKeyViolation,
                "23514" => SqlxErrorKind::CheckViolation,
                _ => SqlxErrorKind::Other,
            };
        }
    }
    SqlxErrorKind::Other
}

/// Human-readable message naming the failed operation.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {}: {}", operation, db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {}", operation),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    }
}

/// Clamp a caller-supplied batch size to a Postgres `LIMIT` value.
pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
