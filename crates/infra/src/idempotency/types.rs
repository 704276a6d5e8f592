use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outpost_core::DomainError;

/// Which guarded operation a key belongs to. Keys are unique per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// Key = one-time activation token.
    GiftActivation,
    /// Key = client-supplied idempotency key.
    GiftCreation,
}

impl IdempotencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::GiftActivation => "gift_activation",
            IdempotencyScope::GiftCreation => "gift_creation",
        }
    }
}

impl core::str::FromStr for IdempotencyScope {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gift_activation" => Ok(IdempotencyScope::GiftActivation),
            "gift_creation" => Ok(IdempotencyScope::GiftCreation),
            other => Err(DomainError::validation(format!("unknown idempotency scope '{other}'"))),
        }
    }
}

impl core::fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LENGTH: usize = 255;

    /// Surrounding whitespace is trimmed before validation.
    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }
        if key.len() > Self::MAX_LENGTH {
            return Err(DomainError::validation(format!(
                "idempotency key exceeds {} bytes",
                Self::MAX_LENGTH
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "idempotency key contains control characters",
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

/// Durable key → outcome mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub scope: IdempotencyScope,
    pub key: IdempotencyKey,
    pub success: bool,
    /// Entity produced by the guarded operation; set together with `success`.
    pub result_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Last time an attempt touched the record (creation, takeover, completion).
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn started(scope: IdempotencyScope, key: IdempotencyKey, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            key,
            success: false,
            result_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The linked result, once the operation completed.
    pub fn completed_result(&self) -> Option<Uuid> {
        if self.success { self.result_id } else { None }
    }

    /// An unfinished attempt last touched at or before `stale_before` is
    /// presumed dead.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        !self.success && self.updated_at <= stale_before
    }

    /// Eligible for the retention sweep.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.success && self.result_id.is_some() && self.created_at < cutoff
    }
}

/// Answer of `IdempotencyStore::begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// The caller owns the key and must run the operation.
    Acquired,
    /// A previous attempt finished; replay its result.
    Completed(Uuid),
    /// Another attempt holds the key.
    InFlight,
}
