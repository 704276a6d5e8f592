//! Responses of the guarded gift operations and the activation audit row.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outpost_core::{AttemptId, DomainError, GiftId};

use crate::gift::Gift;

/// Result payload of a successful activation.
///
/// Built from the stored gift only, so a replay returns a value identical to
/// the one the first caller received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedGift {
    pub gift_id: GiftId,
    pub amount_minor: i64,
    pub currency: String,
    pub message: Option<String>,
    pub activated_at: DateTime<Utc>,
}

impl ActivatedGift {
    /// `None` if the gift has not been activated.
    pub fn from_gift(gift: &Gift) -> Option<Self> {
        gift.activated_at.map(|activated_at| Self {
            gift_id: gift.id,
            amount_minor: gift.amount_minor,
            currency: gift.currency.clone(),
            message: gift.message.clone(),
            activated_at,
        })
    }
}

/// Response of `activate(token, ip, user_agent)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "gift", rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// This call activated the gift.
    Activated(ActivatedGift),
    /// An earlier call (or a concurrent one) activated it; same payload.
    AlreadyActivated(ActivatedGift),
    NotFound,
    Expired,
}

impl ActivationOutcome {
    pub fn gift(&self) -> Option<&ActivatedGift> {
        match self {
            ActivationOutcome::Activated(g) | ActivationOutcome::AlreadyActivated(g) => Some(g),
            ActivationOutcome::NotFound | ActivationOutcome::Expired => None,
        }
    }

    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            ActivationOutcome::Activated(_) => AttemptOutcome::Activated,
            ActivationOutcome::AlreadyActivated(_) => AttemptOutcome::AlreadyActivated,
            ActivationOutcome::NotFound => AttemptOutcome::NotFound,
            ActivationOutcome::Expired => AttemptOutcome::Expired,
        }
    }
}

/// Outcome column of the activation audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Activated,
    AlreadyActivated,
    NotFound,
    Expired,
    /// The attempt errored before producing a response.
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Activated => "activated",
            AttemptOutcome::AlreadyActivated => "already_activated",
            AttemptOutcome::NotFound => "not_found",
            AttemptOutcome::Expired => "expired",
            AttemptOutcome::Failed => "failed",
        }
    }
}

impl core::str::FromStr for AttemptOutcome {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activated" => Ok(AttemptOutcome::Activated),
            "already_activated" => Ok(AttemptOutcome::AlreadyActivated),
            "not_found" => Ok(AttemptOutcome::NotFound),
            "expired" => Ok(AttemptOutcome::Expired),
            "failed" => Ok(AttemptOutcome::Failed),
            other => Err(DomainError::validation(format!("unknown attempt outcome '{other}'"))),
        }
    }
}

/// Append-only audit row; written for every activation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationAttempt {
    pub id: AttemptId,
    pub token: String,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub outcome: AttemptOutcome,
    pub created_at: DateTime<Utc>,
}

impl ActivationAttempt {
    pub fn new(
        token: impl Into<String>,
        ip: Option<IpAddr>,
        user_agent: Option<String>,
        outcome: AttemptOutcome,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            token: token.into(),
            ip,
            user_agent,
            outcome,
            created_at,
        }
    }
}

/// Response of `create_with_key(key, request)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub gift: Gift,
    /// `true` when the key had already produced this gift.
    pub replayed: bool,
}
