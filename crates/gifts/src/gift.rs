//! The gift entity and its pure transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outpost_core::{DomainError, DomainResult, GiftId};
use outpost_events::{DomainEvent, GiftActivated, GiftCreated};

/// Days a gift stays redeemable when the request does not say otherwise.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftStatus {
    PendingActivation,
    Activated,
}

impl GiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftStatus::PendingActivation => "pending_activation",
            GiftStatus::Activated => "activated",
        }
    }
}

impl core::str::FromStr for GiftStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_activation" => Ok(GiftStatus::PendingActivation),
            "activated" => Ok(GiftStatus::Activated),
            other => Err(DomainError::validation(format!("unknown gift status '{other}'"))),
        }
    }
}

/// Client request to create a gift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGiftRequest {
    pub purchaser_ref: String,
    pub recipient_email: String,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_validity_days")]
    pub valid_for_days: u32,
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl CreateGiftRequest {
    pub fn validate(&self) -> DomainResult<()> {
        if self.purchaser_ref.trim().is_empty() {
            return Err(DomainError::validation("purchaser_ref must not be empty"));
        }
        if !self.recipient_email.contains('@') {
            return Err(DomainError::validation("recipient_email is not an email address"));
        }
        if self.amount_minor <= 0 {
            return Err(DomainError::validation("amount_minor must be positive"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(DomainError::validation("currency must be a 3-letter ISO code"));
        }
        if self.valid_for_days == 0 {
            return Err(DomainError::validation("valid_for_days must be at least 1"));
        }
        Ok(())
    }
}

/// A purchased gift, redeemable once with its activation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gift {
    pub id: GiftId,
    pub purchaser_ref: String,
    pub recipient_email: String,
    pub amount_minor: i64,
    pub currency: String,
    pub message: Option<String>,
    pub activation_token: String,
    pub status: GiftStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Unguessable one-time activation token (128 random bits, hex).
pub fn generate_activation_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Gift {
    /// Issue a new gift from a validated request.
    pub fn issue(request: &CreateGiftRequest, now: DateTime<Utc>) -> DomainResult<Self> {
        request.validate()?;

        Ok(Self {
            id: GiftId::new(),
            purchaser_ref: request.purchaser_ref.clone(),
            recipient_email: request.recipient_email.clone(),
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
            message: request.message.clone(),
            activation_token: generate_activation_token(),
            status: GiftStatus::PendingActivation,
            expires_at: now + Duration::days(i64::from(request.valid_for_days)),
            created_at: now,
            activated_at: None,
        })
    }

    pub fn is_activated(&self) -> bool {
        self.status == GiftStatus::Activated
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_activated() && now >= self.expires_at
    }

    /// Redeem the gift.
    pub fn activate(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_activated() {
            return Err(DomainError::conflict(format!("gift {} is already activated", self.id)));
        }
        if self.is_expired(now) {
            return Err(DomainError::invariant(format!("gift {} has expired", self.id)));
        }
        self.status = GiftStatus::Activated;
        self.activated_at = Some(now);
        Ok(())
    }

    pub fn created_event(&self) -> DomainEvent {
        DomainEvent::GiftCreated(GiftCreated {
            gift_id: self.id,
            amount_minor: self.amount_minor,
            currency: self.currency.clone(),
            recipient_email: self.recipient_email.clone(),
        })
    }

    /// `None` until the gift has been activated.
    pub fn activated_event(&self) -> Option<DomainEvent> {
        self.activated_at.map(|activated_at| {
            DomainEvent::GiftActivated(GiftActivated {
                gift_id: self.id,
                activated_at,
            })
        })
    }
}
