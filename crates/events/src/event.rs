//! Typed documents carried in outbox payloads.
//!
//! Outbox rows store their payload as raw JSON. At the publish boundary the
//! dispatcher decodes it into a [`DomainEvent`], so a malformed payload for a
//! known event type is rejected (and retried/dead-lettered) instead of being
//! forwarded to consumers. Unknown event types pass through as
//! [`DomainEvent::Other`] for forward compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use outpost_core::GiftId;

/// A gift was purchased and is waiting for activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftCreated {
    pub gift_id: GiftId,
    pub amount_minor: i64,
    pub currency: String,
    pub recipient_email: String,
}

/// A gift was redeemed with its activation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftActivated {
    pub gift_id: GiftId,
    pub activated_at: DateTime<Utc>,
}

/// An order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub total_minor: i64,
    pub currency: String,
}

/// An order moved between lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: String,
    pub from: String,
    pub to: String,
}

/// Structured payload of an outbox event, one variant per known event type.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    GiftCreated(GiftCreated),
    GiftActivated(GiftActivated),
    OrderPlaced(OrderPlaced),
    OrderStatusChanged(OrderStatusChanged),
    /// Event type this build does not know about; forwarded untouched.
    Other {
        event_type: String,
        payload: JsonValue,
    },
}

/// A payload that does not match the schema of its declared event type.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload for '{event_type}' is invalid: {source}")]
    Invalid {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload for '{0}' could not be serialized")]
    Serialize(String),
}

impl DomainEvent {
    pub const GIFT_CREATED: &'static str = "gift.created";
    pub const GIFT_ACTIVATED: &'static str = "gift.activated";
    pub const ORDER_PLACED: &'static str = "order.placed";
    pub const ORDER_STATUS_CHANGED: &'static str = "order.status_changed";

    /// Decode a stored `(event_type, payload)` pair.
    pub fn decode(event_type: &str, payload: &JsonValue) -> Result<Self, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event_type: &str,
            payload: &JsonValue,
        ) -> Result<T, PayloadError> {
            T::deserialize(payload).map_err(|source| PayloadError::Invalid {
                event_type: event_type.to_string(),
                source,
            })
        }

        Ok(match event_type {
            Self::GIFT_CREATED => Self::GiftCreated(parse(event_type, payload)?),
            Self::GIFT_ACTIVATED => Self::GiftActivated(parse(event_type, payload)?),
            Self::ORDER_PLACED => Self::OrderPlaced(parse(event_type, payload)?),
            Self::ORDER_STATUS_CHANGED => Self::OrderStatusChanged(parse(event_type, payload)?),
            other => Self::Other {
                event_type: other.to_string(),
                payload: payload.clone(),
            },
        })
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::GiftCreated(_) => Self::GIFT_CREATED,
            Self::GiftActivated(_) => Self::GIFT_ACTIVATED,
            Self::OrderPlaced(_) => Self::ORDER_PLACED,
            Self::OrderStatusChanged(_) => Self::ORDER_STATUS_CHANGED,
            Self::Other { event_type, .. } => event_type,
        }
    }

    /// Aggregate tag and id this event belongs to, when the variant knows it.
    pub fn aggregate(&self) -> Option<(&'static str, String)> {
        match self {
            Self::GiftCreated(e) => Some(("gift", e.gift_id.to_string())),
            Self::GiftActivated(e) => Some(("gift", e.gift_id.to_string())),
            Self::OrderPlaced(e) => Some(("order", e.order_id.clone())),
            Self::OrderStatusChanged(e) => Some(("order", e.order_id.clone())),
            Self::Other { .. } => None,
        }
    }

    /// Encode back into the JSON document stored in the outbox row.
    pub fn to_payload(&self) -> Result<JsonValue, PayloadError> {
        let encoded = match self {
            Self::GiftCreated(e) => serde_json::to_value(e),
            Self::GiftActivated(e) => serde_json::to_value(e),
            Self::OrderPlaced(e) => serde_json::to_value(e),
            Self::OrderStatusChanged(e) => serde_json::to_value(e),
            Self::Other { payload, .. } => Ok(payload.clone()),
        };
        encoded.map_err(|_| PayloadError::Serialize(self.event_type().to_string()))
    }
}
