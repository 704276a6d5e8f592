//! Idempotency-guarded gift operations.
//!
//! `activate` is keyed by the gift's activation token and `create_with_key` by
//! the client's idempotency key. Either way the side effect (and its outbox
//! event) happens at most once per key and every caller sees the same result.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use outpost_core::{DomainError, GiftId, SharedClock, SystemClock};
use outpost_events::NewOutboxEvent;
use outpost_gifts::{
    ActivatedGift, ActivationAttempt, ActivationOutcome, AttemptOutcome, CreateGiftRequest,
    CreateOutcome, Gift,
};

use super::store::{ActivationLog, GiftStore, GiftStoreError};
use crate::idempotency::{
    GuardError, GuardPolicy, IdempotencyGuard, IdempotencyKey, IdempotencyScope, IdempotencyStore,
    IdempotencyStoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum GiftError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A concurrent request with the same key did not finish in time.
    #[error("a request for {scope}/{key} is still in progress")]
    InFlight {
        scope: IdempotencyScope,
        key: IdempotencyKey,
    },

    #[error(transparent)]
    Store(#[from] GiftStoreError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyStoreError),

    /// The idempotency record points at a gift that no longer exists.
    #[error("idempotency record links to missing gift {0}")]
    MissingResult(GiftId),
}

impl From<GuardError<GiftStoreError>> for GiftError {
    fn from(err: GuardError<GiftStoreError>) -> Self {
        match err {
            GuardError::InFlight { scope, key } => GiftError::InFlight { scope, key },
            GuardError::Store(e) => GiftError::Idempotency(e),
            GuardError::Operation(e) => GiftError::Store(e),
        }
    }
}

impl From<GuardError<GiftError>> for GiftError {
    fn from(err: GuardError<GiftError>) -> Self {
        match err {
            GuardError::InFlight { scope, key } => GiftError::InFlight { scope, key },
            GuardError::Store(e) => GiftError::Idempotency(e),
            GuardError::Operation(e) => e,
        }
    }
}

pub struct GiftService<G, I, L> {
    store: G,
    guard: IdempotencyGuard<I>,
    log: L,
    clock: SharedClock,
}

impl<G, I, L> GiftService<G, I, L>
where
    G: GiftStore,
    I: IdempotencyStore,
    L: ActivationLog,
{
    pub fn new(store: G, idempotency: I, log: L) -> Self {
        Self {
            store,
            guard: IdempotencyGuard::new(idempotency),
            log,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_guard_policy(mut self, policy: GuardPolicy) -> Self {
        self.guard = self.guard.with_policy(policy);
        self
    }

    /// Use `clock` for gift timestamps and idempotency record ages.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.guard = self.guard.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &G {
        &self.store
    }

    /// Activate the gift behind `token`.
    ///
    /// Every call appends an audit row, whatever the outcome; a failed audit
    /// write is logged and does not change the response.
    pub async fn activate(
        &self,
        token: &str,
        ip: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> Result<ActivationOutcome, GiftError> {
        let now = self.clock.now();
        let outcome = self.resolve_activation(token, now).await;

        let recorded = match &outcome {
            Ok(o) => o.attempt_outcome(),
            Err(_) => AttemptOutcome::Failed,
        };
        let attempt = ActivationAttempt::new(token, ip, user_agent, recorded, now);
        if let Err(e) = self.log.append(&attempt).await {
            warn!(attempt_id = %attempt.id, outcome = recorded.as_str(), error = %e, "failed to record activation attempt");
        }

        outcome
    }

    async fn resolve_activation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, GiftError> {
        // Tokens that cannot be keys cannot belong to a gift either.
        let Ok(key) = IdempotencyKey::new(token) else {
            return Ok(ActivationOutcome::NotFound);
        };
        let Some(gift) = self.store.find_by_token(key.as_str()).await? else {
            return Ok(ActivationOutcome::NotFound);
        };
        if gift.is_activated() {
            return Ok(ActivationOutcome::AlreadyActivated(activated(&gift)?));
        }
        if gift.is_expired(now) {
            return Ok(ActivationOutcome::Expired);
        }

        let id = gift.id;
        let guarded = self
            .guard
            .execute(IdempotencyScope::GiftActivation, &key, || async move {
                self.store.activate(id, now).await.map(|g| *g.id.as_uuid())
            })
            .await;

        match guarded {
            Ok(g) => {
                let gift = self.reload(GiftId::from_uuid(g.result_id)).await?;
                let result = activated(&gift)?;
                if g.replayed {
                    Ok(ActivationOutcome::AlreadyActivated(result))
                } else {
                    info!(gift_id = %gift.id, "gift activated");
                    Ok(ActivationOutcome::Activated(result))
                }
            }
            Err(GuardError::Operation(GiftStoreError::AlreadyActivated(id))) => {
                let gift = self.reload(id).await?;
                Ok(ActivationOutcome::AlreadyActivated(activated(&gift)?))
            }
            Err(GuardError::Operation(GiftStoreError::Expired(_))) => Ok(ActivationOutcome::Expired),
            Err(GuardError::Operation(GiftStoreError::NotFound(_))) => {
                Ok(ActivationOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a gift at most once per client `key`.
    ///
    /// A repeated key returns the gift the first call created, even if the
    /// repeated request body differs (or is invalid). The key is also stored on
    /// the gift row, so an attempt whose idempotency record never completed is
    /// recognised when the record is taken over.
    pub async fn create_with_key(
        &self,
        key: &str,
        request: CreateGiftRequest,
    ) -> Result<CreateOutcome, GiftError> {
        let key = IdempotencyKey::new(key)?;
        let now = self.clock.now();
        let store = &self.store;
        let creation_key = key.as_str();
        let recovered = AtomicBool::new(false);
        let recovered_flag = &recovered;

        let guarded = self
            .guard
            .execute(IdempotencyScope::GiftCreation, &key, || async move {
                let gift = Gift::issue(&request, now)?;
                let event = NewOutboxEvent::from_domain(&gift.created_event())
                    .map_err(GiftStoreError::from)?;
                let id = store.insert(&gift, Some(creation_key), event).await?;
                if id == gift.id {
                    info!(gift_id = %id, "gift created");
                } else {
                    recovered_flag.store(true, Ordering::Relaxed);
                    info!(gift_id = %id, "gift already created under this key");
                }
                Ok::<_, GiftError>(*id.as_uuid())
            })
            .await?;

        let gift = self.reload(GiftId::from_uuid(guarded.result_id)).await?;
        Ok(CreateOutcome {
            gift,
            replayed: guarded.replayed || recovered.load(Ordering::Relaxed),
        })
    }

    async fn reload(&self, id: GiftId) -> Result<Gift, GiftError> {
        self.store
            .get(id)
            .await?
            .ok_or(GiftError::MissingResult(id))
    }
}

fn activated(gift: &Gift) -> Result<ActivatedGift, GiftError> {
    ActivatedGift::from_gift(gift).ok_or_else(|| {
        GiftError::Domain(DomainError::invariant(format!(
            "gift {} is marked activated without an activation time",
            gift.id
        )))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::gifts::{InMemoryActivationLog, InMemoryGiftStore};
    use crate::idempotency::{Begin, IdempotencyRecord, InMemoryIdempotencyStore};
    use crate::outbox::InMemoryOutboxStore;
    use outpost_core::ManualClock;
    use outpost_events::DomainEvent;

    type Service = GiftService<
        Arc<InMemoryGiftStore>,
        Arc<InMemoryIdempotencyStore>,
        Arc<InMemoryActivationLog>,
    >;

    struct Fixture {
        outbox: Arc<InMemoryOutboxStore>,
        log: Arc<InMemoryActivationLog>,
        clock: Arc<ManualClock>,
        service: Service,
    }

    fn fixture_with_log(log: InMemoryActivationLog) -> Fixture {
        let outbox = InMemoryOutboxStore::arc();
        let log = Arc::new(log);
        let clock = ManualClock::starting_now();
        let service = GiftService::new(
            Arc::new(InMemoryGiftStore::new(outbox.clone())),
            InMemoryIdempotencyStore::arc(),
            log.clone(),
        )
        .with_clock(clock.clone());
        Fixture {
            outbox,
            log,
            clock,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_log(InMemoryActivationLog::new())
    }

    fn request() -> CreateGiftRequest {
        CreateGiftRequest {
            purchaser_ref: "customer-12".to_string(),
            recipient_email: "ada@example.com".to_string(),
            amount_minor: 5000,
            currency: "GBP".to_string(),
            message: Some("Happy birthday".to_string()),
            valid_for_days: 365,
        }
    }

    #[tokio::test]
    async fn repeated_create_key_returns_the_first_gift() {
        let fx = fixture();

        let first = fx.service.create_with_key("order-991", request()).await.unwrap();
        let second = fx.service.create_with_key("order-991", request()).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.gift, second.gift);
        assert_eq!(fx.service.store().count().unwrap(), 1);
        assert_eq!(fx.outbox.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_create_request_leaves_no_trace() {
        let fx = fixture();
        let mut bad = request();
        bad.amount_minor = 0;

        let err = fx.service.create_with_key("k-1", bad).await.unwrap_err();
        assert!(matches!(err, GiftError::Domain(DomainError::Validation(_))));

        let err = fx.service.create_with_key("   ", request()).await.unwrap_err();
        assert!(matches!(err, GiftError::Domain(_)));
        assert!(fx.outbox.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn activation_then_replay_returns_same_payload() {
        let fx = fixture();
        let created = fx.service.create_with_key("k-2", request()).await.unwrap();
        let token = created.gift.activation_token.clone();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        let first = fx
            .service
            .activate(&token, Some(ip), Some("curl/8.5".to_string()))
            .await
            .unwrap();
        fx.clock.advance(Duration::minutes(5));
        let second = fx.service.activate(&token, None, None).await.unwrap();

        let ActivationOutcome::Activated(payload) = first else {
            panic!("expected Activated, got {first:?}");
        };
        assert_eq!(second, ActivationOutcome::AlreadyActivated(payload.clone()));
        assert_eq!(payload.gift_id, created.gift.id);
        assert_eq!(payload.amount_minor, 5000);

        let events: Vec<_> = fx.outbox.all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, DomainEvent::GIFT_ACTIVATED);

        let attempts = fx.log.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Activated);
        assert_eq!(attempts[0].ip, Some(ip));
        assert_eq!(attempts[1].outcome, AttemptOutcome::AlreadyActivated);
    }

    #[tokio::test]
    async fn unknown_and_expired_tokens_are_reported_and_audited() {
        let fx = fixture();
        let mut short = request();
        short.valid_for_days = 1;
        let created = fx.service.create_with_key("k-3", short).await.unwrap();

        let missing = fx.service.activate("no-such-token", None, None).await.unwrap();
        assert_eq!(missing, ActivationOutcome::NotFound);
        let blank = fx.service.activate("", None, None).await.unwrap();
        assert_eq!(blank, ActivationOutcome::NotFound);

        fx.clock.advance(Duration::days(2));
        let expired = fx
            .service
            .activate(&created.gift.activation_token, None, None)
            .await
            .unwrap();
        assert_eq!(expired, ActivationOutcome::Expired);

        let outcomes: Vec<_> = fx.log.attempts().iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::NotFound,
                AttemptOutcome::NotFound,
                AttemptOutcome::Expired
            ]
        );
        assert_eq!(fx.outbox.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_the_response() {
        let fx = fixture_with_log(InMemoryActivationLog::unavailable());
        let created = fx.service.create_with_key("k-4", request()).await.unwrap();

        let outcome = fx
            .service
            .activate(&created.gift.activation_token, None, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ActivationOutcome::Activated(_)));
        assert!(fx.log.attempts().is_empty());
    }

    #[tokio::test]
    async fn replayed_key_ignores_an_invalid_body() {
        let fx = fixture();
        let first = fx.service.create_with_key("k-5", request()).await.unwrap();

        let mut bad = request();
        bad.amount_minor = 0;
        let again = fx.service.create_with_key("k-5", bad).await.unwrap();

        assert!(again.replayed);
        assert_eq!(again.gift, first.gift);
    }

    /// Delegates to an in-memory store but fails the next `complete` call.
    struct LosesNextCompletion {
        inner: InMemoryIdempotencyStore,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl IdempotencyStore for LosesNextCompletion {
        async fn begin(
            &self,
            scope: IdempotencyScope,
            key: &IdempotencyKey,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> Result<Begin, IdempotencyStoreError> {
            self.inner.begin(scope, key, now, stale_before).await
        }

        async fn complete(
            &self,
            scope: IdempotencyScope,
            key: &IdempotencyKey,
            result_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<(), IdempotencyStoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(IdempotencyStoreError::Storage("connection reset".to_string()));
            }
            self.inner.complete(scope, key, result_id, now).await
        }

        async fn abandon(
            &self,
            scope: IdempotencyScope,
            key: &IdempotencyKey,
        ) -> Result<(), IdempotencyStoreError> {
            self.inner.abandon(scope, key).await
        }

        async fn get(
            &self,
            scope: IdempotencyScope,
            key: &IdempotencyKey,
        ) -> Result<Option<IdempotencyRecord>, IdempotencyStoreError> {
            self.inner.get(scope, key).await
        }

        async fn delete_expired_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<u64, IdempotencyStoreError> {
            self.inner.delete_expired_before(cutoff, limit).await
        }
    }

    #[tokio::test]
    async fn lost_completion_does_not_create_a_second_gift() {
        let outbox = InMemoryOutboxStore::arc();
        let clock = ManualClock::starting_now();
        let idempotency = Arc::new(LosesNextCompletion {
            inner: InMemoryIdempotencyStore::new(),
            fail_next: AtomicBool::new(true),
        });
        let service = GiftService::new(
            Arc::new(InMemoryGiftStore::new(outbox.clone())),
            idempotency.clone(),
            Arc::new(InMemoryActivationLog::new()),
        )
        .with_clock(clock.clone());

        let err = service.create_with_key("abc", request()).await.unwrap_err();
        assert!(matches!(err, GiftError::Idempotency(_)));
        assert_eq!(service.store().count().unwrap(), 1);

        // The unfinished record goes stale and the retry takes it over.
        clock.advance(Duration::seconds(61));
        let retried = service.create_with_key("abc", request()).await.unwrap();

        assert!(retried.replayed);
        assert_eq!(service.store().count().unwrap(), 1);
        assert_eq!(outbox.all().unwrap().len(), 1);

        let key = IdempotencyKey::new("abc").unwrap();
        let record = idempotency
            .get(IdempotencyScope::GiftCreation, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.completed_result(), Some(*retried.gift.id.as_uuid()));
    }
}
