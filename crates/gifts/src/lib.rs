//! Gift domain: the two externally-triggered transitions guarded by
//! idempotency keys (creation and activation) and the audit trail of
//! activation attempts.
//!
//! Pure model only; persistence and the guard live in `outpost-infra`.

pub mod activation;
pub mod gift;

pub use activation::{ActivatedGift, ActivationAttempt, ActivationOutcome, AttemptOutcome, CreateOutcome};
pub use gift::{CreateGiftRequest, Gift, GiftStatus, generate_activation_token};
