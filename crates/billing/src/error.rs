//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    /// The idempotency ledger already holds this event id. Callers that
    /// checked `has_processed` first treat this as a safe no-op.
    #[error("event already processed: {0}")]
    EventAlreadyProcessed(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("invalid tier: {0}")]
    InvalidTier(String),

    #[error("email dispatch failed: {0}")]
    Email(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("internal error: {0}")]
    Internal(String),
}
