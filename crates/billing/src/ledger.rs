//! Idempotency ledger
//!
//! Write-once record of processed notification ids. A row for an event id is
//! proof that the notification's side effects have been fully applied; the
//! row is written in the same transaction as the account mutation it guards,
//! so a crash in between causes at most a re-run of an idempotent
//! transition.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// A processed-notification row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub received_at: OffsetDateTime,
}

/// Whether this event id has already had its effects applied
pub async fn has_processed(pool: &PgPool, event_id: &str) -> BillingResult<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT event_id FROM stripe_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

/// Record an event id inside the caller's transaction.
///
/// Returns [`BillingError::EventAlreadyProcessed`] on a duplicate; callers
/// that checked [`has_processed`] first treat that as a safe no-op, not a
/// failure.
pub async fn record(tx: &mut Transaction<'_, Postgres>, event_id: &str) -> BillingResult<()> {
    let result = sqlx::query(
        "INSERT INTO stripe_webhook_events (event_id, received_at) VALUES ($1, NOW())",
    )
    .bind(event_id)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(BillingError::EventAlreadyProcessed(event_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
