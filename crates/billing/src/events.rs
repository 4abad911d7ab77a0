//! Billing audit trail
//!
//! Append-only record of billing-driven transitions. Logging failure never
//! interrupts the main flow; callers log a warning and continue.

use sqlx::PgPool;
use uuid::Uuid;

/// Actor responsible for an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    System,
    Business,
    Admin,
}

impl ActorType {
    fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Business => "business",
            ActorType::Admin => "admin",
        }
    }
}

/// Writes audit rows; cheap to clone
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an action. Errors are swallowed after a warning so audit
    /// persistence can never fail a webhook.
    pub async fn log(
        &self,
        business_id: Uuid,
        actor: ActorType,
        action: &str,
        details: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (business_id, actor_type, action, details, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(business_id)
        .bind(actor.as_str())
        .bind(action)
        .bind(details)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                business_id = %business_id,
                action = %action,
                error = %e,
                "Failed to write billing audit event"
            );
        }
    }
}
