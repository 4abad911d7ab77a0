//! Tenant account records and the billing store
//!
//! `BillingUpdate` is the explicit, typed partial update applied to an
//! account's billing fields: every mutable field is a named option, so the
//! set of things a webhook can change stays auditable. The Postgres store
//! commits an update and its idempotency ledger record in one transaction;
//! for reconciliation the update is derived from the row as locked, so each
//! notification is one atomic read-modify-write.

use async_trait::async_trait;
use shopfront_shared::types::{SubscriptionStatus, Tier};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger;

/// A registered business account (billing-relevant fields)
#[derive(Debug, Clone)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub slug: String,
    /// Effective entitlement level; mutated only by the policy engine
    pub tier: Tier,
    /// The paid tier the account purchased, kept across suspensions and
    /// grace windows so recovery restores the right level
    pub plan_tier: Option<Tier>,
    /// Administrative flag; billing never sets this false
    pub is_active: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub current_period_end: Option<OffsetDateTime>,
    /// End of the most recent paid invoice's service period; the
    /// authoritative "access covers through" marker
    pub latest_paid_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Once set the subscription is terminally over regardless of status
    pub subscription_ended_at: Option<OffsetDateTime>,
    pub grace_deadline: Option<OffsetDateTime>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Business {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let tier: String = row.try_get("tier")?;
        let plan_tier: Option<String> = row.try_get("plan_tier")?;
        let status: Option<String> = row.try_get("subscription_status")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            slug: row.try_get("slug")?,
            // Unknown stored values decode to the lowest tier / no status
            // rather than failing the row.
            tier: tier.parse().unwrap_or(Tier::Free),
            plan_tier: plan_tier.and_then(|t| t.parse().ok()),
            is_active: row.try_get("is_active")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            subscription_status: status.and_then(|s| s.parse().ok()),
            current_period_end: row.try_get("current_period_end")?,
            latest_paid_period_end: row.try_get("latest_paid_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            subscription_ended_at: row.try_get("subscription_ended_at")?,
            grace_deadline: row.try_get("grace_deadline")?,
        })
    }
}

/// Typed partial update of an account's billing fields.
///
/// `None` leaves a field untouched. For nullable columns the inner option
/// distinguishes "set to a value" from "clear".
#[derive(Debug, Clone, Default)]
pub struct BillingUpdate {
    pub tier: Option<Tier>,
    pub plan_tier: Option<Tier>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<Option<String>>,
    pub subscription_status: Option<Option<SubscriptionStatus>>,
    pub current_period_end: Option<Option<OffsetDateTime>>,
    pub latest_paid_period_end: Option<Option<OffsetDateTime>>,
    pub cancel_at_period_end: Option<bool>,
    pub subscription_ended_at: Option<Option<OffsetDateTime>>,
    pub grace_deadline: Option<Option<OffsetDateTime>>,
}

impl BillingUpdate {
    /// Mirror of the SQL UPDATE, used by the in-memory store and to project
    /// the post-commit state without a re-read.
    pub fn apply_to(&self, account: &mut Business) {
        if let Some(tier) = self.tier {
            account.tier = tier;
        }
        if let Some(plan_tier) = self.plan_tier {
            account.plan_tier = Some(plan_tier);
        }
        if let Some(ref customer) = self.stripe_customer_id {
            account.stripe_customer_id = Some(customer.clone());
        }
        if let Some(ref subscription) = self.stripe_subscription_id {
            account.stripe_subscription_id = subscription.clone();
        }
        if let Some(status) = self.subscription_status {
            account.subscription_status = status;
        }
        if let Some(cpe) = self.current_period_end {
            account.current_period_end = cpe;
        }
        if let Some(lppe) = self.latest_paid_period_end {
            account.latest_paid_period_end = lppe;
        }
        if let Some(cape) = self.cancel_at_period_end {
            account.cancel_at_period_end = cape;
        }
        if let Some(ended) = self.subscription_ended_at {
            account.subscription_ended_at = ended;
        }
        if let Some(grace) = self.grace_deadline {
            account.grace_deadline = grace;
        }
    }
}

/// The account state a reconciling commit observed and produced
#[derive(Debug, Clone)]
pub struct CommittedUpdate {
    pub before: Business,
    pub after: Business,
}

/// Persistence seam for the reconciliation engine
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Business>>;

    async fn find_by_subscription_ref(&self, sub_ref: &str) -> BillingResult<Option<Business>>;

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Business>>;

    /// Whether this event id has already had its effects applied
    async fn has_processed(&self, event_id: &str) -> BillingResult<bool>;

    /// Apply `update` to the account and record `event_id` in the
    /// idempotency ledger as one atomic unit.
    async fn commit_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
        event_id: &str,
    ) -> BillingResult<()>;

    /// One atomic read-modify-write: lock the row, derive the update from
    /// the locked state via `decide`, apply it and record `event_id` in the
    /// idempotency ledger, all in one transaction.
    ///
    /// `decide` must be pure over the row it is given; it may run against a
    /// newer row than the caller last read.
    async fn commit_reconciliation(
        &self,
        business_id: Uuid,
        event_id: &str,
        decide: &(dyn for<'a> Fn(&'a Business) -> BillingUpdate + Send + Sync),
    ) -> BillingResult<CommittedUpdate>;

    /// Apply `update` without a ledger record (checkout binding, the
    /// periodic sweep).
    async fn apply_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
    ) -> BillingResult<()>;

    /// Accounts holding a live subscription ref, for the re-resolution sweep
    async fn list_with_live_subscription(&self) -> BillingResult<Vec<Business>>;
}

const SELECT_BUSINESS: &str = r#"
    SELECT id, name, email, slug, tier, plan_tier, is_active,
           stripe_customer_id, stripe_subscription_id, subscription_status,
           current_period_end, latest_paid_period_end, cancel_at_period_end,
           subscription_ended_at, grace_deadline
    FROM businesses
"#;

// One static statement covering the full auditable set of mutable billing
// fields. Set-only fields use COALESCE; clearable fields use a flag + value
// pair so NULL writes are explicit.
const UPDATE_BILLING_FIELDS: &str = r#"
    UPDATE businesses SET
        tier = COALESCE($2, tier),
        plan_tier = COALESCE($3, plan_tier),
        stripe_customer_id = COALESCE($4, stripe_customer_id),
        stripe_subscription_id = CASE WHEN $5 THEN $6 ELSE stripe_subscription_id END,
        subscription_status = CASE WHEN $7 THEN $8 ELSE subscription_status END,
        current_period_end = CASE WHEN $9 THEN $10 ELSE current_period_end END,
        latest_paid_period_end = CASE WHEN $11 THEN $12 ELSE latest_paid_period_end END,
        cancel_at_period_end = COALESCE($13, cancel_at_period_end),
        subscription_ended_at = CASE WHEN $14 THEN $15 ELSE subscription_ended_at END,
        grace_deadline = CASE WHEN $16 THEN $17 ELSE grace_deadline END,
        updated_at = NOW()
    WHERE id = $1
"#;

/// Postgres-backed billing store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn bind_update<'q>(
        update: &'q BillingUpdate,
        business_id: Uuid,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(UPDATE_BILLING_FIELDS)
            .bind(business_id)
            .bind(update.tier.map(|t| t.as_str()))
            .bind(update.plan_tier.map(|t| t.as_str()))
            .bind(update.stripe_customer_id.as_deref())
            .bind(update.stripe_subscription_id.is_some())
            .bind(update.stripe_subscription_id.clone().flatten())
            .bind(update.subscription_status.is_some())
            .bind(update.subscription_status.flatten().map(|s| s.as_str()))
            .bind(update.current_period_end.is_some())
            .bind(update.current_period_end.flatten())
            .bind(update.latest_paid_period_end.is_some())
            .bind(update.latest_paid_period_end.flatten())
            .bind(update.cancel_at_period_end)
            .bind(update.subscription_ended_at.is_some())
            .bind(update.subscription_ended_at.flatten())
            .bind(update.grace_deadline.is_some())
            .bind(update.grace_deadline.flatten())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Business>> {
        let business = sqlx::query_as(&format!("{SELECT_BUSINESS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(business)
    }

    async fn find_by_subscription_ref(&self, sub_ref: &str) -> BillingResult<Option<Business>> {
        let business =
            sqlx::query_as(&format!("{SELECT_BUSINESS} WHERE stripe_subscription_id = $1"))
                .bind(sub_ref)
                .fetch_optional(&self.pool)
                .await?;
        Ok(business)
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Business>> {
        let business =
            sqlx::query_as(&format!("{SELECT_BUSINESS} WHERE stripe_customer_id = $1"))
                .bind(customer_ref)
                .fetch_optional(&self.pool)
                .await?;
        Ok(business)
    }

    async fn has_processed(&self, event_id: &str) -> BillingResult<bool> {
        ledger::has_processed(&self.pool, event_id).await
    }

    async fn commit_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
        event_id: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes two concurrent notifications for the same
        // account; each then writes its fully-computed state.
        sqlx::query("SELECT id FROM businesses WHERE id = $1 FOR UPDATE")
            .bind(business_id)
            .fetch_one(&mut *tx)
            .await?;

        Self::bind_update(update, business_id)
            .execute(&mut *tx)
            .await?;

        ledger::record(&mut tx, event_id).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_reconciliation(
        &self,
        business_id: Uuid,
        event_id: &str,
        decide: &(dyn for<'a> Fn(&'a Business) -> BillingUpdate + Send + Sync),
    ) -> BillingResult<CommittedUpdate> {
        let mut tx = self.pool.begin().await?;

        // The decision runs over the row as locked, never over an earlier
        // read, so concurrent notifications cannot lose each other's
        // writes (a second first-time past_due must see the deadline the
        // first one just pinned).
        let before: Business =
            sqlx::query_as(&format!("{SELECT_BUSINESS} WHERE id = $1 FOR UPDATE"))
                .bind(business_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| BillingError::AccountNotFound(business_id.to_string()))?;

        let update = decide(&before);

        Self::bind_update(&update, business_id)
            .execute(&mut *tx)
            .await?;

        ledger::record(&mut tx, event_id).await?;

        tx.commit().await?;

        let mut after = before.clone();
        update.apply_to(&mut after);
        Ok(CommittedUpdate { before, after })
    }

    async fn apply_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
    ) -> BillingResult<()> {
        Self::bind_update(update, business_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_with_live_subscription(&self) -> BillingResult<Vec<Business>> {
        let businesses =
            sqlx::query_as(&format!("{SELECT_BUSINESS} WHERE stripe_subscription_id IS NOT NULL"))
                .fetch_all(&self.pool)
                .await?;
        Ok(businesses)
    }
}
