//! In-memory test doubles for the reconciliation engine's seams.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use shopfront_shared::config::StripeConfig;
use shopfront_shared::types::{SubscriptionStatus, Tier};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::accounts::{BillingStore, BillingUpdate, Business, CommittedUpdate};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ProcessorGateway, SubscriptionLookup, SubscriptionSnapshot};

pub fn stripe_test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_key".into(),
        webhook_secret: "whsec_testsecret".into(),
        foundation_price_id: "price_foundation".into(),
        managed_price_id: "price_managed".into(),
        autopilot_price_id: "price_autopilot".into(),
    }
}

/// A healthy paid account on the middle tier with live processor refs.
pub fn managed_account() -> Business {
    Business {
        id: Uuid::new_v4(),
        name: "Acme Plumbing".into(),
        email: "owner@acme.test".into(),
        slug: "acmeplumbing".into(),
        tier: Tier::Managed,
        plan_tier: Some(Tier::Managed),
        is_active: true,
        stripe_customer_id: Some("cus_1".into()),
        stripe_subscription_id: Some("sub_1".into()),
        subscription_status: Some(SubscriptionStatus::Active),
        current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(30)),
        latest_paid_period_end: None,
        cancel_at_period_end: false,
        subscription_ended_at: None,
        grace_deadline: None,
    }
}

/// Map-backed [`BillingStore`] with the same commit semantics as the
/// Postgres store: a duplicate event id fails the whole commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<Mutex<HashMap<Uuid, Business>>>,
    processed: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStore {
    pub async fn insert(&self, account: Business) {
        self.accounts.lock().await.insert(account.id, account);
    }

    pub async fn get(&self, id: Uuid) -> Option<Business> {
        self.accounts.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Business>> {
        Ok(self.get(id).await)
    }

    async fn find_by_subscription_ref(&self, sub_ref: &str) -> BillingResult<Option<Business>> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .find(|b| b.stripe_subscription_id.as_deref() == Some(sub_ref))
            .cloned())
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<Business>> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .find(|b| b.stripe_customer_id.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn has_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.processed.lock().await.contains(event_id))
    }

    async fn commit_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
        event_id: &str,
    ) -> BillingResult<()> {
        let mut processed = self.processed.lock().await;
        if !processed.insert(event_id.to_string()) {
            return Err(BillingError::EventAlreadyProcessed(event_id.to_string()));
        }
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&business_id)
            .ok_or_else(|| BillingError::AccountNotFound(business_id.to_string()))?;
        update.apply_to(account);
        Ok(())
    }

    async fn commit_reconciliation(
        &self,
        business_id: Uuid,
        event_id: &str,
        decide: &(dyn for<'a> Fn(&'a Business) -> BillingUpdate + Send + Sync),
    ) -> BillingResult<CommittedUpdate> {
        let mut processed = self.processed.lock().await;
        if !processed.insert(event_id.to_string()) {
            return Err(BillingError::EventAlreadyProcessed(event_id.to_string()));
        }
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&business_id)
            .ok_or_else(|| BillingError::AccountNotFound(business_id.to_string()))?;
        let before = account.clone();
        let update = decide(&before);
        update.apply_to(account);
        Ok(CommittedUpdate {
            before,
            after: account.clone(),
        })
    }

    async fn apply_billing_update(
        &self,
        business_id: Uuid,
        update: &BillingUpdate,
    ) -> BillingResult<()> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&business_id)
            .ok_or_else(|| BillingError::AccountNotFound(business_id.to_string()))?;
        update.apply_to(account);
        Ok(())
    }

    async fn list_with_live_subscription(&self) -> BillingResult<Vec<Business>> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .filter(|b| b.stripe_subscription_id.is_some())
            .cloned()
            .collect())
    }
}

/// Scripted processor behavior for one subscription ref.
#[derive(Clone)]
pub enum GatewayScript {
    /// Subscription exists; the second field is the paid-invoice probe result
    Found(SubscriptionSnapshot, Option<OffsetDateTime>),
    Gone,
    /// Transient failure on every call
    Fail,
}

#[derive(Clone)]
pub struct MockGateway {
    script: GatewayScript,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::scripted(GatewayScript::Fail)
    }
}

impl MockGateway {
    pub fn scripted(script: GatewayScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl ProcessorGateway for MockGateway {
    async fn retrieve_subscription(&self, _sub_ref: &str) -> BillingResult<SubscriptionLookup> {
        match &self.script {
            GatewayScript::Found(snapshot, _) => {
                Ok(SubscriptionLookup::Found(snapshot.clone()))
            }
            GatewayScript::Gone => Ok(SubscriptionLookup::Gone),
            GatewayScript::Fail => Err(BillingError::Internal("scripted gateway failure".into())),
        }
    }

    async fn latest_paid_period_end(
        &self,
        _sub_ref: &str,
    ) -> BillingResult<Option<OffsetDateTime>> {
        match &self.script {
            GatewayScript::Found(_, paid_through) => Ok(*paid_through),
            GatewayScript::Gone => Ok(None),
            GatewayScript::Fail => Err(BillingError::Internal("scripted gateway failure".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentEmail {
    Activated { to: String, tier: Tier },
    PlanChanged { to: String, old_tier: Tier, new_tier: Tier },
    Cancelled { to: String },
    PaymentIssue { to: String, status: String, grace_days: i64 },
}

/// Records every dispatch instead of sending anything.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<SentEmail>>>,
}

impl RecordingDispatcher {
    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl crate::email::NotificationDispatcher for RecordingDispatcher {
    async fn subscription_activated(&self, to: &str, tier: Tier) -> BillingResult<()> {
        self.sent
            .lock()
            .await
            .push(SentEmail::Activated { to: to.into(), tier });
        Ok(())
    }

    async fn plan_changed(&self, to: &str, old_tier: Tier, new_tier: Tier) -> BillingResult<()> {
        self.sent.lock().await.push(SentEmail::PlanChanged {
            to: to.into(),
            old_tier,
            new_tier,
        });
        Ok(())
    }

    async fn subscription_cancelled(&self, to: &str) -> BillingResult<()> {
        self.sent
            .lock()
            .await
            .push(SentEmail::Cancelled { to: to.into() });
        Ok(())
    }

    async fn payment_issue(&self, to: &str, status: &str, grace_days: i64) -> BillingResult<()> {
        self.sent.lock().await.push(SentEmail::PaymentIssue {
            to: to.into(),
            status: status.into(),
            grace_days,
        });
        Ok(())
    }
}
