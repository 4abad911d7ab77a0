//! Billing email dispatch
//!
//! Fire-and-forget collaborator: a failed send is logged and never rolls
//! back the state mutation or the idempotency record. The production
//! implementation drives Brevo transactional templates; tests swap in a
//! recording dispatcher.

use async_trait::async_trait;
use serde_json::json;
use shopfront_shared::config::BrevoConfig;
use shopfront_shared::types::Tier;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Outbound billing notifications keyed by what happened
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// First transition from free to a paid tier
    async fn subscription_activated(&self, to: &str, tier: Tier) -> BillingResult<()>;

    /// Paid-to-paid tier change
    async fn plan_changed(&self, to: &str, old_tier: Tier, new_tier: Tier) -> BillingResult<()>;

    /// Paid access ended
    async fn subscription_cancelled(&self, to: &str) -> BillingResult<()>;

    /// Payment failure with the grace window still open
    async fn payment_issue(&self, to: &str, status: &str, grace_days: i64) -> BillingResult<()>;
}

// Brevo transactional template ids
const TEMPLATE_SUBSCRIPTION_ACTIVATED: u32 = 17;
const TEMPLATE_PLAN_CHANGED: u32 = 18;
const TEMPLATE_SUBSCRIPTION_CANCELLED: u32 = 19;
const TEMPLATE_PAYMENT_ISSUE: u32 = 21;

/// Brevo-backed dispatcher
#[derive(Clone)]
pub struct BrevoEmailService {
    http: reqwest::Client,
    config: BrevoConfig,
}

impl BrevoEmailService {
    pub fn new(config: BrevoConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn today() -> String {
        let format = format_description!("[day] [month repr:long] [year]");
        OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_default()
    }

    async fn send_template(
        &self,
        to: &str,
        template_id: u32,
        params: serde_json::Value,
    ) -> BillingResult<()> {
        let url = format!("{}/v3/smtp/email", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(&json!({
                "to": [{"email": to}],
                "templateId": template_id,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Email(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::Email(format!(
                "brevo template {template_id} returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for BrevoEmailService {
    async fn subscription_activated(&self, to: &str, tier: Tier) -> BillingResult<()> {
        self.send_template(
            to,
            TEMPLATE_SUBSCRIPTION_ACTIVATED,
            json!({ "TIER": tier.as_str(), "DATE": Self::today() }),
        )
        .await
    }

    async fn plan_changed(&self, to: &str, old_tier: Tier, new_tier: Tier) -> BillingResult<()> {
        self.send_template(
            to,
            TEMPLATE_PLAN_CHANGED,
            json!({
                "OLD_TIER": old_tier.as_str(),
                "NEW_TIER": new_tier.as_str(),
                "DATE": Self::today(),
            }),
        )
        .await
    }

    async fn subscription_cancelled(&self, to: &str) -> BillingResult<()> {
        self.send_template(
            to,
            TEMPLATE_SUBSCRIPTION_CANCELLED,
            json!({ "DATE": Self::today() }),
        )
        .await
    }

    async fn payment_issue(&self, to: &str, status: &str, grace_days: i64) -> BillingResult<()> {
        self.send_template(
            to,
            TEMPLATE_PAYMENT_ISSUE,
            json!({
                "STATUS": status,
                "GRACE_DAYS": grace_days,
                "DATE": Self::today(),
            }),
        )
        .await
    }
}
