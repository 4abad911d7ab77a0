//! Hosted checkout session creation
//!
//! Starts a subscription purchase by handing the customer to the
//! processor's hosted payment page. The session metadata carries the
//! business id and the requested tier so the completion webhook can bind
//! the resulting refs back to the right account.

use std::collections::HashMap;

use sqlx::PgPool;
use stripe::{CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCustomer, Customer, CustomerId};

use crate::accounts::Business;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// What the caller gets back: where to send the browser
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutRedirect {
    pub session_id: String,
    pub url: String,
}

/// Creates checkout sessions and the customers behind them
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    frontend_url: String,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, frontend_url: String) -> Self {
        Self {
            stripe,
            pool,
            frontend_url,
        }
    }

    /// Create a subscription-mode checkout session for `tier`.
    ///
    /// `Free` is not purchasable. An existing customer ref is reused; a
    /// fresh one is created and persisted before the session so a retried
    /// checkout never mints a second customer.
    pub async fn create_session(
        &self,
        business: &Business,
        tier: shopfront_shared::types::Tier,
    ) -> BillingResult<CheckoutRedirect> {
        let price_id = self
            .stripe
            .config()
            .price_for_tier(tier)
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?
            .to_string();

        let customer_id = self.get_or_create_customer(business).await?;

        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.frontend_url
        );
        let cancel_url = format!("{}/billing/cancelled", self.frontend_url);

        let mut metadata = HashMap::new();
        metadata.insert("business_id".to_string(), business.id.to_string());
        metadata.insert("tier".to_string(), tier.to_string());

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Internal("checkout session has no url".to_string()))?;

        tracing::info!(
            business_id = %business.id,
            tier = %tier,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutRedirect {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn get_or_create_customer(&self, business: &Business) -> BillingResult<CustomerId> {
        if let Some(ref existing) = business.stripe_customer_id {
            return existing
                .parse()
                .map_err(|_| BillingError::Internal(format!("bad customer ref: {existing}")));
        }

        let mut metadata = HashMap::new();
        metadata.insert("business_id".to_string(), business.id.to_string());

        let params = CreateCustomer {
            email: Some(&business.email),
            name: Some(&business.name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        sqlx::query(
            "UPDATE businesses SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer.id.as_str())
        .bind(business.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            business_id = %business.id,
            customer_id = %customer.id,
            "Created processor customer"
        );

        Ok(customer.id)
    }
}
