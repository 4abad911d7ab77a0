//! Outbound payment-processor gateway
//!
//! The reconciliation engine depends only on the shape of the subscription
//! and invoice data, not on the transport; this trait is that seam. The
//! production implementation wraps the Stripe API with a short timeout on
//! every call so a slow processor can never block notification
//! acknowledgment.

use async_trait::async_trait;
use shopfront_shared::clock;
use std::time::Duration;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Outbound call timeout. On expiry the caller sees a transient failure and
/// proceeds with the state it already has.
pub const PROCESSOR_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The authoritative subscription fields the engine consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub ended_at: Option<OffsetDateTime>,
    /// Price id of the first subscription item, for plan-tier mapping
    pub price_id: Option<String>,
}

/// Outcome of a subscription lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionLookup {
    Found(SubscriptionSnapshot),
    /// The processor no longer knows this subscription (hard-deleted)
    Gone,
}

#[async_trait]
pub trait ProcessorGateway: Send + Sync {
    /// Fetch the current subscription object by its external ref
    async fn retrieve_subscription(&self, sub_ref: &str) -> BillingResult<SubscriptionLookup>;

    /// Service-period end of the most recent *paid* invoice for the
    /// subscription, if any
    async fn latest_paid_period_end(
        &self,
        sub_ref: &str,
    ) -> BillingResult<Option<OffsetDateTime>>;
}

/// Stripe-backed gateway
#[derive(Clone)]
pub struct StripeGateway {
    client: StripeClient,
}

impl StripeGateway {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    fn is_missing_resource(err: &stripe::StripeError) -> bool {
        matches!(err, stripe::StripeError::Stripe(req) if req.http_status == 404)
    }
}

#[async_trait]
impl ProcessorGateway for StripeGateway {
    async fn retrieve_subscription(&self, sub_ref: &str) -> BillingResult<SubscriptionLookup> {
        let sub_id: stripe::SubscriptionId = sub_ref
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(sub_ref.to_string()))?;

        let result = tokio::time::timeout(
            PROCESSOR_CALL_TIMEOUT,
            stripe::Subscription::retrieve(self.client.inner(), &sub_id, &[]),
        )
        .await
        .map_err(|_| BillingError::Internal("subscription retrieve timed out".to_string()))?;

        match result {
            Ok(subscription) => {
                let price_id = subscription
                    .items
                    .data
                    .first()
                    .and_then(|item| item.price.as_ref())
                    .map(|price| price.id.to_string());

                Ok(SubscriptionLookup::Found(SubscriptionSnapshot {
                    status: subscription.status.to_string(),
                    current_period_end: clock::from_unix(subscription.current_period_end),
                    cancel_at_period_end: subscription.cancel_at_period_end,
                    ended_at: clock::from_unix_opt(subscription.ended_at),
                    price_id,
                }))
            }
            Err(e) if Self::is_missing_resource(&e) => Ok(SubscriptionLookup::Gone),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest_paid_period_end(
        &self,
        sub_ref: &str,
    ) -> BillingResult<Option<OffsetDateTime>> {
        let sub_id: stripe::SubscriptionId = sub_ref
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(sub_ref.to_string()))?;

        let mut params = stripe::ListInvoices::new();
        params.subscription = Some(sub_id);
        params.status = Some(stripe::InvoiceStatus::Paid);
        params.limit = Some(1);

        let invoices = tokio::time::timeout(
            PROCESSOR_CALL_TIMEOUT,
            stripe::Invoice::list(self.client.inner(), &params),
        )
        .await
        .map_err(|_| BillingError::Internal("invoice list timed out".to_string()))??;

        // Invoices list newest-first; the line-item period is the service
        // period actually paid for, with the invoice-level period as a
        // fallback.
        let period_end = invoices.data.first().and_then(|invoice| {
            invoice
                .lines
                .as_ref()
                .and_then(|lines| lines.data.first())
                .and_then(|line| line.period.as_ref())
                .and_then(|period| clock::from_unix_opt(period.end))
                .or_else(|| clock::from_unix_opt(invoice.period_end))
        });

        Ok(period_end)
    }
}
