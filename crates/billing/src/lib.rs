// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shopfront Billing Module
//!
//! Subscription and entitlement reconciliation driven by Stripe webhooks.
//!
//! ## Features
//!
//! - **Webhooks**: Signature-verified, idempotent handling of subscription,
//!   invoice and checkout events
//! - **Access Policy**: Pure state-to-access mapping with a grace window for
//!   failing payments and paid-invoice precedence over lagging status
//! - **Resolver**: Best-effort refresh of authoritative subscription state
//!   from the processor on every notification
//! - **Entitlement Gate**: Read-only tier/payment-health check for protected
//!   endpoints
//! - **Checkout**: Hosted checkout session creation with account-binding
//!   metadata
//! - **Sweep**: Periodic re-resolution backstop for missed or reordered
//!   events
//! - **Email Notifications**: Activation, plan change, cancellation and
//!   payment issue templates via Brevo

pub mod accounts;
pub mod checkout;
pub mod client;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod policy;
pub mod reconcile;
pub mod resolver;
pub mod webhooks;

#[cfg(test)]
mod test_support;

// Accounts
pub use accounts::{BillingStore, BillingUpdate, Business, CommittedUpdate, PgBillingStore};

// Checkout
pub use checkout::{CheckoutRedirect, CheckoutService};

// Client
pub use client::StripeClient;

// Email
pub use email::{BrevoEmailService, NotificationDispatcher};

// Entitlement
pub use entitlement::{check, feature_enabled, DenyReason, EntitlementDecision};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventLogger};

// Gateway
pub use gateway::{ProcessorGateway, StripeGateway, SubscriptionLookup, SubscriptionSnapshot};

// Policy
pub use policy::{PolicyDecision, PolicyInput, GRACE_DAYS};

// Reconcile
pub use reconcile::{run_sweep, SweepReport};

// Resolver
pub use resolver::{Refresh, SubscriptionRefresh};

// Webhooks
pub use webhooks::{WebhookAck, WebhookEvent, WebhookHandler};

use shopfront_shared::config::AppConfig;
use sqlx::PgPool;

/// Webhook handler wired to the production implementations
pub type ProductionWebhookHandler =
    WebhookHandler<PgBillingStore, StripeGateway, BrevoEmailService>;

/// Main billing service combining the reconciliation engine's entry points
pub struct BillingService {
    pub webhooks: ProductionWebhookHandler,
    pub checkout: CheckoutService,
    pub store: PgBillingStore,
    pub gateway: StripeGateway,
}

impl BillingService {
    pub fn new(config: &AppConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config.stripe.clone());
        let store = PgBillingStore::new(pool.clone());
        let gateway = StripeGateway::new(stripe.clone());
        let dispatcher = BrevoEmailService::new(config.brevo.clone());
        let audit = BillingEventLogger::new(pool.clone());

        Self {
            webhooks: WebhookHandler::new(
                store.clone(),
                gateway.clone(),
                dispatcher,
                config.stripe.clone(),
                Some(audit),
            ),
            checkout: CheckoutService::new(stripe, pool, config.frontend_url.clone()),
            store,
            gateway,
        }
    }
}
