//! Stripe webhook handling
//!
//! One handler per event category. Every recognized notification follows the
//! same path: verify signature, consult the idempotency ledger, refresh
//! authoritative state from the processor, run the access policy engine,
//! persist the result and the ledger record in one transaction, then fire
//! outbound email. Email failure never rolls anything back.
//!
//! Two notifications for the same account may race; the row lock inside the
//! store serializes them and each decision is re-derived from the row as
//! locked, so neither write is lost. A true out-of-order application (a canceled
//! event processed before a later paid event) can transiently show the
//! wrong tier until the next event or the periodic sweep corrects it; that
//! window is accepted and documented, not a bug.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shopfront_shared::config::StripeConfig;
use shopfront_shared::types::{SubscriptionStatus, Tier};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{BillingStore, BillingUpdate, Business};
use crate::email::NotificationDispatcher;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger};
use crate::gateway::ProcessorGateway;
use crate::policy::{self, PolicyInput};
use crate::resolver;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance, matching the processor's own SDK
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Acknowledgment body returned to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub handled: bool,
    pub duplicate: bool,
}

impl WebhookAck {
    fn new(handled: bool, duplicate: bool) -> Self {
        Self {
            status: "ok",
            handled,
            duplicate,
        }
    }
}

/// Verified notification envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Recognized event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    CheckoutCompleted,
    Unrecognized,
}

impl EventKind {
    fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.paid" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            _ => EventKind::Unrecognized,
        }
    }
}

// Payload shapes carry only the fields the engine consumes; everything else
// is ignored so processor API additions never break parsing.

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionPayload {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    ended_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct InvoicePayload {
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    customer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckoutSessionPayload {
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

/// What a reconciliation pass did, for ack, email and audit decisions
struct ReconcileOutcome {
    business_id: Uuid,
    old_tier: Tier,
    new_tier: Tier,
    grace_deadline: Option<OffsetDateTime>,
    duplicate: bool,
}

/// Webhook handler for processor events
pub struct WebhookHandler<S, G, N> {
    store: S,
    gateway: G,
    dispatcher: N,
    stripe_config: StripeConfig,
    audit: Option<BillingEventLogger>,
}

impl<S, G, N> WebhookHandler<S, G, N>
where
    S: BillingStore,
    G: ProcessorGateway,
    N: NotificationDispatcher,
{
    pub fn new(
        store: S,
        gateway: G,
        dispatcher: N,
        stripe_config: StripeConfig,
        audit: Option<BillingEventLogger>,
    ) -> Self {
        Self {
            store,
            gateway,
            dispatcher,
            stripe_config,
            audit,
        }
    }

    /// Verify the signature header against the raw payload and parse the
    /// envelope.
    ///
    /// The signature covers `"{t}.{payload}"` with the shared webhook
    /// secret; header format `t=timestamp,v1=signature`. Failure is fatal
    /// for this notification: nothing is recorded and the sender's retry
    /// fires.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let webhook_secret = &self.stripe_config.webhook_secret;
        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    /// Handle a verified event, returning the acknowledgment body.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookAck> {
        if self.store.has_processed(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, effects already applied"
            );
            return Ok(WebhookAck::new(true, true));
        }

        match EventKind::from_type(&event.event_type) {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_changed(&event).await
            }
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(&event).await,
            EventKind::InvoicePaid => self.handle_invoice_paid(&event).await,
            EventKind::InvoicePaymentFailed => self.handle_invoice_payment_failed(&event).await,
            EventKind::CheckoutCompleted => self.handle_checkout_completed(&event).await,
            EventKind::Unrecognized => {
                // Correctly signed but not ours to handle: cheap no-op, safe
                // to see again, so no ledger record either.
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Unrecognized webhook event type, acknowledging without effect"
                );
                Ok(WebhookAck::new(false, false))
            }
        }
    }

    async fn handle_subscription_changed(&self, event: &WebhookEvent) -> BillingResult<WebhookAck> {
        let payload: SubscriptionPayload = parse_object(event)?;

        let account = match self
            .locate(Some(&payload.id), payload.customer.as_deref())
            .await?
        {
            Some(account) => account,
            None => {
                tracing::warn!(
                    subscription = %payload.id,
                    event_id = %event.id,
                    "Subscription event for unknown account"
                );
                return Ok(WebhookAck::new(false, false));
            }
        };

        // The first subscription notification can precede the checkout
        // binding; persist the event's ref so the refresh runs against it.
        let mut seed = BillingUpdate::default();
        if account.stripe_subscription_id.is_none() {
            seed.stripe_subscription_id = Some(Some(payload.id.clone()));
        }

        let outcome = self.reconcile(account, &event.id, seed, true).await?;
        self.log_audit(&outcome, "billing.subscription_updated").await;
        Ok(WebhookAck::new(true, outcome.duplicate))
    }

    /// The primary path by which the paid-period marker advances.
    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<WebhookAck> {
        let payload: InvoicePayload = parse_object(event)?;

        let account = match self
            .locate(payload.subscription.as_deref(), payload.customer.as_deref())
            .await?
        {
            Some(account) => account,
            None => {
                tracing::warn!(event_id = %event.id, "Invoice paid for unknown account");
                return Ok(WebhookAck::new(false, false));
            }
        };

        // A first-ever payment can arrive before the subscription-updated
        // notification binds the ref; take it from the invoice itself.
        let mut seed = BillingUpdate::default();
        if account.stripe_subscription_id.is_none() {
            if let Some(sub_ref) = payload.subscription.clone() {
                seed.stripe_subscription_id = Some(Some(sub_ref));
            }
        }

        let outcome = self.reconcile(account, &event.id, seed, true).await?;
        self.log_audit(&outcome, "billing.invoice_paid").await;
        Ok(WebhookAck::new(true, outcome.duplicate))
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookAck> {
        let payload: InvoicePayload = parse_object(event)?;

        let account = match self
            .locate(payload.subscription.as_deref(), payload.customer.as_deref())
            .await?
        {
            Some(account) => account,
            None => {
                tracing::warn!(event_id = %event.id, "Payment failure for unknown account");
                return Ok(WebhookAck::new(false, false));
            }
        };

        let email = account.email.clone();

        // Seed past_due from the event itself so the grace branch engages
        // even when the authoritative refresh is unavailable; a successful
        // refresh overwrites it.
        let mut seed = BillingUpdate {
            subscription_status: Some(Some(SubscriptionStatus::PastDue)),
            ..Default::default()
        };
        if account.stripe_subscription_id.is_none() {
            if let Some(sub_ref) = payload.subscription.clone() {
                seed.stripe_subscription_id = Some(Some(sub_ref));
            }
        }

        let outcome = self.reconcile(account, &event.id, seed, true).await?;
        self.log_audit(&outcome, "billing.payment_failed").await;

        // Payment-issue email while the grace window keeps access alive; a
        // downgrade is covered by the tier-change email inside reconcile.
        if !outcome.duplicate && outcome.new_tier.is_paid() {
            if let Some(deadline) = outcome.grace_deadline {
                let days_remaining = (deadline - OffsetDateTime::now_utc()).whole_days().max(1);
                if let Err(e) = self
                    .dispatcher
                    .payment_issue(&email, SubscriptionStatus::PastDue.as_str(), days_remaining)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send payment issue email");
                }
            }
        }

        Ok(WebhookAck::new(true, outcome.duplicate))
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookAck> {
        let payload: SubscriptionPayload = parse_object(event)?;

        let account = match self.store.find_by_subscription_ref(&payload.id).await? {
            Some(account) => account,
            None => {
                tracing::warn!(
                    subscription = %payload.id,
                    event_id = %event.id,
                    "Subscription deleted for unknown account"
                );
                return Ok(WebhookAck::new(false, false));
            }
        };

        let ended_at = shopfront_shared::clock::from_unix_opt(payload.ended_at)
            .unwrap_or_else(OffsetDateTime::now_utc);

        // Terminal: clear the live ref and pin the end instant. Policy still
        // honors a paid period that covers a future instant.
        let seed = BillingUpdate {
            stripe_subscription_id: Some(None),
            subscription_status: Some(Some(SubscriptionStatus::Canceled)),
            subscription_ended_at: Some(Some(ended_at)),
            ..Default::default()
        };

        let outcome = self.reconcile(account, &event.id, seed, false).await?;
        self.log_audit(&outcome, "billing.subscription_cancelled").await;
        Ok(WebhookAck::new(true, outcome.duplicate))
    }

    /// Bind processor refs onto the account named by the session metadata.
    ///
    /// Policy evaluation is deliberately deferred: the subscription is not
    /// guaranteed to exist server-side at this instant, and the following
    /// subscription-updated / invoice-paid notification is the
    /// authoritative trigger.
    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<WebhookAck> {
        let payload: CheckoutSessionPayload = parse_object(event)?;

        let metadata = payload.metadata.unwrap_or_default();
        let business_id = match metadata
            .get("business_id")
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            Some(id) => id,
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    "Checkout completion without usable business_id metadata, skipping"
                );
                return Ok(WebhookAck::new(false, false));
            }
        };

        let account = match self.store.find_by_id(business_id).await? {
            Some(account) => account,
            None => {
                tracing::warn!(
                    business_id = %business_id,
                    event_id = %event.id,
                    "Checkout completion for unknown account"
                );
                return Ok(WebhookAck::new(false, false));
            }
        };

        let plan_tier = metadata.get("tier").and_then(|t| t.parse::<Tier>().ok());

        let update = BillingUpdate {
            stripe_customer_id: payload.customer.clone(),
            stripe_subscription_id: payload.subscription.clone().map(Some),
            plan_tier,
            ..Default::default()
        };

        let duplicate = match self
            .store
            .commit_billing_update(account.id, &update, &event.id)
            .await
        {
            Ok(()) => false,
            Err(BillingError::EventAlreadyProcessed(_)) => true,
            Err(e) => return Err(e),
        };

        if !duplicate {
            if let Some(audit) = &self.audit {
                audit
                    .log(
                        account.id,
                        ActorType::System,
                        "billing.checkout_completed",
                        plan_tier.map(|t| format!("tier={t}")).as_deref(),
                    )
                    .await;
            }
        }

        tracing::info!(
            business_id = %account.id,
            event_id = %event.id,
            "Checkout completed, processor refs bound"
        );

        Ok(WebhookAck::new(true, duplicate))
    }

    /// Locate the account for an event: live subscription ref first, then
    /// customer ref (covers the first-ever payment arriving before the
    /// subscription-updated notification).
    async fn locate(
        &self,
        sub_ref: Option<&str>,
        customer_ref: Option<&str>,
    ) -> BillingResult<Option<Business>> {
        if let Some(sub_ref) = sub_ref {
            if let Some(account) = self.store.find_by_subscription_ref(sub_ref).await? {
                return Ok(Some(account));
            }
        }
        if let Some(customer_ref) = customer_ref {
            if let Some(account) = self.store.find_by_customer_ref(customer_ref).await? {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    /// Shared tail of every account-mutating handler: fold event-local
    /// facts and the authoritative refresh into one update, derive the
    /// policy decision from the row as locked at commit time, persist with
    /// the ledger record, then email on an actual tier change.
    async fn reconcile(
        &self,
        account: Business,
        event_id: &str,
        seed: BillingUpdate,
        refresh_from_processor: bool,
    ) -> BillingResult<ReconcileOutcome> {
        let now = OffsetDateTime::now_utc();
        let email = account.email.clone();

        // The processor round-trip stays outside the transaction; its
        // result folds into the update applied under the row lock.
        let mut base = seed;
        if refresh_from_processor {
            let mut preview = account.clone();
            base.apply_to(&mut preview);
            if let Some(sub_ref) = preview.stripe_subscription_id.clone() {
                let refresh = resolver::refresh(&self.gateway, &sub_ref).await;
                refresh.apply(&mut preview, &mut base, now, |price| {
                    self.stripe_config.tier_for_price(price)
                });
            }
        }

        let committed = match self
            .store
            .commit_reconciliation(account.id, event_id, &|current: &Business| {
                let mut projected = current.clone();
                let mut update = base.clone();
                update.apply_to(&mut projected);
                let decision = policy::evaluate(&PolicyInput::from_account(&projected), now);
                update.tier = Some(decision.tier);
                update.grace_deadline = Some(decision.grace_deadline);
                update
            })
            .await
        {
            Ok(committed) => committed,
            // Lost the race with a concurrent delivery of the same event;
            // its effects are already applied.
            Err(BillingError::EventAlreadyProcessed(_)) => {
                return Ok(ReconcileOutcome {
                    business_id: account.id,
                    old_tier: account.tier,
                    new_tier: account.tier,
                    grace_deadline: account.grace_deadline,
                    duplicate: true,
                });
            }
            Err(e) => return Err(e),
        };

        let old_tier = committed.before.tier;
        let new_tier = committed.after.tier;
        if old_tier != new_tier {
            self.notify_tier_change(&email, old_tier, new_tier).await;
        }

        Ok(ReconcileOutcome {
            business_id: account.id,
            old_tier,
            new_tier,
            grace_deadline: committed.after.grace_deadline,
            duplicate: false,
        })
    }

    async fn notify_tier_change(&self, email: &str, old_tier: Tier, new_tier: Tier) {
        let result = if old_tier == Tier::Free {
            self.dispatcher.subscription_activated(email, new_tier).await
        } else if new_tier == Tier::Free {
            self.dispatcher.subscription_cancelled(email).await
        } else {
            self.dispatcher.plan_changed(email, old_tier, new_tier).await
        };

        if let Err(e) = result {
            tracing::warn!(
                old_tier = %old_tier,
                new_tier = %new_tier,
                error = %e,
                "Failed to send tier change email"
            );
        }
    }

    async fn log_audit(&self, outcome: &ReconcileOutcome, action: &str) {
        if outcome.duplicate {
            return;
        }
        if let Some(audit) = &self.audit {
            let details = format!("{}->{}", outcome.old_tier, outcome.new_tier);
            audit
                .log(outcome.business_id, ActorType::System, action, Some(&details))
                .await;
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone())
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SubscriptionSnapshot;
    use crate::test_support::{
        managed_account, GatewayScript, MockGateway, MemoryStore, RecordingDispatcher, SentEmail,
        stripe_test_config,
    };
    use time::Duration;

    fn handler(
        store: MemoryStore,
        gateway: MockGateway,
        dispatcher: RecordingDispatcher,
    ) -> WebhookHandler<MemoryStore, MockGateway, RecordingDispatcher> {
        WebhookHandler::new(store, gateway, dispatcher, stripe_test_config(), None)
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            data: WebhookEventData { object },
        }
    }

    fn active_snapshot(price_id: &str) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            status: "active".to_string(),
            current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(30)),
            cancel_at_period_end: false,
            ended_at: None,
            price_id: Some(price_id.to_string()),
        }
    }

    // ---- signature verification -------------------------------------------

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.paid","data":{"object":{}}}"#;

    #[test]
    fn valid_signature_parses_the_envelope() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, "whsec_testsecret", now);
        let parsed = h.verify_event_at(PAYLOAD, &header, now).unwrap();
        assert_eq!(parsed.id, "evt_1");
        assert_eq!(parsed.event_type, "invoice.paid");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, "whsec_testsecret", now);
        let tampered = PAYLOAD.replace("invoice.paid", "invoice.voided");
        assert!(matches!(
            h.verify_event_at(&tampered, &header, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, "whsec_othersecret", now);
        assert!(h.verify_event_at(PAYLOAD, &header, now).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, "whsec_testsecret", now - 600);
        assert!(h.verify_event_at(PAYLOAD, &header, now).is_err());
    }

    #[test]
    fn missing_header_parts_are_rejected() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        assert!(h.verify_event_at(PAYLOAD, "v1=abc", 1_750_000_000).is_err());
        assert!(h.verify_event_at(PAYLOAD, "t=1750000000", 1_750_000_000).is_err());
        assert!(h.verify_event_at(PAYLOAD, "", 1_750_000_000).is_err());
    }

    // ---- event handling ---------------------------------------------------

    #[tokio::test]
    async fn invoice_paid_activates_account_and_emails_once() {
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        let id = account.id;
        store.insert(account).await;

        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_managed"),
            Some(OffsetDateTime::now_utc() + Duration::days(30)),
        ));
        let dispatcher = RecordingDispatcher::default();
        let h = handler(store, gateway, dispatcher);

        let ack = h
            .handle_event(event(
                "evt_paid_1",
                "invoice.paid",
                serde_json::json!({"subscription": "sub_1", "customer": "cus_1"}),
            ))
            .await
            .unwrap();

        assert!(ack.handled);
        assert!(!ack.duplicate);

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.tier, Tier::Managed);
        assert!(account.latest_paid_period_end.is_some());
        assert_eq!(
            h.dispatcher.sent().await,
            vec![SentEmail::Activated {
                to: "owner@acme.test".into(),
                tier: Tier::Managed
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_event_mutates_once_and_reports_duplicate() {
        // Scenario D: replaying the identical invoice.paid event id.
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        let id = account.id;
        store.insert(account).await;

        let paid_through = OffsetDateTime::now_utc() + Duration::days(30);
        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_managed"),
            Some(paid_through),
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        let evt = event(
            "evt_dup",
            "invoice.paid",
            serde_json::json!({"subscription": "sub_1"}),
        );

        let first = h.handle_event(evt.clone()).await.unwrap();
        assert!(first.handled && !first.duplicate);

        let second = h.handle_event(evt).await.unwrap();
        assert!(second.handled);
        assert!(second.duplicate);

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.tier, Tier::Managed);
        // Exactly one email across both deliveries.
        assert_eq!(h.dispatcher.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn reprocessing_same_state_sends_no_second_email() {
        // Two distinct event ids carrying the same authoritative state: the
        // second pass sees no tier change and must stay silent.
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        store.insert(account).await;

        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_managed"),
            Some(OffsetDateTime::now_utc() + Duration::days(30)),
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        for event_id in ["evt_a", "evt_b"] {
            h.handle_event(event(
                event_id,
                "customer.subscription.updated",
                serde_json::json!({"id": "sub_1", "customer": "cus_1"}),
            ))
            .await
            .unwrap();
        }

        assert_eq!(h.dispatcher.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_opens_grace_and_keeps_deadline_fixed() {
        // Scenario B plus grace monotonicity across a second failure event.
        let store = MemoryStore::default();
        let account = managed_account();
        let id = account.id;
        store.insert(account).await;

        // Refresh unavailable: the event itself must still drive the grace
        // branch.
        let gateway = MockGateway::scripted(GatewayScript::Fail);
        let h = handler(store, gateway, RecordingDispatcher::default());

        h.handle_event(event(
            "evt_fail_1",
            "invoice.payment_failed",
            serde_json::json!({"subscription": "sub_1", "customer": "cus_1"}),
        ))
        .await
        .unwrap();

        let after_first = h.store.get(id).await.unwrap();
        assert_eq!(after_first.tier, Tier::Managed);
        let deadline = after_first.grace_deadline.unwrap();

        h.handle_event(event(
            "evt_fail_2",
            "invoice.payment_failed",
            serde_json::json!({"subscription": "sub_1", "customer": "cus_1"}),
        ))
        .await
        .unwrap();

        let after_second = h.store.get(id).await.unwrap();
        assert_eq!(after_second.grace_deadline, Some(deadline));

        // Both failure events email a payment issue; no tier change emails.
        let sent = h.dispatcher.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|e| matches!(e, SentEmail::PaymentIssue { .. })));
    }

    #[tokio::test]
    async fn subscription_deleted_downgrades_unless_paid_through_future() {
        let store = MemoryStore::default();
        let mut covered = managed_account();
        covered.latest_paid_period_end = Some(OffsetDateTime::now_utc() + Duration::days(2));
        let covered_id = covered.id;
        store.insert(covered).await;

        let h = handler(
            store,
            MockGateway::scripted(GatewayScript::Fail),
            RecordingDispatcher::default(),
        );

        h.handle_event(event(
            "evt_del_1",
            "customer.subscription.deleted",
            serde_json::json!({"id": "sub_1", "ended_at": 1_750_000_000}),
        ))
        .await
        .unwrap();

        // Invoice precedence: still paid through a future instant.
        let account = h.store.get(covered_id).await.unwrap();
        assert_eq!(account.tier, Tier::Managed);
        assert_eq!(account.stripe_subscription_id, None);
        assert!(account.subscription_ended_at.is_some());
        assert!(h.dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn subscription_deleted_without_coverage_emails_cancellation() {
        let store = MemoryStore::default();
        let account = managed_account();
        let id = account.id;
        store.insert(account).await;

        let h = handler(
            store,
            MockGateway::scripted(GatewayScript::Fail),
            RecordingDispatcher::default(),
        );

        h.handle_event(event(
            "evt_del_2",
            "customer.subscription.deleted",
            serde_json::json!({"id": "sub_1"}),
        ))
        .await
        .unwrap();

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.tier, Tier::Free);
        assert!(account.is_active, "downgrade is not suspension");
        assert_eq!(
            h.dispatcher.sent().await,
            vec![SentEmail::Cancelled {
                to: "owner@acme.test".into()
            }]
        );
    }

    #[tokio::test]
    async fn gone_subscription_is_terminal_cancellation() {
        let store = MemoryStore::default();
        let account = managed_account();
        let id = account.id;
        store.insert(account).await;

        let h = handler(
            store,
            MockGateway::scripted(GatewayScript::Gone),
            RecordingDispatcher::default(),
        );

        h.handle_event(event(
            "evt_gone",
            "customer.subscription.updated",
            serde_json::json!({"id": "sub_1"}),
        ))
        .await
        .unwrap();

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.tier, Tier::Free);
        assert_eq!(account.stripe_subscription_id, None);
        assert_eq!(account.subscription_status, Some(SubscriptionStatus::Canceled));
        assert!(account.subscription_ended_at.is_some());
    }

    #[tokio::test]
    async fn transient_resolver_failure_leaves_state_untouched() {
        let store = MemoryStore::default();
        let account = managed_account();
        let id = account.id;
        let before = account.clone();
        store.insert(account).await;

        let h = handler(
            store,
            MockGateway::scripted(GatewayScript::Fail),
            RecordingDispatcher::default(),
        );

        let ack = h
            .handle_event(event(
                "evt_transient",
                "customer.subscription.updated",
                serde_json::json!({"id": "sub_1"}),
            ))
            .await
            .unwrap();
        assert!(ack.handled);

        let account = h.store.get(id).await.unwrap();
        // Policy re-ran over unchanged inputs: same tier, same status.
        assert_eq!(account.tier, before.tier);
        assert_eq!(account.subscription_status, before.subscription_status);
        assert!(h.dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_event_acks_without_ledger_record() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );

        let evt = event("evt_other", "charge.refunded", serde_json::json!({}));
        let ack = h.handle_event(evt.clone()).await.unwrap();
        assert!(!ack.handled);
        assert!(!ack.duplicate);

        // Seeing it again is still not a duplicate: nothing was recorded.
        let again = h.handle_event(evt).await.unwrap();
        assert!(!again.duplicate);
    }

    #[tokio::test]
    async fn unknown_account_acks_without_effect() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let ack = h
            .handle_event(event(
                "evt_unknown",
                "invoice.paid",
                serde_json::json!({"subscription": "sub_missing"}),
            ))
            .await
            .unwrap();
        assert!(!ack.handled);
    }

    #[tokio::test]
    async fn checkout_completion_binds_refs_without_policy_run() {
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        account.plan_tier = None;
        account.stripe_customer_id = None;
        account.stripe_subscription_id = None;
        account.subscription_status = None;
        let id = account.id;
        store.insert(account).await;

        let h = handler(store, MockGateway::default(), RecordingDispatcher::default());

        let ack = h
            .handle_event(event(
                "evt_checkout",
                "checkout.session.completed",
                serde_json::json!({
                    "customer": "cus_new",
                    "subscription": "sub_new",
                    "metadata": {"business_id": id.to_string(), "tier": "managed"},
                }),
            ))
            .await
            .unwrap();
        assert!(ack.handled);

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.stripe_customer_id.as_deref(), Some("cus_new"));
        assert_eq!(account.stripe_subscription_id.as_deref(), Some("sub_new"));
        assert_eq!(account.plan_tier, Some(Tier::Managed));
        // Deferred: tier untouched and no activation email until the next
        // authoritative event.
        assert_eq!(account.tier, Tier::Free);
        assert!(h.dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn checkout_without_metadata_is_logged_and_skipped() {
        let h = handler(
            MemoryStore::default(),
            MockGateway::default(),
            RecordingDispatcher::default(),
        );
        let ack = h
            .handle_event(event(
                "evt_checkout_bad",
                "checkout.session.completed",
                serde_json::json!({"customer": "cus_x"}),
            ))
            .await
            .unwrap();
        assert!(!ack.handled);
        assert!(!ack.duplicate);
    }

    #[tokio::test]
    async fn status_lag_does_not_revoke_paid_access() {
        // Invoice precedence end to end: the processor still says past_due
        // but the paid invoice covers the next month.
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.subscription_status = Some(SubscriptionStatus::PastDue);
        account.grace_deadline = Some(OffsetDateTime::now_utc() + Duration::days(3));
        let id = account.id;
        store.insert(account).await;

        let snapshot = SubscriptionSnapshot {
            status: "past_due".to_string(),
            current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(30)),
            cancel_at_period_end: false,
            ended_at: None,
            price_id: Some("price_managed".to_string()),
        };
        let gateway = MockGateway::scripted(GatewayScript::Found(
            snapshot,
            Some(OffsetDateTime::now_utc() + Duration::days(30)),
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        h.handle_event(event(
            "evt_lag",
            "invoice.paid",
            serde_json::json!({"subscription": "sub_1"}),
        ))
        .await
        .unwrap();

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.tier, Tier::Managed);
        // Status still failing, so the deadline is retained.
        assert!(account.grace_deadline.is_some());
    }

    #[tokio::test]
    async fn plan_change_between_paid_tiers_emails_plan_changed() {
        let store = MemoryStore::default();
        let account = managed_account();
        store.insert(account).await;

        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_autopilot"),
            Some(OffsetDateTime::now_utc() + Duration::days(30)),
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        h.handle_event(event(
            "evt_upgrade",
            "customer.subscription.updated",
            serde_json::json!({"id": "sub_1"}),
        ))
        .await
        .unwrap();

        assert_eq!(
            h.dispatcher.sent().await,
            vec![SentEmail::PlanChanged {
                to: "owner@acme.test".into(),
                old_tier: Tier::Managed,
                new_tier: Tier::Autopilot
            }]
        );
    }

    #[tokio::test]
    async fn invoice_paid_located_by_customer_ref_binds_subscription_ref() {
        // First-ever payment arriving before the subscription-updated
        // notification: only the customer ref is bound, and the invoice's
        // subscription ref must be persisted so the refresh runs against it.
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        account.plan_tier = None;
        account.stripe_subscription_id = None;
        account.subscription_status = None;
        account.current_period_end = None;
        let id = account.id;
        store.insert(account).await;

        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_managed"),
            Some(OffsetDateTime::now_utc() + Duration::days(30)),
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        let ack = h
            .handle_event(event(
                "evt_first_payment",
                "invoice.paid",
                serde_json::json!({"subscription": "sub_new", "customer": "cus_1"}),
            ))
            .await
            .unwrap();
        assert!(ack.handled);

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.stripe_subscription_id.as_deref(), Some("sub_new"));
        assert_eq!(account.tier, Tier::Managed);
        assert!(account.latest_paid_period_end.is_some());
        assert_eq!(
            h.dispatcher.sent().await,
            vec![SentEmail::Activated {
                to: "owner@acme.test".into(),
                tier: Tier::Managed
            }]
        );
    }

    #[tokio::test]
    async fn subscription_update_located_by_customer_ref_binds_event_ref() {
        let store = MemoryStore::default();
        let mut account = managed_account();
        account.tier = Tier::Free;
        account.stripe_subscription_id = None;
        account.subscription_status = None;
        let id = account.id;
        store.insert(account).await;

        let gateway = MockGateway::scripted(GatewayScript::Found(
            active_snapshot("price_managed"),
            None,
        ));
        let h = handler(store, gateway, RecordingDispatcher::default());

        h.handle_event(event(
            "evt_sub_first",
            "customer.subscription.updated",
            serde_json::json!({"id": "sub_new", "customer": "cus_1"}),
        ))
        .await
        .unwrap();

        let account = h.store.get(id).await.unwrap();
        assert_eq!(account.stripe_subscription_id.as_deref(), Some("sub_new"));
        assert_eq!(account.tier, Tier::Managed);
    }

    #[tokio::test]
    async fn concurrent_payment_failures_do_not_re_extend_grace() {
        // Two first-time payment failures delivered concurrently: both read
        // the account before either commits. The decision runs against the
        // row as locked at commit time, so the second delivery must keep the
        // deadline the first one pinned rather than re-deriving its own.
        let store = MemoryStore::default();
        let account = managed_account();
        let id = account.id;
        store.insert(account).await;

        let decide_at = |now: OffsetDateTime| {
            move |current: &Business| {
                let mut update = BillingUpdate {
                    subscription_status: Some(Some(SubscriptionStatus::PastDue)),
                    ..Default::default()
                };
                let mut projected = current.clone();
                update.apply_to(&mut projected);
                let decision = policy::evaluate(&PolicyInput::from_account(&projected), now);
                update.tier = Some(decision.tier);
                update.grace_deadline = Some(decision.grace_deadline);
                update
            }
        };

        let now = OffsetDateTime::now_utc();
        let first = store
            .commit_reconciliation(id, "evt_race_1", &decide_at(now))
            .await
            .unwrap();
        let deadline = first.after.grace_deadline.unwrap();

        let second = store
            .commit_reconciliation(id, "evt_race_2", &decide_at(now + Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(second.after.grace_deadline, Some(deadline));
        assert_eq!(second.after.tier, Tier::Managed);
    }
}
