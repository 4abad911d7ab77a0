//! Periodic re-resolution sweep
//!
//! Walks every account holding a live subscription ref, refreshes its
//! authoritative state from the processor and re-runs the access policy.
//! This is the corrective backstop for the accepted eventual-consistency
//! window: dropped webhooks, out-of-order application, grace windows that
//! lapsed between events. The sweep persists silently; webhook handling
//! owns customer-facing email.

use time::OffsetDateTime;

use crate::accounts::{BillingStore, BillingUpdate};
use crate::error::BillingResult;
use crate::gateway::ProcessorGateway;
use crate::policy::{self, PolicyInput};
use crate::resolver;

/// Counters for one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub updated: usize,
    pub tier_changes: usize,
    pub failed: usize,
}

/// Re-resolve every account with a live subscription.
///
/// Per-account failures are logged and counted, never fatal to the sweep.
pub async fn run_sweep<S, G>(
    store: &S,
    gateway: &G,
    tier_for_price: impl Fn(&str) -> Option<shopfront_shared::types::Tier>,
) -> BillingResult<SweepReport>
where
    S: BillingStore,
    G: ProcessorGateway,
{
    let accounts = store.list_with_live_subscription().await?;
    let mut report = SweepReport {
        scanned: accounts.len(),
        ..Default::default()
    };

    for mut account in accounts {
        let now = OffsetDateTime::now_utc();
        let old_tier = account.tier;
        let business_id = account.id;

        let sub_ref = match account.stripe_subscription_id.clone() {
            Some(sub_ref) => sub_ref,
            None => continue,
        };

        let mut update = BillingUpdate::default();
        let refresh = resolver::refresh(gateway, &sub_ref).await;
        refresh.apply(&mut account, &mut update, now, &tier_for_price);

        let decision = policy::evaluate(&PolicyInput::from_account(&account), now);
        update.tier = Some(decision.tier);
        update.grace_deadline = Some(decision.grace_deadline);

        match store.apply_billing_update(business_id, &update).await {
            Ok(()) => {
                report.updated += 1;
                if old_tier != decision.tier {
                    report.tier_changes += 1;
                    tracing::info!(
                        business_id = %business_id,
                        old_tier = %old_tier,
                        new_tier = %decision.tier,
                        "Sweep corrected access tier"
                    );
                }
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    business_id = %business_id,
                    error = %e,
                    "Sweep failed to persist account"
                );
            }
        }
    }

    tracing::info!(
        scanned = report.scanned,
        updated = report.updated,
        tier_changes = report.tier_changes,
        failed = report.failed,
        "Billing sweep complete"
    );

    Ok(report)
}
