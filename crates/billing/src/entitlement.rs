//! Entitlement gate
//!
//! Read-only precondition check consumed by every protected endpoint. Two
//! independent checks, both of which must pass: the static tier -> feature
//! table, then time-bound payment health for paid tiers. The two deny
//! reasons are distinct because the remedy differs: "upgrade required" means
//! change plan (403 class), "payment required" means fix payment (402
//! class). Pure read, no locking, safe for unbounded concurrent callers.

use serde::Serialize;
use shopfront_shared::clock;
use shopfront_shared::types::{Feature, SubscriptionStatus, Tier};
use time::OffsetDateTime;

use crate::accounts::Business;

/// Outcome of an entitlement check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EntitlementDecision {
    Allow,
    Deny { reason: DenyReason },
}

/// Why access was denied; the two variants map to different HTTP classes
/// and must never be collapsed into one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// The tier's feature table does not include this feature
    UpgradeRequired { feature: Feature, tier: Tier },
    /// The tier would allow it, but the subscription's payment state does not
    PaymentRequired {
        status: Option<SubscriptionStatus>,
    },
}

impl EntitlementDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EntitlementDecision::Allow)
    }
}

/// Static tier -> feature table. Anything not listed is denied.
pub fn feature_enabled(tier: Tier, feature: Feature) -> bool {
    match tier {
        Tier::Free => false,
        Tier::Foundation => matches!(feature, Feature::Customisation),
        Tier::Managed => matches!(
            feature,
            Feature::Customisation | Feature::ManageEnquiries | Feature::Bookings
        ),
        Tier::Autopilot => matches!(
            feature,
            Feature::Customisation
                | Feature::ManageEnquiries
                | Feature::Bookings
                | Feature::AiCalls
        ),
    }
}

/// Time-bound payment health, applied only above the lowest tier.
///
/// Passes when any of the following holds:
/// - the most recent paid invoice's service period covers `now`;
/// - the status is in good standing and the current period has not lapsed;
/// - the status is `past_due` and `now` is within the grace window.
pub fn payment_healthy(account: &Business, now: OffsetDateTime) -> bool {
    let now = clock::to_utc(now);

    if let Some(paid_through) = account.latest_paid_period_end.map(clock::to_utc) {
        if paid_through > now {
            return true;
        }
    }

    match account.subscription_status {
        Some(status) if status.is_good_standing() => account
            .current_period_end
            .map(clock::to_utc)
            .map(|end| now <= end)
            .unwrap_or(true),
        Some(SubscriptionStatus::PastDue) => account
            .grace_deadline
            .map(clock::to_utc)
            .map(|deadline| now <= deadline)
            .unwrap_or(false),
        _ => false,
    }
}

/// `(account, feature) -> allow / deny`. The decision every protected
/// endpoint consults before doing anything else.
pub fn check(account: &Business, feature: Feature, now: OffsetDateTime) -> EntitlementDecision {
    if !feature_enabled(account.tier, feature) {
        return EntitlementDecision::Deny {
            reason: DenyReason::UpgradeRequired {
                feature,
                tier: account.tier,
            },
        };
    }

    if account.tier.is_paid() && !payment_healthy(account, now) {
        return EntitlementDecision::Deny {
            reason: DenyReason::PaymentRequired {
                status: account.subscription_status,
            },
        };
    }

    EntitlementDecision::Allow
}
