//! Authoritative state resolver
//!
//! Best-effort callback into the payment processor for the current
//! subscription object and the most recent paid invoice. Transient failures
//! are swallowed: the caller proceeds with whatever state it already had.
//! A hard-deleted subscription is not transient; it is a terminal
//! cancellation.

use shopfront_shared::types::SubscriptionStatus;
use time::OffsetDateTime;

use crate::accounts::{Business, BillingUpdate};
use crate::gateway::{ProcessorGateway, SubscriptionLookup};

/// A populated refresh of the account's authoritative billing fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRefresh {
    pub status: Option<SubscriptionStatus>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub ended_at: Option<OffsetDateTime>,
    pub latest_paid_period_end: Option<OffsetDateTime>,
    pub price_id: Option<String>,
}

/// Outcome of a refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    Updated(SubscriptionRefresh),
    /// Subscription hard-deleted on the processor side
    Gone,
    /// Transient failure; prior state stands
    Unavailable,
}

/// Fetch authoritative subscription state for `sub_ref`.
///
/// Never errors: anything other than a definitive answer comes back as
/// [`Refresh::Unavailable`] so notification handling is never blocked on
/// processor health.
pub async fn refresh<G: ProcessorGateway>(gateway: &G, sub_ref: &str) -> Refresh {
    let lookup = match gateway.retrieve_subscription(sub_ref).await {
        Ok(lookup) => lookup,
        Err(e) => {
            tracing::warn!(
                subscription = %sub_ref,
                error = %e,
                "Subscription refresh unavailable, proceeding with stored state"
            );
            return Refresh::Unavailable;
        }
    };

    let snapshot = match lookup {
        SubscriptionLookup::Found(snapshot) => snapshot,
        SubscriptionLookup::Gone => {
            tracing::info!(
                subscription = %sub_ref,
                "Subscription no longer exists on processor, treating as terminal cancellation"
            );
            return Refresh::Gone;
        }
    };

    // The paid-invoice probe is best effort on top of a successful
    // subscription fetch; on failure the refresh still carries the
    // subscription fields and leaves the stored paid-period marker alone.
    let latest_paid_period_end = match gateway.latest_paid_period_end(sub_ref).await {
        Ok(period_end) => period_end,
        Err(e) => {
            tracing::warn!(
                subscription = %sub_ref,
                error = %e,
                "Paid invoice lookup unavailable, keeping stored paid period"
            );
            None
        }
    };

    Refresh::Updated(SubscriptionRefresh {
        status: snapshot.status.parse().ok(),
        current_period_end: snapshot.current_period_end,
        cancel_at_period_end: snapshot.cancel_at_period_end,
        ended_at: snapshot.ended_at,
        latest_paid_period_end,
        price_id: snapshot.price_id,
    })
}

impl Refresh {
    /// Fold the refresh into an account and a pending update.
    ///
    /// `Unavailable` touches nothing. `Gone` clears the live ref and marks
    /// the subscription terminally ended as of `now`. `Updated` overwrites
    /// the authoritative fields, advancing the paid-period marker only when
    /// the probe returned one.
    pub fn apply(
        &self,
        account: &mut Business,
        update: &mut BillingUpdate,
        now: OffsetDateTime,
        tier_for_price: impl Fn(&str) -> Option<shopfront_shared::types::Tier>,
    ) {
        match self {
            Refresh::Unavailable => {}
            Refresh::Gone => {
                update.stripe_subscription_id = Some(None);
                update.subscription_status = Some(Some(SubscriptionStatus::Canceled));
                update.subscription_ended_at = Some(Some(now));
                update.apply_to(account);
            }
            Refresh::Updated(refresh) => {
                update.subscription_status = Some(refresh.status);
                update.current_period_end = Some(refresh.current_period_end);
                update.cancel_at_period_end = Some(refresh.cancel_at_period_end);
                update.subscription_ended_at = Some(refresh.ended_at);
                if let Some(paid_through) = refresh.latest_paid_period_end {
                    update.latest_paid_period_end = Some(Some(paid_through));
                }
                if let Some(tier) = refresh
                    .price_id
                    .as_deref()
                    .and_then(|price| tier_for_price(price))
                {
                    update.plan_tier = Some(tier);
                }
                update.apply_to(account);
            }
        }
    }
}
