//! Access policy engine
//!
//! The single state machine through which every billing-driven tier
//! transition funnels. `evaluate` is a pure function over the account's
//! last-known billing fields and `now`; it is idempotent, so re-applying the
//! same authoritative state any number of times converges on the same
//! decision. Request handlers never mutate `tier` or `active` directly.
//!
//! Precedence, in order:
//! 1. A paid invoice whose service period covers `now` grants access no
//!    matter what the status string says (a lagging status webhook must not
//!    revoke access the customer already paid for).
//! 2. `active`/`trialing` status grants access and clears any grace window.
//! 3. `past_due` opens a grace window of [`GRACE_DAYS`] on first observation
//!    and never re-extends it on repeat notifications.
//! 4. Anything else downgrades to the free tier. `active` is untouched:
//!    administrative suspension is a separate action this engine never takes.

use shopfront_shared::clock;
use shopfront_shared::types::{SubscriptionStatus, Tier};
use time::{Duration, OffsetDateTime};

use crate::accounts::Business;

/// Grace window opened on the first `past_due` observation
pub const GRACE_DAYS: i64 = 7;

/// Normalized inputs to the policy engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInput {
    /// The paid tier this account would hold while entitled; `Free` when the
    /// account never bought a plan.
    pub paid_tier: Tier,
    /// Administrative active flag, passed through unchanged
    pub active: bool,
    pub status: Option<SubscriptionStatus>,
    pub current_period_end: Option<OffsetDateTime>,
    pub latest_paid_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub subscription_ended_at: Option<OffsetDateTime>,
    pub grace_deadline: Option<OffsetDateTime>,
}

impl PolicyInput {
    pub fn from_account(account: &Business) -> Self {
        Self {
            paid_tier: account.plan_tier.unwrap_or(Tier::Free),
            active: account.is_active,
            status: account.subscription_status,
            current_period_end: account.current_period_end,
            latest_paid_period_end: account.latest_paid_period_end,
            cancel_at_period_end: account.cancel_at_period_end,
            subscription_ended_at: account.subscription_ended_at,
            grace_deadline: account.grace_deadline,
        }
    }

    /// Canonicalize every instant to UTC once, here, so no branch below
    /// compares differently-zoned values.
    fn normalized(&self) -> Self {
        Self {
            current_period_end: self.current_period_end.map(clock::to_utc),
            latest_paid_period_end: self.latest_paid_period_end.map(clock::to_utc),
            subscription_ended_at: self.subscription_ended_at.map(clock::to_utc),
            grace_deadline: self.grace_deadline.map(clock::to_utc),
            ..self.clone()
        }
    }
}

/// Output of the policy engine: the fields it alone is allowed to decide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub tier: Tier,
    pub active: bool,
    pub grace_deadline: Option<OffsetDateTime>,
}

/// Derive `(tier, active, grace_deadline)` from the account's billing state.
pub fn evaluate(input: &PolicyInput, now: OffsetDateTime) -> PolicyDecision {
    let input = input.normalized();
    let now = clock::to_utc(now);

    let good_standing = input
        .status
        .map(|s| s.is_good_standing())
        .unwrap_or(false)
        && input.subscription_ended_at.is_none();

    // Step 1: invoice-driven access overrides status drift in the account's
    // favor. The grace window is cleared only once the status has recovered;
    // a still-failing subscription keeps its deadline for observability.
    if let Some(paid_through) = input.latest_paid_period_end {
        if paid_through > now {
            return PolicyDecision {
                tier: input.paid_tier,
                active: input.active,
                grace_deadline: if good_standing {
                    None
                } else {
                    input.grace_deadline
                },
            };
        }
    }

    // Step 2: healthy subscription
    if good_standing {
        return PolicyDecision {
            tier: input.paid_tier,
            active: input.active,
            grace_deadline: None,
        };
    }

    // Step 3: payment failure grace window. The deadline is pinned at the
    // first past_due observation and never moved by repeat notifications.
    if input.status == Some(SubscriptionStatus::PastDue)
        && input.subscription_ended_at.is_none()
    {
        let deadline = input
            .grace_deadline
            .unwrap_or_else(|| now + Duration::days(GRACE_DAYS));
        if now <= deadline {
            return PolicyDecision {
                tier: input.paid_tier,
                active: input.active,
                grace_deadline: Some(deadline),
            };
        }
        // Grace expired: fall through, retaining the deadline.
        return PolicyDecision {
            tier: Tier::Free,
            active: input.active,
            grace_deadline: Some(deadline),
        };
    }

    // Step 4: canceled, incomplete, ended, or no subscription at all. The
    // account becomes a usable free account; only an administrative action
    // flips `active`.
    PolicyDecision {
        tier: Tier::Free,
        active: input.active,
        grace_deadline: input.grace_deadline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn base_input() -> PolicyInput {
        PolicyInput {
            paid_tier: Tier::Managed,
            active: true,
            status: Some(SubscriptionStatus::Active),
            current_period_end: Some(datetime!(2025-07-01 00:00:00 UTC)),
            latest_paid_period_end: None,
            cancel_at_period_end: false,
            subscription_ended_at: None,
            grace_deadline: None,
        }
    }

    const NOW: OffsetDateTime = datetime!(2025-06-01 12:00:00 UTC);

    #[test]
    fn active_status_grants_paid_tier() {
        let decision = evaluate(&base_input(), NOW);
        assert_eq!(decision.tier, Tier::Managed);
        assert!(decision.active);
        assert_eq!(decision.grace_deadline, None);
    }

    #[test]
    fn trialing_counts_as_good_standing() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Trialing);
        assert_eq!(evaluate(&input, NOW).tier, Tier::Managed);
    }

    #[test]
    fn canceled_without_paid_period_downgrades() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Canceled);
        let decision = evaluate(&input, NOW);
        assert_eq!(decision.tier, Tier::Free);
        // Downgrade is not suspension.
        assert!(decision.active);
    }

    #[test]
    fn paid_invoice_overrides_canceled_status() {
        // Spec scenario: canceled status but the paid service period still
        // covers now -> access stays until that instant passes.
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Canceled);
        input.subscription_ended_at = Some(NOW - Duration::hours(1));
        input.latest_paid_period_end = Some(NOW + Duration::days(2));
        assert_eq!(evaluate(&input, NOW).tier, Tier::Managed);

        // And expires once the period lapses.
        let later = NOW + Duration::days(2) + Duration::seconds(1);
        assert_eq!(evaluate(&input, later).tier, Tier::Free);
    }

    #[test]
    fn paid_invoice_ten_minutes_in_future_keeps_access() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Canceled);
        input.latest_paid_period_end = Some(NOW + Duration::minutes(10));
        assert_eq!(evaluate(&input, NOW).tier, Tier::Managed);
    }

    #[test]
    fn past_due_opens_grace_window_once() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::PastDue);

        let first = evaluate(&input, NOW);
        assert_eq!(first.tier, Tier::Managed);
        assert_eq!(first.grace_deadline, Some(NOW + Duration::days(GRACE_DAYS)));

        // A second past_due notification a day later must not move the
        // deadline.
        input.grace_deadline = first.grace_deadline;
        let second = evaluate(&input, NOW + Duration::days(1));
        assert_eq!(second.grace_deadline, first.grace_deadline);
        assert_eq!(second.tier, Tier::Managed);
    }

    #[test]
    fn grace_boundary_is_inclusive_then_denies() {
        let deadline = NOW + Duration::days(GRACE_DAYS);
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::PastDue);
        input.grace_deadline = Some(deadline);

        assert_eq!(evaluate(&input, deadline).tier, Tier::Managed);

        let expired = evaluate(&input, deadline + Duration::seconds(1));
        assert_eq!(expired.tier, Tier::Free);
        // Deadline retained for observability.
        assert_eq!(expired.grace_deadline, Some(deadline));
    }

    #[test]
    fn recovery_clears_grace_deadline() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Active);
        input.grace_deadline = Some(NOW + Duration::days(3));
        assert_eq!(evaluate(&input, NOW).grace_deadline, None);
    }

    #[test]
    fn paid_period_with_still_failing_status_retains_deadline() {
        let deadline = NOW + Duration::days(3);
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::PastDue);
        input.grace_deadline = Some(deadline);
        input.latest_paid_period_end = Some(NOW + Duration::days(30));
        let decision = evaluate(&input, NOW);
        assert_eq!(decision.tier, Tier::Managed);
        assert_eq!(decision.grace_deadline, Some(deadline));
    }

    #[test]
    fn ended_subscription_is_terminal_regardless_of_status() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Active);
        input.subscription_ended_at = Some(NOW - Duration::days(1));
        assert_eq!(evaluate(&input, NOW).tier, Tier::Free);
    }

    #[test]
    fn evaluate_is_idempotent() {
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::PastDue);

        let first = evaluate(&input, NOW);
        input.grace_deadline = first.grace_deadline;
        let second = evaluate(&input, NOW);
        assert_eq!(first, second);
    }

    #[test]
    fn never_subscribed_account_stays_free() {
        let input = PolicyInput {
            paid_tier: Tier::Free,
            active: true,
            status: None,
            current_period_end: None,
            latest_paid_period_end: None,
            cancel_at_period_end: false,
            subscription_ended_at: None,
            grace_deadline: None,
        };
        let decision = evaluate(&input, NOW);
        assert_eq!(decision.tier, Tier::Free);
        assert!(decision.active);
    }

    #[test]
    fn offset_instants_compare_correctly() {
        // The same instant expressed at +10:00 must not be misread as
        // expired or extended.
        let mut input = base_input();
        input.status = Some(SubscriptionStatus::Canceled);
        input.latest_paid_period_end = Some(datetime!(2025-06-01 22:10:00 +10));
        // 12:10 UTC: ten minutes in the future at NOW.
        assert_eq!(evaluate(&input, NOW).tier, Tier::Managed);
        assert_eq!(
            evaluate(&input, NOW + Duration::minutes(11)).tier,
            Tier::Free
        );
    }
}
