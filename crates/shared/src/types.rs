//! Core billing domain types
//!
//! Tier and subscription status enums are stored as text columns and parsed
//! on read; anything unparseable decodes to `None` rather than failing the
//! whole row.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse product entitlement level for a business account.
///
/// `Free` is the lowest tier and the downgrade target when paid access
/// lapses. The ordering matters: payment-health checks only apply to tiers
/// above `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Foundation,
    Managed,
    Autopilot,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Foundation => "foundation",
            Tier::Managed => "managed",
            Tier::Autopilot => "autopilot",
        }
    }

    /// Whether this tier requires a paid subscription
    pub fn is_paid(&self) -> bool {
        *self != Tier::Free
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "foundation" => Ok(Tier::Foundation),
            "managed" => Ok(Tier::Managed),
            "autopilot" => Ok(Tier::Autopilot),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Last-known subscription lifecycle status reported by the payment
/// processor. Mirrors the processor's own status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Statuses that grant access on their own (no grace window involved)
    pub fn is_good_standing(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Gated product features. The tier -> feature table lives in the billing
/// crate's entitlement module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Customisation,
    ManageEnquiries,
    Bookings,
    AiCalls,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::Customisation,
        Feature::ManageEnquiries,
        Feature::Bookings,
        Feature::AiCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Customisation => "customisation",
            Feature::ManageEnquiries => "manage_enquiries",
            Feature::Bookings => "bookings",
            Feature::AiCalls => "ai_calls",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customisation" => Ok(Feature::Customisation),
            "manage_enquiries" => Ok(Feature::ManageEnquiries),
            "bookings" => Ok(Feature::Bookings),
            "ai_calls" => Ok(Feature::AiCalls),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Parse error for the string-backed enums above
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);
