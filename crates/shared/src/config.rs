//! Process configuration
//!
//! Loaded once at startup from the environment and passed by reference into
//! every component; nothing re-reads configuration from global scope after
//! boot.

use crate::types::Tier;

/// Immutable application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub frontend_url: String,
    pub stripe: StripeConfig,
    pub brevo: BrevoConfig,
}

/// Stripe credentials and the price-id <-> tier mapping
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub foundation_price_id: String,
    pub managed_price_id: String,
    pub autopilot_price_id: String,
}

impl StripeConfig {
    /// Map a processor price id back to the tier it sells
    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        if price_id == self.foundation_price_id {
            Some(Tier::Foundation)
        } else if price_id == self.managed_price_id {
            Some(Tier::Managed)
        } else if price_id == self.autopilot_price_id {
            Some(Tier::Autopilot)
        } else {
            None
        }
    }

    /// Price id for a purchasable tier; `Free` has no price
    pub fn price_for_tier(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Free => None,
            Tier::Foundation => Some(&self.foundation_price_id),
            Tier::Managed => Some(&self.managed_price_id),
            Tier::Autopilot => Some(&self.autopilot_price_id),
        }
    }
}

/// Transactional email (Brevo) credentials
#[derive(Debug, Clone)]
pub struct BrevoConfig {
    pub api_key: String,
    /// Override for tests; defaults to the public Brevo endpoint
    pub base_url: String,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// Call `dotenvy::dotenv().ok()` before this in binaries.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            stripe: StripeConfig {
                secret_key: require("STRIPE_SECRET_KEY")?,
                webhook_secret: require("STRIPE_WEBHOOK_SECRET")?,
                foundation_price_id: require("STRIPE_FOUNDATION_PRICE_ID")?,
                managed_price_id: require("STRIPE_MANAGED_PRICE_ID")?,
                autopilot_price_id: require("STRIPE_AUTOPILOT_PRICE_ID")?,
            },
            brevo: BrevoConfig {
                api_key: std::env::var("BREVO_API_KEY").unwrap_or_default(),
                base_url: std::env::var("BREVO_BASE_URL")
                    .unwrap_or_else(|_| "https://api.brevo.com".to_string()),
            },
        })
    }
}

fn require(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set"))
}
