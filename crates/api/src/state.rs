//! Application state

use std::sync::Arc;
use std::time::Duration;

use shopfront_billing::{BillingService, Business};
use shopfront_shared::{AppConfig, RateLimiter, TtlCache};
use sqlx::PgPool;
use uuid::Uuid;

/// How long a cached account may serve entitlement reads before the next
/// database round trip. Webhook mutations become visible within this bound.
const ENTITLEMENT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Checkout attempts allowed per business/IP pair per window
const CHECKOUT_RATE_LIMIT: u32 = 10;
const CHECKOUT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: AppConfig,
    pub billing: Arc<BillingService>,
    /// Short-TTL account cache backing the entitlement read path
    pub entitlement_cache: TtlCache<Uuid, Business>,
    /// Throttles checkout session creation
    pub checkout_limiter: RateLimiter,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig) -> Self {
        let billing = Arc::new(BillingService::new(&config, pool.clone()));
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
            entitlement_cache: TtlCache::new(ENTITLEMENT_CACHE_TTL),
            checkout_limiter: RateLimiter::new(CHECKOUT_RATE_LIMIT, CHECKOUT_RATE_WINDOW),
        }
    }
}
