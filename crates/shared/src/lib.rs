// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shopfront Shared Library
//!
//! Types and infrastructure shared by the API server, the billing engine and
//! the background worker: tier/status enums, the immutable process
//! configuration, central time normalization, and the injectable TTL cache
//! and rate-limit stores.

pub mod cache;
pub mod clock;
pub mod config;
pub mod rate_limit;
pub mod types;

pub use cache::TtlCache;
pub use config::AppConfig;
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use types::{Feature, SubscriptionStatus, Tier};

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the database connection pool used by all binaries
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Apply pending migrations from the workspace `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
