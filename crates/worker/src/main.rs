//! Shopfront Background Worker
//!
//! Scheduled jobs:
//! - Billing re-resolution sweep (every 15 minutes): refreshes every account
//!   holding a live subscription against the processor and re-runs the
//!   access policy, closing the gap left by dropped or reordered webhooks
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use shopfront_billing::BillingService;
use shopfront_shared::config::AppConfig;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Shopfront Worker");

    let config = AppConfig::from_env()?;
    let pool = shopfront_shared::create_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::new(&config, pool));
    let stripe_config = config.stripe.clone();

    let scheduler = JobScheduler::new().await?;

    // Billing sweep: at minute 0, 15, 30, 45
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            let stripe_config = stripe_config.clone();
            Box::pin(async move {
                info!("Running billing re-resolution sweep");
                match shopfront_billing::run_sweep(&billing.store, &billing.gateway, |price| {
                    stripe_config.tier_for_price(price)
                })
                .await
                {
                    Ok(report) => info!(
                        scanned = report.scanned,
                        updated = report.updated,
                        tier_changes = report.tier_changes,
                        failed = report.failed,
                        "Billing sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Billing sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing re-resolution sweep (every 15 minutes)");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
