//! DealerHub Background Worker
//!
//! Handles scheduled jobs:
//! - Webhook recovery: replay failed and stuck billing events (every 5 minutes)
//! - Operator backlog report for events replay cannot fix (hourly)
//! - Heartbeat (every 5 minutes)

mod webhook_recovery;

use std::sync::Arc;
use std::time::Duration;

use dealerhub_billing::{BillingConfig, BillingService};
use dealerhub_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting DealerHub Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let config = BillingConfig::from_env()?;
    let max_attempts = config.max_replay_attempts;
    let billing = Arc::new(BillingService::from_pool(pool, config)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay failed/stuck webhook events (every 5 minutes)
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                webhook_recovery::run_replay_cycle(&billing.webhooks, max_attempts).await;
            })
        })?)
        .await?;
    info!(max_attempts, "Scheduled: Webhook recovery (every 5 minutes)");

    // Job 2: Events needing an operator (hourly)
    let backlog_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = backlog_billing.clone();
            Box::pin(async move {
                webhook_recovery::report_operator_backlog(&billing.webhooks, max_attempts).await;
            })
        })?)
        .await?;
    info!("Scheduled: Operator backlog report (hourly)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Catch up on anything left over from before a restart.
    webhook_recovery::run_replay_cycle(&billing.webhooks, max_attempts).await;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("DealerHub Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
