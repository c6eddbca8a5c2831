//! FindCo Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription expiry sweep (daily at 00:00 Europe/Istanbul, 21:00 UTC)
//! - Subscription invariant checks (daily at 03:30 UTC)
//! - Heartbeat (every 5 minutes)

mod reporting;

use std::sync::Arc;
use std::time::Duration;

use findco_billing::{BillingService, InvariantChecker, PgRecordStore, RecordStore};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::reporting::{log_invariant_results, log_sweep_results};

/// 00:00 in Europe/Istanbul (UTC+3, no DST)
const DEFAULT_SWEEP_CRON: &str = "0 0 21 * * *";
const DEFAULT_INVARIANT_CRON: &str = "0 30 3 * * *";

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn cron_from_env(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting FindCo Worker");

    let pool = create_db_pool().await?;
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
    let billing = BillingService::from_env(store);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire subscriptions whose period ended without a renewal
    let sweep_cron = cron_from_env("SWEEP_CRON", DEFAULT_SWEEP_CRON);
    let sweep = billing.sweep.clone();
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let sweep = sweep.clone();
            Box::pin(async move {
                info!("Running subscription expiry sweep");
                match sweep.run().await {
                    Ok(Some(summary)) => {
                        let undelivered = log_sweep_results(&summary);
                        if undelivered > 0 {
                            warn!(undelivered, "Some plan-ended emails were not delivered");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Subscription expiry sweep");

    // Job 2: Consistency checks over the users table
    let invariant_cron = cron_from_env("INVARIANT_CRON", DEFAULT_INVARIANT_CRON);
    let checker = Arc::new(InvariantChecker::new(pool));
    scheduler
        .add(Job::new_async(invariant_cron.as_str(), move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running subscription invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_results(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %invariant_cron, "Scheduled: Subscription invariant checks");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("FindCo Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
