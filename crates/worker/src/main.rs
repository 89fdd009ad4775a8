//! Larder Background Worker
//!
//! Handles scheduled jobs including:
//! - Daily sweep: applies due downgrades and annual referral resets
//!   (once at start-up, then on `SWEEP_CRON`, default 00:10 UTC)
//! - Billing invariant checks after every sweep
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use larder_billing::{BillingService, InvariantCheckSummary, SweepReport};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 10 0 * * *";

/// Create a database connection pool and bring the schema up to date
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let migration_pool = larder_shared::create_migration_pool(&database_url).await?;
    larder_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = larder_shared::create_pool(&database_url).await?;
    info!("Database pool created");
    Ok(pool)
}

fn log_sweep_report(report: &SweepReport) {
    if report.has_failures() {
        warn!(
            downgrades_applied = report.downgrades_applied,
            downgrades_failed = report.downgrades_failed,
            resets_applied = report.resets_applied,
            resets_failed = report.resets_failed,
            "Daily sweep finished with failures; they will be retried next run"
        );
    } else {
        info!(
            downgrades_applied = report.downgrades_applied,
            resets_applied = report.resets_applied,
            "Daily sweep complete"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants hold");
        return;
    }

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            affected_users = violation.user_ids.len(),
            description = %violation.description,
            "Billing invariant violated"
        );
    }
    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant check found violations"
    );
}

/// Sweep, then check invariants against the state it left behind
async fn run_sweep(billing: &BillingService) {
    info!("Running daily sweep");
    match billing
        .reconciliation
        .daily_sweep(OffsetDateTime::now_utc())
        .await
    {
        Ok(report) => log_sweep_report(&report),
        Err(e) => error!(error = %e, "Daily sweep failed"),
    }

    match billing.invariants.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Billing invariant check failed to run"),
    }
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

    info!("Starting Larder Worker");

    let pool = create_db_pool().await?;
    let billing = Arc::new(BillingService::from_env(pool)?);

    // Catch up on anything that fell due while the worker was down
    run_sweep(&billing).await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily sweep plus invariant checks
    let sweep_cron =
        std::env::var("SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                run_sweep(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Daily sweep");

    // Job 2: Health check heartbeat (every 5 minutes)
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

    info!("Larder Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
