//! Pixmeter background worker
//!
//! Runs the billing maintenance jobs on a cron schedule against the same
//! database as the API.

// Test code patterns (expected in test modules):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
mod jobs;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use pixmeter_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::WorkerConfig;
use crate::jobs::BillingJobs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pixmeter_shared::init_tracing("info,pixmeter_worker=debug,pixmeter_billing=debug");

    let config = WorkerConfig::from_env()?;

    let pool = pixmeter_shared::create_pool(&config.database_url, &config.pool_settings())
        .await
        .context("failed to connect to database")?;

    let billing = BillingService::from_env(pool.clone()).context("invalid billing configuration")?;
    let jobs = BillingJobs::new(Arc::new(billing), config.webhook_replay_batch);

    let mut scheduler = JobScheduler::new().await.context("failed to create scheduler")?;

    add_job(&scheduler, "reconcile", &config.reconcile_cron, jobs.clone(), |jobs| async move {
        jobs.reconcile().await
    })
    .await?;
    add_job(&scheduler, "snapshot", &config.snapshot_cron, jobs.clone(), |jobs| async move {
        jobs.snapshot().await
    })
    .await?;
    add_job(&scheduler, "webhook_replay", &config.webhook_replay_cron, jobs.clone(), |jobs| async move {
        jobs.replay_failed_webhooks().await
    })
    .await?;
    add_job(&scheduler, "invariants", &config.invariants_cron, jobs.clone(), |jobs| async move {
        jobs.check_invariants().await
    })
    .await?;

    scheduler.start().await.context("failed to start scheduler")?;
    tracing::info!("Pixmeter worker started");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    scheduler.shutdown().await.context("failed to stop scheduler")?;
    pool.close().await;
    tracing::info!("Pixmeter worker stopped");
    Ok(())
}

async fn add_job<F, Fut>(
    scheduler: &JobScheduler,
    name: &'static str,
    schedule: &str,
    jobs: BillingJobs,
    run: F,
) -> anyhow::Result<()>
where
    F: Fn(BillingJobs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let run = Arc::new(run);
    let job = Job::new_async(schedule, move |_job_id, _scheduler| {
        let jobs = jobs.clone();
        let run = run.clone();
        Box::pin(async move {
            tracing::debug!(job = name, "Job tick");
            run(jobs).await;
        })
    })
    .with_context(|| format!("invalid cron expression for {}: {}", name, schedule))?;

    scheduler
        .add(job)
        .await
        .with_context(|| format!("failed to schedule {}", name))?;
    tracing::info!(job = name, schedule = %schedule, "Job scheduled");
    Ok(())
}
