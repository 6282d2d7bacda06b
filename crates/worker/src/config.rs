//! Worker configuration

use std::env;

use pixmeter_shared::PoolSettings;

/// Schedules use six-field cron expressions (seconds first), UTC
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    pub reconcile_cron: String,
    pub snapshot_cron: String,
    pub webhook_replay_cron: String,
    pub invariants_cron: String,

    /// Failed webhook events replayed per run; 0 disables the job
    pub webhook_replay_batch: i64,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?,
            database_max_connections: env::var("WORKER_DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            reconcile_cron: env::var("RECONCILE_CRON").unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            snapshot_cron: env::var("SNAPSHOT_CRON").unwrap_or_else(|_| "0 15 0 * * *".to_string()),
            webhook_replay_cron: env::var("WEBHOOK_REPLAY_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            invariants_cron: env::var("INVARIANTS_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            webhook_replay_batch: env::var("WEBHOOK_REPLAY_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
        })
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.database_max_connections,
            ..PoolSettings::default()
        }
    }
}
