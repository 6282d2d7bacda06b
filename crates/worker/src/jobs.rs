//! Scheduled billing jobs
//!
//! Each job owns a [`SingleFlight`] guard: a tick that fires while the
//! previous run of the same job is still going is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pixmeter_billing::{BillingService, PeriodType};
use time::{Date, OffsetDateTime};

/// At most one run of a job at a time, within this process
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a run is already in flight
    pub fn try_start(&self) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Clears the flight flag on drop, including when the job panics
#[derive(Debug)]
pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Periods snapshotted after `today` begins: every period type that
/// contains yesterday, so closing periods get their final figures
pub fn snapshot_targets(today: Date) -> (Date, [PeriodType; 5]) {
    let yesterday = today.previous_day().unwrap_or(today);
    (
        yesterday,
        [
            PeriodType::Day,
            PeriodType::Week,
            PeriodType::Month,
            PeriodType::Quarter,
            PeriodType::Year,
        ],
    )
}

/// The worker's jobs over one shared billing service
#[derive(Clone)]
pub struct BillingJobs {
    billing: Arc<BillingService>,
    replay_batch: i64,
    reconcile_flight: SingleFlight,
    snapshot_flight: SingleFlight,
    replay_flight: SingleFlight,
    invariants_flight: SingleFlight,
}

impl BillingJobs {
    pub fn new(billing: Arc<BillingService>, replay_batch: i64) -> Self {
        Self {
            billing,
            replay_batch,
            reconcile_flight: SingleFlight::new(),
            snapshot_flight: SingleFlight::new(),
            replay_flight: SingleFlight::new(),
            invariants_flight: SingleFlight::new(),
        }
    }

    /// Reconcile the newest unreconciled generations
    pub async fn reconcile(&self) {
        let Some(_flight) = self.reconcile_flight.try_start() else {
            tracing::warn!(job = "reconcile", "Previous run still in progress, skipping tick");
            return;
        };

        let limit = self.billing.settings.reconcile_batch_limit;
        match self.billing.reconciler.reconcile_batch(limit).await {
            Ok(result) => tracing::info!(
                job = "reconcile",
                processed = result.processed,
                reconciled = result.reconciled,
                errors = result.errors,
                "Reconciliation batch finished"
            ),
            Err(e) => tracing::error!(job = "reconcile", error = %e, "Reconciliation batch failed"),
        }
    }

    /// Upsert snapshots for the periods containing yesterday
    pub async fn snapshot(&self) {
        let Some(_flight) = self.snapshot_flight.try_start() else {
            tracing::warn!(job = "snapshot", "Previous run still in progress, skipping tick");
            return;
        };

        let (date, period_types) = snapshot_targets(OffsetDateTime::now_utc().date());
        for period_type in period_types {
            match self.billing.financials.snapshot(period_type, date).await {
                Ok(snapshot) => tracing::info!(
                    job = "snapshot",
                    period_type = %period_type,
                    period_start = %snapshot.period_start,
                    total_revenue = snapshot.total_revenue,
                    "Financial snapshot stored"
                ),
                Err(e) => tracing::error!(
                    job = "snapshot",
                    period_type = %period_type,
                    error = %e,
                    "Financial snapshot failed"
                ),
            }
        }
    }

    /// Retry webhook events whose handling failed
    pub async fn replay_failed_webhooks(&self) {
        if self.replay_batch <= 0 {
            return;
        }
        let Some(_flight) = self.replay_flight.try_start() else {
            tracing::warn!(job = "webhook_replay", "Previous run still in progress, skipping tick");
            return;
        };

        match self.billing.webhooks.replay_all_failed(self.replay_batch).await {
            Ok(results) if results.is_empty() => {}
            Ok(results) => {
                let succeeded = results.iter().filter(|r| r.success).count();
                tracing::info!(
                    job = "webhook_replay",
                    replayed = results.len(),
                    succeeded = succeeded,
                    still_failing = results.len() - succeeded,
                    "Failed webhook events replayed"
                );
            }
            Err(e) => tracing::error!(job = "webhook_replay", error = %e, "Webhook replay failed"),
        }
    }

    pub async fn check_invariants(&self) {
        let Some(_flight) = self.invariants_flight.try_start() else {
            tracing::warn!(job = "invariants", "Previous run still in progress, skipping tick");
            return;
        };

        match self.billing.invariants.run_all_checks().await {
            Ok(summary) if summary.healthy => {
                tracing::info!(job = "invariants", checks = summary.checks_run, "Billing invariants hold");
            }
            Ok(summary) => {
                for violation in &summary.violations {
                    tracing::error!(
                        job = "invariants",
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        users = ?violation.user_ids,
                        description = %violation.description,
                        "Billing invariant violated"
                    );
                }
            }
            Err(e) => tracing::error!(job = "invariants", error = %e, "Invariant check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_single_flight_blocks_overlap() {
        let flight = SingleFlight::new();

        let first = flight.try_start();
        assert!(first.is_some());
        assert!(flight.is_running());
        assert!(flight.try_start().is_none());

        drop(first);
        assert!(!flight.is_running());
        assert!(flight.try_start().is_some());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let flight = SingleFlight::new();
        let clone = flight.clone();

        let _guard = flight.try_start();
        assert!(clone.try_start().is_none());
    }

    #[tokio::test]
    async fn test_guard_released_after_panicking_task() {
        let flight = SingleFlight::new();
        let task_flight = flight.clone();

        let result = tokio::spawn(async move {
            let _guard = task_flight.try_start();
            panic!("job blew up");
        })
        .await;

        assert!(result.is_err());
        assert!(!flight.is_running());
    }

    #[test]
    fn test_snapshot_targets_yesterday() {
        let (day, periods) = snapshot_targets(date!(2025 - 04 - 01));
        assert_eq!(day, date!(2025 - 03 - 31));
        assert_eq!(periods.len(), 5);
        assert!(periods.contains(&PeriodType::Month));
    }
}
