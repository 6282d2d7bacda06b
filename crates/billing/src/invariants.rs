//! Billing invariants
//!
//! Read-only consistency checks over the ledgers. Each check is one SQL
//! query; violations carry enough context to find the offending rows.
//! Run them after webhook replays or manual data fixes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Relative difference between actual and estimated cost that counts as drift
const COST_DRIFT_RATIO: f64 = 0.5;
/// Absolute difference (USD) below which drift is ignored
const COST_DRIFT_FLOOR: f64 = 0.01;

const CHECKS: &[&str] = &[
    "single_open_subscription",
    "non_negative_credit_balance",
    "reconciled_cost_drift",
    "payment_has_revenue_event",
    "open_subscription_on_active_product",
];

/// A single failed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be charged or entitled incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OpenSubscriptionsRow {
    user_id: Uuid,
    open_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CostDriftRow {
    generation_id: Uuid,
    user_id: Uuid,
    model: String,
    estimated_cost: f64,
    actual_cost: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanPaymentRow {
    payment_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    stripe_invoice_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct InactiveProductRow {
    subscription_id: Uuid,
    user_id: Uuid,
    product_name: String,
}

/// Runs billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), violations);
        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariants violated"
            );
        }
        Ok(summary)
    }

    /// Run one check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_open_subscription" => self.check_single_open_subscription().await,
            "non_negative_credit_balance" => self.check_non_negative_credit_balance().await,
            "reconciled_cost_drift" => self.check_reconciled_cost_drift().await,
            "payment_has_revenue_event" => self.check_payment_has_revenue_event().await,
            "open_subscription_on_active_product" => {
                self.check_open_subscription_on_active_product().await
            }
            other => Err(BillingError::InvalidInput(format!("unknown invariant: {}", other))),
        }
    }

    pub fn available_checks() -> &'static [&'static str] {
        CHECKS
    }

    /// The partial unique index should make this impossible
    async fn check_single_open_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenSubscriptionsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS open_count
            FROM user_subscriptions
            WHERE ends_at IS NULL
              AND status <> 'canceled'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!("User has {} open subscriptions (expected 1)", row.open_count),
                context: serde_json::json!({ "open_count": row.open_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_non_negative_credit_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT user_id, SUM(amount)::BIGINT AS balance
            FROM credit_entries
            GROUP BY user_id
            HAVING SUM(amount) < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_credit_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Credit balance is {}", row.balance),
                context: serde_json::json!({ "balance": row.balance }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Estimates that are far off the provider-measured cost point at a
    /// stale price table
    async fn check_reconciled_cost_drift(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CostDriftRow> = sqlx::query_as(
            r#"
            SELECT generation_id, user_id, model, estimated_cost, actual_cost
            FROM platform_costs
            WHERE actual_cost IS NOT NULL
              AND ABS(actual_cost - estimated_cost) > $1
              AND ABS(actual_cost - estimated_cost) > $2 * GREATEST(estimated_cost, 0.000001)
            ORDER BY created_at DESC
            LIMIT 100
            "#,
        )
        .bind(COST_DRIFT_FLOOR)
        .bind(COST_DRIFT_RATIO)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "reconciled_cost_drift".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Generation on '{}' estimated at ${:.4} but cost ${:.4}",
                    row.model, row.estimated_cost, row.actual_cost
                ),
                context: serde_json::json!({
                    "generation_id": row.generation_id,
                    "model": row.model,
                    "estimated_cost": row.estimated_cost,
                    "actual_cost": row.actual_cost,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_payment_has_revenue_event(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.user_id, p.amount_cents, p.stripe_invoice_id
            FROM payments p
            LEFT JOIN revenue_events r ON r.payment_id = p.id
            WHERE p.status = 'succeeded'
              AND r.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payment_has_revenue_event".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Succeeded payment of {} cents has no revenue event",
                    row.amount_cents
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "stripe_invoice_id": row.stripe_invoice_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_open_subscription_on_active_product(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InactiveProductRow> = sqlx::query_as(
            r#"
            SELECT s.id AS subscription_id, s.user_id, p.name AS product_name
            FROM user_subscriptions s
            JOIN subscription_products p ON p.id = s.product_id
            WHERE s.ends_at IS NULL
              AND s.status <> 'canceled'
              AND NOT p.is_active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "open_subscription_on_active_product".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Open subscription on retired plan '{}'", row.product_name),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "product_name": row.product_name,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let violation = |name: &str| InvariantViolation {
            invariant: name.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::json!({}),
            severity: ViolationSeverity::High,
        };

        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::UNIX_EPOCH,
            vec![
                violation("non_negative_credit_balance"),
                violation("non_negative_credit_balance"),
                violation("payment_has_revenue_event"),
            ],
        );

        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
    }

    #[test]
    fn test_empty_run_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::UNIX_EPOCH, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, InvariantChecker::available_checks().len());
    }
}
