//! Financial reporting
//!
//! Read-only rollups over revenue events, platform costs and subscriptions.
//! The only write is the snapshot cache (`financial_period_snapshots`).
//! Revenue is stored in cents and reported in dollars; costs are dollars
//! throughout.

mod period;
mod reports;
mod snapshot;

pub use period::{Period, PeriodType};
pub use reports::{
    AllTimeTotals, ChurnReport, ChurnedUser, ModelCost, MrrPoint, PnlStatement, TierRevenue,
    TopCustomer, TrendPoint,
};
pub use snapshot::FinancialSnapshot;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use pixmeter_shared::{cents_to_dollars, RevenueBucket, RevenueEventType};

use crate::error::BillingResult;

/// Lifetime assumed for LTV until some churned user has a recorded lifetime
pub const DEFAULT_LIFETIME_MONTHS: f64 = 12.0;

/// Percent change from `previous` to `current`.
///
/// 0 when both are zero, 100 when only the previous value is zero (-100
/// if the current value is negative).
pub fn calc_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current == 0.0 {
            0.0
        } else if current > 0.0 {
            100.0
        } else {
            -100.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub subscription: f64,
    pub overage: f64,
    pub credit: f64,
    pub total: f64,
}

impl RevenueBreakdown {
    /// Sum per-type cent totals into dollar buckets
    pub fn from_cents(rows: &[(RevenueEventType, i64)]) -> Self {
        let mut breakdown = Self::default();
        for (event_type, cents) in rows {
            let dollars = cents_to_dollars(*cents);
            match event_type.bucket() {
                RevenueBucket::Subscription => breakdown.subscription += dollars,
                RevenueBucket::Overage => breakdown.overage += dollars,
                RevenueBucket::Credit => breakdown.credit += dollars,
            }
            breakdown.total += dollars;
        }
        breakdown
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Charge-time estimates
    pub estimated: f64,
    /// Provider-measured cost of reconciled generations only
    pub actual: f64,
    /// Actual where reconciled, estimate otherwise
    pub effective: f64,
    pub generation_count: i64,
    pub reconciled_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriberCounts {
    /// Subscriptions on a paid plan running at the end of the window
    pub active: i64,
    /// Subscriptions created in the window
    pub new: i64,
    /// Users whose churn was stamped in the window
    pub churned: i64,
    /// churned / (active + churned), as a percentage
    pub churn_rate: f64,
}

/// Metrics for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialMetrics {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub revenue: RevenueBreakdown,
    pub costs: CostBreakdown,
    pub gross_profit: f64,
    /// Gross profit over revenue, as a percentage
    pub gross_margin: f64,
    pub subscribers: SubscriberCounts,
    /// Point-in-time sum of active subscription prices, independent of the window
    pub mrr: f64,
    pub arr: f64,
    pub arpu: f64,
    pub ltv: f64,
}

/// Raw figures a [`FinancialMetrics`] is derived from
#[derive(Debug, Clone, Default)]
pub struct MetricInputs {
    pub revenue: RevenueBreakdown,
    pub costs: CostBreakdown,
    pub active: i64,
    pub new: i64,
    pub churned: i64,
    pub mrr_cents: i64,
    pub average_lifetime_months: Option<f64>,
}

impl FinancialMetrics {
    pub fn derive(period_start: OffsetDateTime, period_end: OffsetDateTime, inputs: &MetricInputs) -> Self {
        let revenue = inputs.revenue.total;
        let gross_profit = revenue - inputs.costs.effective;
        let gross_margin = if revenue > 0.0 {
            gross_profit / revenue * 100.0
        } else {
            0.0
        };

        let at_risk = inputs.active + inputs.churned;
        let churn_rate = if at_risk > 0 {
            inputs.churned as f64 / at_risk as f64 * 100.0
        } else {
            0.0
        };

        let arpu = if inputs.active > 0 {
            revenue / inputs.active as f64
        } else {
            0.0
        };
        let lifetime = inputs
            .average_lifetime_months
            .filter(|months| *months > 0.0)
            .unwrap_or(DEFAULT_LIFETIME_MONTHS);
        let mrr = cents_to_dollars(inputs.mrr_cents);

        Self {
            period_start,
            period_end,
            revenue: inputs.revenue,
            costs: inputs.costs,
            gross_profit,
            gross_margin,
            subscribers: SubscriberCounts {
                active: inputs.active,
                new: inputs.new,
                churned: inputs.churned,
                churn_rate,
            },
            mrr,
            arr: mrr * 12.0,
            arpu,
            ltv: arpu * lifetime,
        }
    }
}

/// Percent changes between two windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricChanges {
    pub revenue: f64,
    pub cost: f64,
    pub gross_profit: f64,
    pub active_subscribers: f64,
    pub new_subscribers: f64,
    pub churned_subscribers: f64,
    pub arpu: f64,
    pub generation_count: f64,
}

impl MetricChanges {
    pub fn between(current: &FinancialMetrics, previous: &FinancialMetrics) -> Self {
        Self {
            revenue: calc_change(current.revenue.total, previous.revenue.total),
            cost: calc_change(current.costs.effective, previous.costs.effective),
            gross_profit: calc_change(current.gross_profit, previous.gross_profit),
            active_subscribers: calc_change(
                current.subscribers.active as f64,
                previous.subscribers.active as f64,
            ),
            new_subscribers: calc_change(current.subscribers.new as f64, previous.subscribers.new as f64),
            churned_subscribers: calc_change(
                current.subscribers.churned as f64,
                previous.subscribers.churned as f64,
            ),
            arpu: calc_change(current.arpu, previous.arpu),
            generation_count: calc_change(
                current.costs.generation_count as f64,
                previous.costs.generation_count as f64,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub period_type: PeriodType,
    pub current: FinancialMetrics,
    pub previous: FinancialMetrics,
    pub changes: MetricChanges,
}

/// Financial aggregator
#[derive(Clone)]
pub struct FinancialAggregator {
    pool: PgPool,
}

impl FinancialAggregator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Metrics over `[start, end)`
    pub async fn metrics(&self, start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<FinancialMetrics> {
        let revenue = self.revenue_between(start, end).await?;
        let costs = self.costs_between(start, end).await?;

        let active = self.active_paid_as_of(end).await?;

        let (new,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_subscriptions WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let (churned,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_metrics WHERE churned_at >= $1 AND churned_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let mrr_cents = self.current_mrr_cents().await?;
        let average_lifetime_months = self.average_lifetime_months().await?;

        Ok(FinancialMetrics::derive(
            start,
            end,
            &MetricInputs {
                revenue,
                costs,
                active,
                new,
                churned,
                mrr_cents,
                average_lifetime_months,
            },
        ))
    }

    /// Metrics for the period containing `at` and the one before it
    pub async fn with_comparison(&self, period_type: PeriodType, at: OffsetDateTime) -> BillingResult<PeriodComparison> {
        let current_period = Period::containing(period_type, at)?;
        let previous_period = current_period.previous()?;

        let current = self.metrics(current_period.start, current_period.end).await?;
        let previous = self.metrics(previous_period.start, previous_period.end).await?;
        let changes = MetricChanges::between(&current, &previous);

        Ok(PeriodComparison {
            period_type,
            current,
            previous,
            changes,
        })
    }

    pub(crate) async fn revenue_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<RevenueBreakdown> {
        let rows: Vec<(RevenueEventType, i64)> = sqlx::query_as(
            r#"
            SELECT event_type, COALESCE(SUM(amount_cents), 0)::BIGINT
            FROM revenue_events
            WHERE created_at >= $1 AND created_at < $2
            GROUP BY event_type
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(RevenueBreakdown::from_cents(&rows))
    }

    pub(crate) async fn costs_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<CostBreakdown> {
        let (estimated, actual, effective, generation_count, reconciled_count): (f64, f64, f64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(estimated_cost), 0)::FLOAT8,
                    COALESCE(SUM(actual_cost), 0)::FLOAT8,
                    COALESCE(SUM(COALESCE(actual_cost, estimated_cost)), 0)::FLOAT8,
                    COUNT(*),
                    COUNT(actual_cost)
                FROM platform_costs
                WHERE created_at >= $1 AND created_at < $2
                "#,
            )
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;

        Ok(CostBreakdown {
            estimated,
            actual,
            effective,
            generation_count,
            reconciled_count,
        })
    }

    /// Subscriptions on a paid plan that were running at `at`
    pub(crate) async fn active_paid_as_of(&self, at: OffsetDateTime) -> BillingResult<i64> {
        let (active,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM user_subscriptions s
            JOIN subscription_products p ON p.id = s.product_id
            WHERE s.starts_at < $1
              AND (s.ends_at IS NULL OR s.ends_at > $1)
              AND p.price_cents > 0
            "#,
        )
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    pub(crate) async fn current_mrr_cents(&self) -> BillingResult<i64> {
        let (mrr,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(p.price_cents), 0)::BIGINT
            FROM user_subscriptions s
            JOIN subscription_products p ON p.id = s.product_id
            WHERE s.ends_at IS NULL
              AND s.status <> 'canceled'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(mrr)
    }

    /// Mean months between first payment and churn over churned users
    pub(crate) async fn average_lifetime_months(&self) -> BillingResult<Option<f64>> {
        let (months,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (churned_at - first_payment_at)) / 2592000.0)::FLOAT8
            FROM user_metrics
            WHERE churned_at IS NOT NULL
              AND first_payment_at IS NOT NULL
              AND churned_at > first_payment_at
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(months)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_calc_change() {
        assert_eq!(calc_change(0.0, 0.0), 0.0);
        assert_eq!(calc_change(5.0, 0.0), 100.0);
        assert_eq!(calc_change(50.0, 100.0), -50.0);
        assert_eq!(calc_change(150.0, 100.0), 50.0);
    }

    #[test]
    fn test_revenue_breakdown_buckets_credit_types_together() {
        let breakdown = RevenueBreakdown::from_cents(&[
            (RevenueEventType::Subscription, 2_000),
            (RevenueEventType::Overage, 150),
            (RevenueEventType::CreditPurchase, 500),
            (RevenueEventType::CreditUsage, 250),
        ]);
        assert_eq!(breakdown.subscription, 20.0);
        assert_eq!(breakdown.overage, 1.5);
        assert_eq!(breakdown.credit, 7.5);
        assert_eq!(breakdown.total, 29.0);
    }

    fn inputs() -> MetricInputs {
        MetricInputs {
            revenue: RevenueBreakdown {
                subscription: 80.0,
                overage: 10.0,
                credit: 10.0,
                total: 100.0,
            },
            costs: CostBreakdown {
                estimated: 30.0,
                actual: 20.0,
                effective: 25.0,
                generation_count: 900,
                reconciled_count: 400,
            },
            active: 8,
            new: 3,
            churned: 2,
            mrr_cents: 7_600,
            average_lifetime_months: Some(6.0),
        }
    }

    #[test]
    fn test_derived_metrics() {
        let m = FinancialMetrics::derive(
            datetime!(2025-04-01 0:00 UTC),
            datetime!(2025-05-01 0:00 UTC),
            &inputs(),
        );
        assert_eq!(m.gross_profit, 75.0);
        assert_eq!(m.gross_margin, 75.0);
        assert_eq!(m.subscribers.churn_rate, 20.0);
        assert_eq!(m.mrr, 76.0);
        assert_eq!(m.arr, 912.0);
        assert_eq!(m.arpu, 12.5);
        assert_eq!(m.ltv, 75.0);
    }

    #[test]
    fn test_empty_window_has_no_division_by_zero() {
        let m = FinancialMetrics::derive(
            datetime!(2025-04-01 0:00 UTC),
            datetime!(2025-05-01 0:00 UTC),
            &MetricInputs::default(),
        );
        assert_eq!(m.gross_margin, 0.0);
        assert_eq!(m.subscribers.churn_rate, 0.0);
        assert_eq!(m.arpu, 0.0);
        assert_eq!(m.ltv, 0.0);
    }

    #[test]
    fn test_ltv_falls_back_to_default_lifetime() {
        let mut raw = inputs();
        raw.average_lifetime_months = None;
        let m = FinancialMetrics::derive(
            datetime!(2025-04-01 0:00 UTC),
            datetime!(2025-05-01 0:00 UTC),
            &raw,
        );
        assert_eq!(m.ltv, 12.5 * DEFAULT_LIFETIME_MONTHS);
    }

    #[test]
    fn test_changes_between_periods() {
        let start = datetime!(2025-04-01 0:00 UTC);
        let end = datetime!(2025-05-01 0:00 UTC);
        let current = FinancialMetrics::derive(start, end, &inputs());
        let mut prev_inputs = inputs();
        prev_inputs.revenue.total = 50.0;
        prev_inputs.new = 0;
        let previous = FinancialMetrics::derive(start, end, &prev_inputs);

        let changes = MetricChanges::between(&current, &previous);
        assert_eq!(changes.revenue, 100.0);
        assert_eq!(changes.new_subscribers, 100.0);
        assert_eq!(changes.cost, 0.0);
    }
}
