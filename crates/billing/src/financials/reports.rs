//! Operator reports

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use pixmeter_shared::cents_to_dollars;

use super::period::{Period, PeriodType};
use super::{CostBreakdown, FinancialAggregator, RevenueBreakdown, DEFAULT_LIFETIME_MONTHS};
use crate::error::BillingResult;
use crate::usage::month_key;

/// Upper bound on series length for trend-style reports
const MAX_SERIES_POINTS: u32 = 36;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRevenue {
    pub tier: String,
    pub revenue: f64,
    pub customers: i64,
    pub events: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopCustomer {
    pub user_id: Uuid,
    pub revenue: f64,
    pub events: i64,
    pub lifetime_paid: f64,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub generation_count: i64,
    pub reconciled_count: i64,
    pub estimated: f64,
    pub actual: f64,
    pub effective: f64,
    pub average_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub revenue: f64,
    pub cost: f64,
    pub profit: f64,
    pub generation_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlStatement {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub revenue: RevenueBreakdown,
    pub cost_of_revenue: CostBreakdown,
    pub gross_profit: f64,
    pub gross_margin: f64,
    /// Failed payment attempts in the window (not counted as revenue)
    pub failed_payments: i64,
    pub failed_payment_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrrPoint {
    pub month: String,
    pub mrr: f64,
    pub active_subscriptions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnedUser {
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub churned_at: OffsetDateTime,
    pub lifetime_months: Option<f64>,
    pub total_paid: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnReport {
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub active: i64,
    pub churned: i64,
    pub churn_rate: f64,
    pub average_lifetime_months: f64,
    pub churned_users: Vec<ChurnedUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllTimeTotals {
    pub total_revenue: f64,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub effective_cost: f64,
    pub gross_profit: f64,
    pub generation_count: i64,
    pub paying_users: i64,
    pub payment_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TierRevenueRow {
    tier: String,
    revenue_cents: i64,
    customers: i64,
    events: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TopCustomerRow {
    user_id: Uuid,
    revenue_cents: i64,
    events: i64,
    lifetime_paid_cents: i64,
    plan: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ModelCostRow {
    model: String,
    generation_count: i64,
    reconciled_count: i64,
    estimated: f64,
    actual: f64,
    effective: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct ChurnedUserRow {
    user_id: Uuid,
    churned_at: OffsetDateTime,
    lifetime_months: Option<f64>,
    total_paid_cents: i64,
}

impl FinancialAggregator {
    /// Revenue grouped by the plan each paying user was on when charged
    pub async fn revenue_by_tier(&self, start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<Vec<TierRevenue>> {
        let rows: Vec<TierRevenueRow> = sqlx::query_as(
            r#"
            SELECT
                COALESCE(plan.name, 'No plan') AS tier,
                COALESCE(SUM(r.amount_cents), 0)::BIGINT AS revenue_cents,
                COUNT(DISTINCT r.user_id) AS customers,
                COUNT(*) AS events
            FROM revenue_events r
            LEFT JOIN LATERAL (
                SELECT p.name
                FROM user_subscriptions s
                JOIN subscription_products p ON p.id = s.product_id
                WHERE s.user_id = r.user_id AND s.starts_at <= r.created_at
                ORDER BY s.starts_at DESC
                LIMIT 1
            ) plan ON TRUE
            WHERE r.created_at >= $1 AND r.created_at < $2
            GROUP BY COALESCE(plan.name, 'No plan')
            ORDER BY revenue_cents DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TierRevenue {
                tier: row.tier,
                revenue: cents_to_dollars(row.revenue_cents),
                customers: row.customers,
                events: row.events,
            })
            .collect())
    }

    /// Highest-revenue users in the window
    pub async fn top_customers(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<TopCustomer>> {
        let rows: Vec<TopCustomerRow> = sqlx::query_as(
            r#"
            SELECT
                r.user_id,
                SUM(r.amount_cents)::BIGINT AS revenue_cents,
                COUNT(*) AS events,
                COALESCE(MAX(m.total_paid_cents), 0)::BIGINT AS lifetime_paid_cents,
                MAX(plan.name) AS plan
            FROM revenue_events r
            LEFT JOIN user_metrics m ON m.user_id = r.user_id
            LEFT JOIN LATERAL (
                SELECT p.name
                FROM user_subscriptions s
                JOIN subscription_products p ON p.id = s.product_id
                WHERE s.user_id = r.user_id
                  AND s.ends_at IS NULL
                  AND s.status <> 'canceled'
                LIMIT 1
            ) plan ON TRUE
            WHERE r.created_at >= $1 AND r.created_at < $2
            GROUP BY r.user_id
            ORDER BY revenue_cents DESC
            LIMIT $3
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TopCustomer {
                user_id: row.user_id,
                revenue: cents_to_dollars(row.revenue_cents),
                events: row.events,
                lifetime_paid: cents_to_dollars(row.lifetime_paid_cents),
                plan: row.plan,
            })
            .collect())
    }

    pub async fn cost_by_model(&self, start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<Vec<ModelCost>> {
        let rows: Vec<ModelCostRow> = sqlx::query_as(
            r#"
            SELECT
                model,
                COUNT(*) AS generation_count,
                COUNT(actual_cost) AS reconciled_count,
                COALESCE(SUM(estimated_cost), 0)::FLOAT8 AS estimated,
                COALESCE(SUM(actual_cost), 0)::FLOAT8 AS actual,
                COALESCE(SUM(COALESCE(actual_cost, estimated_cost)), 0)::FLOAT8 AS effective
            FROM platform_costs
            WHERE created_at >= $1 AND created_at < $2
            GROUP BY model
            ORDER BY effective DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ModelCost {
                average_cost: if row.generation_count > 0 {
                    row.effective / row.generation_count as f64
                } else {
                    0.0
                },
                model: row.model,
                generation_count: row.generation_count,
                reconciled_count: row.reconciled_count,
                estimated: row.estimated,
                actual: row.actual,
                effective: row.effective,
            })
            .collect())
    }

    /// Revenue, cost and profit for `periods` consecutive periods ending with
    /// the one containing `at`, oldest first
    pub async fn revenue_trend(
        &self,
        period_type: PeriodType,
        periods: u32,
        at: OffsetDateTime,
    ) -> BillingResult<Vec<TrendPoint>> {
        let windows = Period::trailing(period_type, at, periods.clamp(1, MAX_SERIES_POINTS))?;
        let mut points = Vec::with_capacity(windows.len());

        for window in windows {
            let revenue = self.revenue_between(window.start, window.end).await?;
            let costs = self.costs_between(window.start, window.end).await?;
            points.push(TrendPoint {
                period_start: window.start,
                period_end: window.end,
                revenue: revenue.total,
                cost: costs.effective,
                profit: revenue.total - costs.effective,
                generation_count: costs.generation_count,
            });
        }

        Ok(points)
    }

    pub async fn pnl(&self, start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<PnlStatement> {
        let revenue = self.revenue_between(start, end).await?;
        let cost_of_revenue = self.costs_between(start, end).await?;

        let (failed_payments, failed_cents): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(amount_cents), 0)::BIGINT
            FROM payments
            WHERE status = 'failed' AND created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let gross_profit = revenue.total - cost_of_revenue.effective;
        let gross_margin = if revenue.total > 0.0 {
            gross_profit / revenue.total * 100.0
        } else {
            0.0
        };

        Ok(PnlStatement {
            period_start: start,
            period_end: end,
            revenue,
            cost_of_revenue,
            gross_profit,
            gross_margin,
            failed_payments,
            failed_payment_amount: cents_to_dollars(failed_cents),
        })
    }

    /// MRR at the end of each of the last `months` months (the current month
    /// is measured as of `at`), oldest first
    pub async fn mrr_history(&self, months: u32, at: OffsetDateTime) -> BillingResult<Vec<MrrPoint>> {
        let windows = Period::trailing(PeriodType::Month, at, months.clamp(1, MAX_SERIES_POINTS))?;
        let mut points = Vec::with_capacity(windows.len());

        for window in windows {
            let as_of = window.end.min(at);
            let (mrr_cents, active_subscriptions): (i64, i64) = sqlx::query_as(
                r#"
                SELECT COALESCE(SUM(p.price_cents), 0)::BIGINT, COUNT(*)
                FROM user_subscriptions s
                JOIN subscription_products p ON p.id = s.product_id
                WHERE s.starts_at < $1
                  AND (s.ends_at IS NULL OR s.ends_at > $1)
                  AND p.price_cents > 0
                "#,
            )
            .bind(as_of)
            .fetch_one(&self.pool)
            .await?;

            points.push(MrrPoint {
                month: month_key(window.start),
                mrr: cents_to_dollars(mrr_cents),
                active_subscriptions,
            });
        }

        Ok(points)
    }

    pub async fn churn_report(&self, start: OffsetDateTime, end: OffsetDateTime) -> BillingResult<ChurnReport> {
        let churned_users: Vec<ChurnedUserRow> = sqlx::query_as(
            r#"
            SELECT
                user_id,
                churned_at,
                CASE WHEN first_payment_at IS NOT NULL AND churned_at > first_payment_at
                     THEN (EXTRACT(EPOCH FROM (churned_at - first_payment_at)) / 2592000.0)::FLOAT8
                END AS lifetime_months,
                total_paid_cents
            FROM user_metrics
            WHERE churned_at >= $1 AND churned_at < $2
            ORDER BY churned_at DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let active = self.active_paid_as_of(end).await?;

        let churned = churned_users.len() as i64;
        let churn_rate = if active + churned > 0 {
            churned as f64 / (active + churned) as f64 * 100.0
        } else {
            0.0
        };
        let average_lifetime_months = self
            .average_lifetime_months()
            .await?
            .unwrap_or(DEFAULT_LIFETIME_MONTHS);

        Ok(ChurnReport {
            period_start: start,
            period_end: end,
            active,
            churned,
            churn_rate,
            average_lifetime_months,
            churned_users: churned_users
                .into_iter()
                .map(|row| ChurnedUser {
                    user_id: row.user_id,
                    churned_at: row.churned_at,
                    lifetime_months: row.lifetime_months,
                    total_paid: cents_to_dollars(row.total_paid_cents),
                })
                .collect(),
        })
    }

    pub async fn all_time_totals(&self) -> BillingResult<AllTimeTotals> {
        let (revenue_cents,): (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM revenue_events")
                .fetch_one(&self.pool)
                .await?;

        let (estimated_cost, actual_cost, effective_cost, generation_count): (f64, f64, f64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(estimated_cost), 0)::FLOAT8,
                    COALESCE(SUM(actual_cost), 0)::FLOAT8,
                    COALESCE(SUM(COALESCE(actual_cost, estimated_cost)), 0)::FLOAT8,
                    COUNT(*)
                FROM platform_costs
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let (paying_users, payment_count): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT user_id), COUNT(*)
            FROM payments
            WHERE status = 'succeeded'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_revenue = cents_to_dollars(revenue_cents);
        Ok(AllTimeTotals {
            total_revenue,
            estimated_cost,
            actual_cost,
            effective_cost,
            gross_profit: total_revenue - effective_cost,
            generation_count,
            paying_users,
            payment_count,
        })
    }
}
