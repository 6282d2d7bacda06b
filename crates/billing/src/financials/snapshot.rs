//! Period snapshots
//!
//! Denormalized copies of [`FinancialMetrics`] keyed by (period type, period
//! start). Recomputing a period overwrites its row.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::period::{Period, PeriodType};
use super::{FinancialAggregator, FinancialMetrics};
use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FinancialSnapshot {
    pub id: Uuid,
    pub period_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub subscription_revenue: f64,
    pub overage_revenue: f64,
    pub credit_revenue: f64,
    pub total_revenue: f64,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub effective_cost: f64,
    pub gross_profit: f64,
    pub gross_margin: f64,
    pub active_subscribers: i64,
    pub new_subscribers: i64,
    pub churned_subscribers: i64,
    pub churn_rate: f64,
    pub mrr: f64,
    pub arr: f64,
    pub arpu: f64,
    pub ltv: f64,
    pub generation_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

const SNAPSHOT_COLUMNS: &str = "id, period_type, period_start, period_end, subscription_revenue, \
     overage_revenue, credit_revenue, total_revenue, estimated_cost, actual_cost, effective_cost, \
     gross_profit, gross_margin, active_subscribers, new_subscribers, churned_subscribers, \
     churn_rate, mrr, arr, arpu, ltv, generation_count, computed_at";

impl FinancialAggregator {
    /// Compute and store the snapshot for the period of `period_type`
    /// containing `date`
    pub async fn snapshot(&self, period_type: PeriodType, date: Date) -> BillingResult<FinancialSnapshot> {
        let period = Period::containing(period_type, date.midnight().assume_utc())?;
        let metrics = self.metrics(period.start, period.end).await?;
        let snapshot = self.upsert_snapshot(period_type, &metrics).await?;

        tracing::info!(
            period_type = %period_type,
            period_start = %period.start,
            total_revenue = metrics.revenue.total,
            gross_profit = metrics.gross_profit,
            "Financial snapshot stored"
        );

        Ok(snapshot)
    }

    /// Most recent snapshots of one period type, newest first
    pub async fn list_snapshots(&self, period_type: PeriodType, limit: i64) -> BillingResult<Vec<FinancialSnapshot>> {
        let query = format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS}
            FROM financial_period_snapshots
            WHERE period_type = $1
            ORDER BY period_start DESC
            LIMIT $2
            "#
        );
        let snapshots = sqlx::query_as::<_, FinancialSnapshot>(&query)
            .bind(period_type.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(snapshots)
    }

    async fn upsert_snapshot(&self, period_type: PeriodType, m: &FinancialMetrics) -> BillingResult<FinancialSnapshot> {
        let query = format!(
            r#"
            INSERT INTO financial_period_snapshots (
                period_type, period_start, period_end,
                subscription_revenue, overage_revenue, credit_revenue, total_revenue,
                estimated_cost, actual_cost, effective_cost, gross_profit, gross_margin,
                active_subscribers, new_subscribers, churned_subscribers, churn_rate,
                mrr, arr, arpu, ltv, generation_count, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, NOW())
            ON CONFLICT (period_type, period_start) DO UPDATE SET
                period_end = EXCLUDED.period_end,
                subscription_revenue = EXCLUDED.subscription_revenue,
                overage_revenue = EXCLUDED.overage_revenue,
                credit_revenue = EXCLUDED.credit_revenue,
                total_revenue = EXCLUDED.total_revenue,
                estimated_cost = EXCLUDED.estimated_cost,
                actual_cost = EXCLUDED.actual_cost,
                effective_cost = EXCLUDED.effective_cost,
                gross_profit = EXCLUDED.gross_profit,
                gross_margin = EXCLUDED.gross_margin,
                active_subscribers = EXCLUDED.active_subscribers,
                new_subscribers = EXCLUDED.new_subscribers,
                churned_subscribers = EXCLUDED.churned_subscribers,
                churn_rate = EXCLUDED.churn_rate,
                mrr = EXCLUDED.mrr,
                arr = EXCLUDED.arr,
                arpu = EXCLUDED.arpu,
                ltv = EXCLUDED.ltv,
                generation_count = EXCLUDED.generation_count,
                computed_at = NOW()
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        );

        let snapshot = sqlx::query_as::<_, FinancialSnapshot>(&query)
            .bind(period_type.to_string())
            .bind(m.period_start)
            .bind(m.period_end)
            .bind(m.revenue.subscription)
            .bind(m.revenue.overage)
            .bind(m.revenue.credit)
            .bind(m.revenue.total)
            .bind(m.costs.estimated)
            .bind(m.costs.actual)
            .bind(m.costs.effective)
            .bind(m.gross_profit)
            .bind(m.gross_margin)
            .bind(m.subscribers.active)
            .bind(m.subscribers.new)
            .bind(m.subscribers.churned)
            .bind(m.subscribers.churn_rate)
            .bind(m.mrr)
            .bind(m.arr)
            .bind(m.arpu)
            .bind(m.ltv)
            .bind(m.costs.generation_count)
            .fetch_one(&self.pool)
            .await?;

        Ok(snapshot)
    }
}
