//! Usage ledger
//!
//! Two independent additive counters per user: a monthly bucket (image count,
//! estimated cost, own-key count) and a UTC daily bucket (image count only).
//! Buckets roll over by key; nothing ever resets them.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::{Date, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::error::BillingResult;

/// Monthly bucket contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub month: String,
    pub image_count: i64,
    /// Sum of charge-time estimates in USD
    pub total_cost: f64,
    pub own_key_count: i64,
}

/// Daily bucket contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub usage_date: Date,
    pub image_count: i64,
}

/// `YYYY-MM` key of the UTC month containing `at`
pub fn month_key(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    format!("{:04}-{:02}", utc.year(), u8::from(utc.month()))
}

/// UTC calendar date containing `at`
pub fn day_key(at: OffsetDateTime) -> Date {
    at.to_offset(UtcOffset::UTC).date()
}

/// Usage ledger service
#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count one generation in the current monthly bucket
    pub async fn record_usage(&self, user_id: Uuid, cost: f64, used_own_key: bool) -> BillingResult<()> {
        self.record_usage_at(user_id, cost, used_own_key, OffsetDateTime::now_utc())
            .await
    }

    /// Count one generation in the monthly bucket containing `at`
    pub async fn record_usage_at(
        &self,
        user_id: Uuid,
        cost: f64,
        used_own_key: bool,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::record_usage_in(&mut conn, user_id, cost, used_own_key, at).await
    }

    /// Count one generation in today's UTC bucket
    pub async fn record_daily_usage(&self, user_id: Uuid) -> BillingResult<()> {
        self.record_daily_usage_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn record_daily_usage_at(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::record_daily_usage_in(&mut conn, user_id, at).await
    }

    /// Monthly bucket containing `at` (zeroes when nothing was recorded)
    pub async fn monthly(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<MonthlyUsage> {
        let mut conn = self.pool.acquire().await?;
        Self::monthly_in(&mut conn, user_id, at).await
    }

    /// Daily bucket containing `at` (zero when nothing was recorded)
    pub async fn daily(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<DailyUsage> {
        let mut conn = self.pool.acquire().await?;
        Self::daily_in(&mut conn, user_id, at).await
    }

    /// Recent monthly buckets, newest first
    pub async fn monthly_history(&self, user_id: Uuid, months: i64) -> BillingResult<Vec<MonthlyUsage>> {
        let rows: Vec<(String, i64, f64, i64)> = sqlx::query_as(
            r#"
            SELECT month, image_count, total_cost, own_key_count
            FROM usage_monthly
            WHERE user_id = $1
            ORDER BY month DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(months)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(month, image_count, total_cost, own_key_count)| MonthlyUsage {
                month,
                image_count,
                total_cost,
                own_key_count,
            })
            .collect())
    }

    pub(crate) async fn record_usage_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        cost: f64,
        used_own_key: bool,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let month = month_key(at);
        let own_key_increment: i64 = if used_own_key { 1 } else { 0 };

        sqlx::query(
            r#"
            INSERT INTO usage_monthly (user_id, month, image_count, total_cost, own_key_count)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (user_id, month) DO UPDATE SET
                image_count = usage_monthly.image_count + 1,
                total_cost = usage_monthly.total_cost + EXCLUDED.total_cost,
                own_key_count = usage_monthly.own_key_count + EXCLUDED.own_key_count,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&month)
        .bind(cost)
        .bind(own_key_increment)
        .execute(conn)
        .await?;

        tracing::debug!(
            user_id = %user_id,
            month = %month,
            cost = cost,
            used_own_key = used_own_key,
            "Monthly usage recorded"
        );

        Ok(())
    }

    pub(crate) async fn record_daily_usage_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_daily (user_id, usage_date, image_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, usage_date) DO UPDATE SET
                image_count = usage_daily.image_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(day_key(at))
        .execute(conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn monthly_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<MonthlyUsage> {
        let month = month_key(at);
        let row: Option<(i64, f64, i64)> = sqlx::query_as(
            r#"
            SELECT image_count, total_cost, own_key_count
            FROM usage_monthly
            WHERE user_id = $1 AND month = $2
            "#,
        )
        .bind(user_id)
        .bind(&month)
        .fetch_optional(conn)
        .await?;

        let (image_count, total_cost, own_key_count) = row.unwrap_or((0, 0.0, 0));
        Ok(MonthlyUsage {
            month,
            image_count,
            total_cost,
            own_key_count,
        })
    }

    pub(crate) async fn daily_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<DailyUsage> {
        let usage_date = day_key(at);
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT image_count FROM usage_daily WHERE user_id = $1 AND usage_date = $2",
        )
        .bind(user_id)
        .bind(usage_date)
        .fetch_optional(conn)
        .await?;

        Ok(DailyUsage {
            usage_date,
            image_count: row.map(|(count,)| count).unwrap_or(0),
        })
    }
}
