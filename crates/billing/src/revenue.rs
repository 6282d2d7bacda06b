//! Payments, revenue events and per-user payment metrics
//!
//! Rows here are written by the billing event processor inside its own
//! transactions; the read side is used by reporting and the admin API.
//! All amounts are integer cents in the provider's currency.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use pixmeter_shared::{PaymentStatus, RevenueEventType};

use crate::error::BillingResult;

/// A recorded payment attempt
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: PaymentStatus,
    pub payment_type: String,
    pub amount_cents: i64,
    pub currency: String,
    pub stripe_invoice_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub attempt: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Lifetime payment totals for one user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserMetrics {
    pub user_id: Uuid,
    pub total_paid_cents: i64,
    pub payment_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_payment_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub churned_at: Option<OffsetDateTime>,
    /// Set when a paid subscription starts after `churned_at`
    #[serde(with = "time::serde::rfc3339::option")]
    pub reactivated_at: Option<OffsetDateTime>,
}

/// Payment details taken from a provider invoice
#[derive(Debug, Clone)]
pub struct InvoicePayment {
    pub user_id: Uuid,
    pub payment_type: RevenueEventType,
    pub amount_cents: i64,
    pub currency: String,
    pub stripe_invoice_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub attempt: i32,
}

/// Builder for revenue event rows
#[derive(Debug, Clone)]
pub struct RevenueEventBuilder {
    user_id: Uuid,
    event_type: RevenueEventType,
    amount_cents: i64,
    payment_id: Option<Uuid>,
    generation_id: Option<Uuid>,
    billing_period: Option<String>,
    stripe_invoice_id: Option<String>,
}

impl RevenueEventBuilder {
    pub fn new(user_id: Uuid, event_type: RevenueEventType, amount_cents: i64) -> Self {
        Self {
            user_id,
            event_type,
            amount_cents,
            payment_id: None,
            generation_id: None,
            billing_period: None,
            stripe_invoice_id: None,
        }
    }

    pub fn payment(mut self, payment_id: Uuid) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    pub fn generation(mut self, generation_id: Uuid) -> Self {
        self.generation_id = Some(generation_id);
        self
    }

    /// `YYYY-MM` period the revenue belongs to
    pub fn billing_period(mut self, period: impl Into<String>) -> Self {
        self.billing_period = Some(period.into());
        self
    }

    pub fn stripe_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.stripe_invoice_id = Some(invoice_id.into());
        self
    }

    /// Insert the event. Returns `None` when an event for the same invoice
    /// already exists.
    pub(crate) async fn insert_in(self, conn: &mut PgConnection) -> BillingResult<Option<Uuid>> {
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO revenue_events (
                user_id, event_type, amount_cents, payment_id,
                generation_id, billing_period, stripe_invoice_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_invoice_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(self.user_id)
        .bind(self.event_type)
        .bind(self.amount_cents)
        .bind(self.payment_id)
        .bind(self.generation_id)
        .bind(&self.billing_period)
        .bind(&self.stripe_invoice_id)
        .fetch_optional(conn)
        .await?;

        Ok(id.map(|(id,)| id))
    }
}

/// Read access to payments and revenue, plus the transactional writers
#[derive(Clone)]
pub struct RevenueLedger {
    pool: PgPool,
}

impl RevenueLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recent payments for a user, newest first
    pub async fn payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, user_id, status, payment_type, amount_cents, currency,
                   stripe_invoice_id, stripe_payment_intent_id, attempt, created_at
            FROM payments
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    pub async fn user_metrics(&self, user_id: Uuid) -> BillingResult<Option<UserMetrics>> {
        let metrics = sqlx::query_as::<_, UserMetrics>(
            r#"
            SELECT user_id, total_paid_cents, payment_count,
                   first_payment_at, last_payment_at, churned_at, reactivated_at
            FROM user_metrics
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metrics)
    }

    /// Insert a succeeded payment. Returns `None` when this invoice was
    /// already recorded as paid.
    pub(crate) async fn record_succeeded_in(
        conn: &mut PgConnection,
        payment: &InvoicePayment,
    ) -> BillingResult<Option<Uuid>> {
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payments (
                user_id, status, payment_type, amount_cents, currency,
                stripe_invoice_id, stripe_payment_intent_id, attempt
            )
            VALUES ($1, 'succeeded', $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_invoice_id) WHERE status = 'succeeded' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(payment.user_id)
        .bind(payment.payment_type.to_string())
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(&payment.stripe_invoice_id)
        .bind(&payment.stripe_payment_intent_id)
        .bind(payment.attempt)
        .fetch_optional(conn)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    /// Insert a failed attempt. Redelivery of the same attempt is a no-op.
    pub(crate) async fn record_failed_in(
        conn: &mut PgConnection,
        payment: &InvoicePayment,
    ) -> BillingResult<Option<Uuid>> {
        let id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payments (
                user_id, status, payment_type, amount_cents, currency,
                stripe_invoice_id, stripe_payment_intent_id, attempt
            )
            VALUES ($1, 'failed', $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_invoice_id, attempt) WHERE status = 'failed' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(payment.user_id)
        .bind(payment.payment_type.to_string())
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(&payment.stripe_invoice_id)
        .bind(&payment.stripe_payment_intent_id)
        .bind(payment.attempt)
        .fetch_optional(conn)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    /// Add one payment to the user's lifetime totals. Churn history is left alone.
    pub(crate) async fn bump_metrics_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        amount_cents: i64,
        paid_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_metrics (
                user_id, total_paid_cents, payment_count, first_payment_at, last_payment_at
            )
            VALUES ($1, $2, 1, $3, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                total_paid_cents = user_metrics.total_paid_cents + EXCLUDED.total_paid_cents,
                payment_count = user_metrics.payment_count + 1,
                first_payment_at = COALESCE(user_metrics.first_payment_at, EXCLUDED.first_payment_at),
                last_payment_at = GREATEST(user_metrics.last_payment_at, EXCLUDED.last_payment_at),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(amount_cents)
        .bind(paid_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn mark_churned_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        churned_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_metrics (user_id, churned_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                churned_at = EXCLUDED.churned_at,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(churned_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Stamp a return after churn. Only a subscription starting after the
    /// recorded churn counts, and each churn is stamped once.
    pub(crate) async fn mark_reactivated_in(
        conn: &mut PgConnection,
        user_id: Uuid,
        started_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_metrics
            SET reactivated_at = $2, updated_at = NOW()
            WHERE user_id = $1
              AND churned_at IS NOT NULL
              AND churned_at <= $2
              AND (reactivated_at IS NULL OR reactivated_at < churned_at)
            "#,
        )
        .bind(user_id)
        .bind(started_at)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
