//! Subscription management
//!
//! Owns the "at most one open subscription per user" rule. The rule is
//! enforced by a partial unique index on `user_subscriptions (user_id) WHERE
//! ends_at IS NULL`; every writer here closes the user's other open rows and
//! writes the new one inside one transaction holding the user's advisory lock.

use pixmeter_shared::{CreditType, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::locks::lock_user_in_tx;
use crate::revenue::RevenueLedger;

/// Plan definition
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionProduct {
    pub id: Uuid,
    pub name: String,
    /// `None` means unlimited
    pub monthly_image_limit: Option<i32>,
    /// USD; `None` means unlimited
    pub monthly_cost_limit: Option<f64>,
    pub daily_image_limit: Option<i32>,
    pub bonus_credits: i32,
    pub price_cents: i64,
    pub stripe_price_id: Option<String>,
    pub overage_unit_price: Option<f64>,
    pub is_active: bool,
}

/// A time-boxed grant of a product to a user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

/// Open subscription joined with its plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub subscription: UserSubscription,
    pub product: SubscriptionProduct,
}

/// Provider-driven subscription state
#[derive(Debug, Clone)]
pub struct ProviderSubscriptionUpdate {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub external_ref: String,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, product_id, status, starts_at, ends_at, \
     stripe_subscription_id, current_period_start, current_period_end";

const PRODUCT_COLUMNS: &str = "id, name, monthly_image_limit, monthly_cost_limit, \
     daily_image_limit, bonus_credits, price_cents, stripe_price_id, overage_unit_price, is_active";

/// Subscription service
#[derive(Clone)]
pub struct SubscriptionManager {
    pool: PgPool,
    default_plan_name: String,
}

impl SubscriptionManager {
    pub fn new(pool: PgPool, default_plan_name: impl Into<String>) -> Self {
        Self {
            pool,
            default_plan_name: default_plan_name.into(),
        }
    }

    /// Replace the user's open subscription with a new one on `product_id`.
    ///
    /// Closes every open row (ends_at = now) and inserts the new row in the
    /// same transaction. Grants the plan's bonus credits, if any. A paid plan
    /// after churn stamps the user's reactivation.
    pub async fn assign_subscription(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> BillingResult<UserSubscription> {
        let mut tx = self.pool.begin().await?;

        let product = Self::product_in(&mut tx, product_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| BillingError::ProductNotFound(product_id.to_string()))?;

        lock_user_in_tx(&mut tx, user_id).await?;

        let closed = Self::close_open_in_tx(&mut tx, user_id, None).await?;

        let subscription = sqlx::query_as::<_, UserSubscription>(&format!(
            r#"
            INSERT INTO user_subscriptions (user_id, product_id, status, starts_at)
            VALUES ($1, $2, 'active', NOW())
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(product_id)
        .fetch_one(&mut *tx)
        .await?;

        if product.bonus_credits > 0 {
            CreditLedger::insert_entry(
                &mut tx,
                user_id,
                CreditType::Bonus,
                product.bonus_credits,
                "welcome bonus",
            )
            .await?;
        }

        if product.price_cents > 0 {
            RevenueLedger::mark_reactivated_in(&mut tx, user_id, subscription.starts_at).await?;
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            product = %product.name,
            subscription_id = %subscription.id,
            closed_previous = closed,
            bonus_credits = product.bonus_credits,
            "Subscription assigned"
        );

        Ok(subscription)
    }

    /// Assign the configured zero-cost plan. No-op when it is missing or inactive.
    pub async fn assign_default_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<UserSubscription>> {
        let product = match self.product_by_name(&self.default_plan_name).await? {
            Some(p) if p.is_active => p,
            _ => {
                tracing::warn!(
                    user_id = %user_id,
                    plan = %self.default_plan_name,
                    "Default plan missing or inactive, no subscription assigned"
                );
                return Ok(None);
            }
        };

        self.assign_subscription(user_id, product.id).await.map(Some)
    }

    /// Apply subscription state reported by the payment provider.
    ///
    /// Upserts by external reference. When the row will be open, any other
    /// open row for the user is closed first and this row's `ends_at` is
    /// cleared, so it is the user's one open subscription afterwards. Canceled
    /// rows are never reopened, so a late `updated` event cannot resurrect a
    /// deleted subscription.
    pub async fn update_user_subscription(
        &self,
        update: &ProviderSubscriptionUpdate,
    ) -> BillingResult<UserSubscription> {
        let mut tx = self.pool.begin().await?;
        lock_user_in_tx(&mut tx, update.user_id).await?;

        let existing = sqlx::query_as::<_, UserSubscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions \
             WHERE stripe_subscription_id = $1 FOR UPDATE"
        ))
        .bind(&update.external_ref)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = existing {
            if existing.status == SubscriptionStatus::Canceled {
                tracing::info!(
                    user_id = %update.user_id,
                    external_ref = %update.external_ref,
                    incoming_status = %update.status,
                    "Ignoring update for already canceled subscription"
                );
                tx.rollback().await?;
                return Ok(existing);
            }
        }

        let is_canceled = !update.status.grants_access();
        if !is_canceled {
            let closed =
                Self::close_open_in_tx(&mut tx, update.user_id, Some(&update.external_ref)).await?;
            if closed > 0 {
                tracing::info!(
                    user_id = %update.user_id,
                    external_ref = %update.external_ref,
                    closed = closed,
                    "Closed other open subscriptions for provider subscription"
                );
            }
        }

        let subscription = sqlx::query_as::<_, UserSubscription>(&format!(
            r#"
            INSERT INTO user_subscriptions (
                user_id, product_id, status, starts_at, ends_at,
                stripe_subscription_id, current_period_start, current_period_end
            ) VALUES (
                $1, $2, $3, COALESCE($5, NOW()), CASE WHEN $7 THEN NOW() ELSE NULL END,
                $4, $5, $6
            )
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                ends_at = CASE WHEN $7 THEN COALESCE(user_subscriptions.ends_at, NOW())
                               ELSE NULL END,
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(update.user_id)
        .bind(update.product_id)
        .bind(update.status)
        .bind(&update.external_ref)
        .bind(update.period_start)
        .bind(update.period_end)
        .bind(is_canceled)
        .fetch_one(&mut *tx)
        .await?;

        if !is_canceled {
            let reactivated =
                RevenueLedger::mark_reactivated_in(&mut tx, update.user_id, subscription.starts_at).await?;
            if reactivated {
                tracing::info!(
                    user_id = %update.user_id,
                    external_ref = %update.external_ref,
                    "User reactivated after churn"
                );
            }
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %update.user_id,
            subscription_id = %subscription.id,
            external_ref = %update.external_ref,
            status = %update.status,
            "Provider subscription synced"
        );

        Ok(subscription)
    }

    /// Mark the subscription with this external reference canceled.
    ///
    /// `ended_at` is clamped to now so no row ends in the future. Returns the
    /// owning user, or `None` when no row matches.
    pub async fn cancel_by_external_ref(
        &self,
        external_ref: &str,
        ended_at: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE user_subscriptions
            SET status = 'canceled',
                ends_at = COALESCE(ends_at, LEAST($2, NOW())),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(external_ref)
        .bind(ended_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id,)| user_id))
    }

    /// Move the user's open subscription to `past_due`. Returns whether a row changed.
    pub async fn mark_past_due(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE user_id = $1
              AND ends_at IS NULL
              AND status <> 'canceled'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The user's open, non-canceled subscription with its plan
    pub async fn active_subscription(&self, user_id: Uuid) -> BillingResult<Option<ActiveSubscription>> {
        let mut conn = self.pool.acquire().await?;
        Self::active_subscription_in(&mut conn, user_id).await
    }

    pub async fn product_by_price_id(&self, price_id: &str) -> BillingResult<Option<SubscriptionProduct>> {
        let product = sqlx::query_as::<_, SubscriptionProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM subscription_products WHERE stripe_price_id = $1"
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    pub async fn product_by_name(&self, name: &str) -> BillingResult<Option<SubscriptionProduct>> {
        let product = sqlx::query_as::<_, SubscriptionProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM subscription_products WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    /// Active plans ordered by price
    pub async fn list_products(&self) -> BillingResult<Vec<SubscriptionProduct>> {
        let products = sqlx::query_as::<_, SubscriptionProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM subscription_products WHERE is_active ORDER BY price_cents, name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    pub(crate) async fn active_subscription_in(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> BillingResult<Option<ActiveSubscription>> {
        let subscription = sqlx::query_as::<_, UserSubscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM user_subscriptions
            WHERE user_id = $1
              AND ends_at IS NULL
              AND status <> 'canceled'
            ORDER BY starts_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(subscription) = subscription else {
            return Ok(None);
        };

        let product = Self::product_in(conn, subscription.product_id)
            .await?
            .ok_or_else(|| BillingError::ProductNotFound(subscription.product_id.to_string()))?;

        Ok(Some(ActiveSubscription {
            subscription,
            product,
        }))
    }

    async fn product_in(
        conn: &mut PgConnection,
        product_id: Uuid,
    ) -> BillingResult<Option<SubscriptionProduct>> {
        let product = sqlx::query_as::<_, SubscriptionProduct>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM subscription_products WHERE id = $1"
        ))
        .bind(product_id)
        .fetch_optional(conn)
        .await?;

        Ok(product)
    }

    /// Close every open row for the user, optionally sparing one external reference.
    ///
    /// "Open" is `ends_at IS NULL`, the same predicate as the unique index.
    async fn close_open_in_tx(
        conn: &mut PgConnection,
        user_id: Uuid,
        keep_external_ref: Option<&str>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET ends_at = NOW(), updated_at = NOW()
            WHERE user_id = $1
              AND ends_at IS NULL
              AND ($2::VARCHAR IS NULL OR stripe_subscription_id IS DISTINCT FROM $2)
            "#,
        )
        .bind(user_id)
        .bind(keep_external_ref)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }
}
