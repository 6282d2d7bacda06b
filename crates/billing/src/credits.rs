//! Credit ledger
//!
//! Append-only signed entries; the balance is always `SUM(amount)` and is
//! never stored. Credits let a user go past count-based plan limits.

use pixmeter_shared::CreditType;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::locks::lock_user_in_tx;

/// One ledger row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub entry_type: CreditType,
    pub amount: i32,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Credit ledger service
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry. Negative amounts are operator deductions.
    pub async fn add_credits(
        &self,
        user_id: Uuid,
        entry_type: CreditType,
        amount: i32,
        reason: &str,
    ) -> BillingResult<Uuid> {
        if amount == 0 {
            return Err(BillingError::InvalidInput(
                "Credit amount must be non-zero".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        let id = Self::insert_entry(&mut conn, user_id, entry_type, amount, reason).await?;

        tracing::info!(
            user_id = %user_id,
            entry_type = %entry_type,
            amount = amount,
            reason = %reason,
            "Credit entry recorded"
        );

        Ok(id)
    }

    /// Debit one credit if the balance allows it.
    ///
    /// Returns `false` (and writes nothing) when the balance is zero or negative.
    pub async fn deduct_credit(&self, user_id: Uuid, reason: &str) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deducted = Self::deduct_credit_in_tx(&mut *tx, user_id, reason).await?;
        tx.commit().await?;
        Ok(deducted)
    }

    /// Current balance, 0 for users with no entries
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::balance_in(&mut conn, user_id).await
    }

    /// Most recent entries first
    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<CreditEntry>> {
        let entries = sqlx::query_as::<_, CreditEntry>(
            r#"
            SELECT id, user_id, entry_type, amount, reason, created_at
            FROM credit_entries
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Balance-checked debit inside a caller-owned transaction.
    ///
    /// Takes the user's advisory lock so two debits cannot both spend the last credit.
    pub(crate) async fn deduct_credit_in_tx(
        conn: &mut PgConnection,
        user_id: Uuid,
        reason: &str,
    ) -> BillingResult<bool> {
        lock_user_in_tx(conn, user_id).await?;

        let balance = Self::balance_in(conn, user_id).await?;
        if balance <= 0 {
            tracing::debug!(user_id = %user_id, balance = balance, "No credit to deduct");
            return Ok(false);
        }

        Self::insert_entry(conn, user_id, CreditType::Used, -1, reason).await?;

        tracing::info!(
            user_id = %user_id,
            remaining = balance - 1,
            reason = %reason,
            "Credit deducted"
        );

        Ok(true)
    }

    pub(crate) async fn balance_in(conn: &mut PgConnection, user_id: Uuid) -> BillingResult<i64> {
        let (balance,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_entries WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(conn)
        .await?;

        Ok(balance)
    }

    pub(crate) async fn insert_entry(
        conn: &mut PgConnection,
        user_id: Uuid,
        entry_type: CreditType,
        amount: i32,
        reason: &str,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO credit_entries (user_id, entry_type, amount, reason)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(entry_type)
        .bind(amount)
        .bind(reason)
        .fetch_one(conn)
        .await?;

        Ok(id)
    }
}
