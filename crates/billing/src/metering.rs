//! Metered generation flow
//!
//! Wraps one generation in the user's critical section: quota check, the
//! external generation itself, then cost estimation and the usage/credit
//! writes in a single transaction. Nothing is written unless the generation
//! succeeded.
//!
//! The quota is checked again under the transaction's advisory lock, since
//! other writers (admin debits, other processes) only take that lock. A
//! generation whose entitlement vanished in the meantime is kept as an
//! unbilled row so the platform cost stays visible, and the caller gets the
//! denial.

use std::future::Future;

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::locks::{lock_user_in_tx, UserLocks};
use crate::pricing::{CostEstimator, GenerationShape};
use crate::quota::{QuotaDecision, QuotaEnforcer, QuotaPolicy};
use crate::usage::UsageLedger;

/// A generation the caller wants to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub user_id: Uuid,
    pub model: String,
    #[serde(default)]
    pub shape: GenerationShape,
    /// The user supplied their own provider credential
    #[serde(default)]
    pub used_own_key: bool,
}

/// What the generation adapter reports on success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// Provider job id, absent for untracked runs
    pub external_job_id: Option<String>,
    pub outputs: Vec<String>,
    pub compute_duration_seconds: Option<f64>,
}

/// A generation that ran and was billed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteredGeneration {
    pub generation_id: Uuid,
    pub estimated_cost: f64,
    pub credit_used: bool,
    pub outcome: GenerationOutcome,
}

/// Result of [`GenerationMeter::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MeteredOutcome {
    Denied { decision: QuotaDecision },
    Completed { generation: MeteredGeneration },
}

/// Orchestrates quota, generation and recording for one user request
#[derive(Clone)]
pub struct GenerationMeter {
    pool: PgPool,
    estimator: CostEstimator,
    locks: UserLocks,
    policy: QuotaPolicy,
}

impl GenerationMeter {
    pub fn new(pool: PgPool, policy: QuotaPolicy) -> Self {
        Self {
            pool,
            estimator: CostEstimator::new(),
            locks: UserLocks::new(),
            policy,
        }
    }

    /// Run `generate` if the user's quota allows it and bill the result.
    ///
    /// Requests from the same user are serialized from the quota check until
    /// the usage writes commit. A failing `generate` leaves no trace in the
    /// ledgers. If the quota no longer allows the request once the result is
    /// ready, the generation is stored unbilled and `Denied` is returned.
    pub async fn run<F, Fut, E>(&self, request: &GenerationRequest, generate: F) -> BillingResult<MeteredOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GenerationOutcome, E>>,
        E: std::fmt::Display,
    {
        let _guard = self.locks.acquire(request.user_id).await;

        let decision = {
            let mut conn = self.pool.acquire().await?;
            QuotaEnforcer::can_generate_in(&mut conn, request.user_id, OffsetDateTime::now_utc(), self.policy)
                .await?
        };

        if !decision.allowed {
            tracing::info!(
                user_id = %request.user_id,
                model = %request.model,
                reason = ?decision.denial,
                "Generation blocked by quota"
            );
            return Ok(MeteredOutcome::Denied { decision });
        }

        let outcome = generate().await.map_err(|e| {
            tracing::warn!(
                user_id = %request.user_id,
                model = %request.model,
                error = %e,
                "Generation failed, nothing billed"
            );
            BillingError::GenerationFailed(e.to_string())
        })?;

        let estimated_cost = self.estimator.estimate(&request.model, &request.shape);

        let mut tx = self.pool.begin().await?;
        lock_user_in_tx(&mut tx, request.user_id).await?;

        let recheck = QuotaEnforcer::can_generate_in(
            &mut tx,
            request.user_id,
            OffsetDateTime::now_utc(),
            self.policy,
        )
        .await?;

        if !recheck.allowed {
            return Self::record_unbilled(tx, request, &outcome, estimated_cost, recheck).await;
        }

        let generation_id =
            Self::insert_generation(&mut tx, request, &outcome, estimated_cost, true).await?;

        let credit_used = if recheck.credit_required {
            let reason = format!("generation {}", generation_id);
            if !CreditLedger::deduct_credit_in_tx(&mut tx, request.user_id, &reason).await? {
                // Balance hit zero between the recheck and the debit
                tx.rollback().await?;
                let tx = self.pool.begin().await?;
                return Self::record_unbilled(tx, request, &outcome, estimated_cost, recheck.without_credits())
                    .await;
            }
            sqlx::query("UPDATE generations SET credit_used = TRUE WHERE id = $1")
                .bind(generation_id)
                .execute(&mut *tx)
                .await?;
            true
        } else {
            false
        };

        UsageLedger::record_usage_in(
            &mut tx,
            request.user_id,
            estimated_cost,
            request.used_own_key,
            OffsetDateTime::now_utc(),
        )
        .await?;
        UsageLedger::record_daily_usage_in(&mut tx, request.user_id, OffsetDateTime::now_utc()).await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %request.user_id,
            generation_id = %generation_id,
            model = %request.model,
            estimated_cost = estimated_cost,
            credit_used = credit_used,
            "Generation metered"
        );

        Ok(MeteredOutcome::Completed {
            generation: MeteredGeneration {
                generation_id,
                estimated_cost,
                credit_used,
                outcome,
            },
        })
    }

    /// Keep the generation and its platform cost, but charge nothing
    async fn record_unbilled(
        mut tx: sqlx::Transaction<'static, sqlx::Postgres>,
        request: &GenerationRequest,
        outcome: &GenerationOutcome,
        estimated_cost: f64,
        decision: QuotaDecision,
    ) -> BillingResult<MeteredOutcome> {
        lock_user_in_tx(&mut tx, request.user_id).await?;
        let generation_id =
            Self::insert_generation(&mut tx, request, outcome, estimated_cost, false).await?;
        tx.commit().await?;

        tracing::warn!(
            user_id = %request.user_id,
            generation_id = %generation_id,
            model = %request.model,
            reason = ?decision.denial,
            "Quota spent while generating, result recorded unbilled"
        );

        Ok(MeteredOutcome::Denied { decision })
    }

    async fn insert_generation(
        conn: &mut PgConnection,
        request: &GenerationRequest,
        outcome: &GenerationOutcome,
        estimated_cost: f64,
        billed: bool,
    ) -> BillingResult<Uuid> {
        let (generation_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO generations (
                user_id, model, external_job_id, output_count, estimated_cost, used_own_key, billed
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(request.user_id)
        .bind(&request.model)
        .bind(&outcome.external_job_id)
        .bind(request.shape.outputs() as i32)
        .bind(estimated_cost)
        .bind(request.used_own_key)
        .bind(billed)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO platform_costs (generation_id, user_id, model, estimated_cost)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(generation_id)
        .bind(request.user_id)
        .bind(&request.model)
        .bind(estimated_cost)
        .execute(conn)
        .await?;

        Ok(generation_id)
    }
}
