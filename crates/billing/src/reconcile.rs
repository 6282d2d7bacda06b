//! Cost reconciliation
//!
//! Replaces nothing: the provider-measured cost (compute seconds × the
//! per-second rate of the model's hardware class) is stored next to the
//! charge-time estimate on both the generation and its platform cost row.
//! Usage buckets keep the estimate, so quota accounting never changes after
//! the fact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::ReplicateConfig;
use crate::error::{BillingError, BillingResult};

/// GPU/CPU class a model runs on, with its per-second price in USD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareClass {
    Cpu,
    NvidiaT4,
    NvidiaL40s,
    NvidiaA100,
    NvidiaH100,
}

impl HardwareClass {
    pub fn rate_per_second(&self) -> f64 {
        match self {
            Self::Cpu => 0.000_100,
            Self::NvidiaT4 => 0.000_225,
            Self::NvidiaL40s => 0.000_975,
            Self::NvidiaA100 => 0.001_400,
            Self::NvidiaH100 => 0.001_525,
        }
    }

    /// Hardware a model is billed on; unknown models are assumed to run on A100s
    pub fn for_model(model: &str) -> Self {
        match model {
            "black-forest-labs/flux-schnell"
            | "black-forest-labs/flux-dev"
            | "black-forest-labs/flux-1.1-pro"
            | "black-forest-labs/flux-1.1-pro-ultra"
            | "black-forest-labs/flux-kontext-pro"
            | "black-forest-labs/flux-2-pro" => Self::NvidiaH100,
            "black-forest-labs/flux-2-dev" | "stability-ai/stable-diffusion-3.5-large" => {
                Self::NvidiaA100
            }
            "bytedance/seedream-4" | "ideogram-ai/ideogram-v3-turbo" => Self::NvidiaL40s,
            "recraft-ai/recraft-v3" => Self::NvidiaT4,
            _ => Self::NvidiaA100,
        }
    }
}

/// Duration-based actual cost in USD
pub fn actual_cost(model: &str, compute_seconds: f64) -> f64 {
    compute_seconds.max(0.0) * HardwareClass::for_model(model).rate_per_second()
}

/// Provider view of a finished (or running) job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPrediction {
    pub id: String,
    pub status: String,
    /// Billed compute time, absent until the job finishes
    pub predict_time: Option<f64>,
}

/// Source of provider-measured compute time
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn fetch_prediction(&self, external_job_id: &str) -> BillingResult<ProviderPrediction>;
}

#[derive(Debug, Deserialize)]
struct ReplicatePrediction {
    id: String,
    status: String,
    #[serde(default)]
    metrics: Option<ReplicateMetrics>,
}

#[derive(Debug, Deserialize)]
struct ReplicateMetrics {
    predict_time: Option<f64>,
}

enum FetchError {
    Transient(String),
    Permanent(BillingError),
}

/// Replicate predictions API client
#[derive(Clone)]
pub struct ReplicateClient {
    http: reqwest::Client,
    config: ReplicateConfig,
}

impl ReplicateClient {
    pub fn new(config: ReplicateConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    async fn fetch_once(&self, external_job_id: &str) -> Result<ProviderPrediction, FetchError> {
        let url = format!(
            "{}/predictions/{}",
            self.config.base_url.trim_end_matches('/'),
            external_job_id
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("provider returned {}", status)));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::Permanent(BillingError::NotFound(format!(
                "prediction {}",
                external_job_id
            ))));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(BillingError::Provider(format!(
                "provider returned {}",
                status
            ))));
        }

        let body: ReplicatePrediction = response
            .json()
            .await
            .map_err(|e| FetchError::Permanent(BillingError::Provider(e.to_string())))?;

        Ok(ProviderPrediction {
            id: body.id,
            status: body.status,
            predict_time: body.metrics.and_then(|m| m.predict_time),
        })
    }
}

#[async_trait]
impl GenerationProvider for ReplicateClient {
    async fn fetch_prediction(&self, external_job_id: &str) -> BillingResult<ProviderPrediction> {
        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(
            strategy,
            || self.fetch_once(external_job_id),
            |e: &FetchError| matches!(e, FetchError::Transient(_)),
        )
        .await
        .map_err(|e| match e {
            FetchError::Transient(msg) => BillingError::Provider(msg),
            FetchError::Permanent(err) => err,
        })
    }
}

/// A generation waiting for its actual cost
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReconcileCandidate {
    pub generation_id: Uuid,
    pub model: String,
    pub external_job_id: String,
}

/// Totals for one batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: u32,
    pub reconciled: u32,
    pub errors: u32,
}

/// Cost reconciler
#[derive(Clone)]
pub struct CostReconciler {
    pool: PgPool,
    provider: Arc<dyn GenerationProvider>,
    delay: Duration,
}

impl CostReconciler {
    pub fn new(pool: PgPool, provider: Arc<dyn GenerationProvider>, delay: Duration) -> Self {
        Self {
            pool,
            provider,
            delay,
        }
    }

    /// Reconcile one generation.
    ///
    /// Returns `false` when there is nothing to do: no provider job id, or
    /// the provider has not reported compute time yet.
    pub async fn reconcile_one(&self, generation_id: Uuid) -> BillingResult<bool> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT model, external_job_id FROM generations WHERE id = $1")
                .bind(generation_id)
                .fetch_optional(&self.pool)
                .await?;

        let (model, external_job_id) =
            row.ok_or_else(|| BillingError::NotFound(format!("generation {}", generation_id)))?;

        let Some(external_job_id) = external_job_id else {
            tracing::debug!(generation_id = %generation_id, "Generation has no provider job, skipping");
            return Ok(false);
        };

        self.reconcile_candidate(&ReconcileCandidate {
            generation_id,
            model,
            external_job_id,
        })
        .await
    }

    /// Reconcile up to `limit` unreconciled generations, newest first.
    ///
    /// Provider calls are made one at a time with a fixed pause between them.
    /// A failing item is logged and counted; it never aborts the batch.
    pub async fn reconcile_batch(&self, limit: i64) -> BillingResult<BatchResult> {
        let candidates = sqlx::query_as::<_, ReconcileCandidate>(
            r#"
            SELECT id AS generation_id, model, external_job_id
            FROM generations
            WHERE external_job_id IS NOT NULL
              AND actual_cost IS NULL
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.reconcile_candidates(&candidates).await)
    }

    /// Reconcile an explicit list of candidates with per-item failure isolation
    pub async fn reconcile_candidates(&self, candidates: &[ReconcileCandidate]) -> BatchResult {
        let mut result = BatchResult::default();

        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            result.processed += 1;
            match self.reconcile_candidate(candidate).await {
                Ok(true) => result.reconciled += 1,
                Ok(false) => {}
                Err(e) => {
                    result.errors += 1;
                    tracing::warn!(
                        generation_id = %candidate.generation_id,
                        external_job_id = %candidate.external_job_id,
                        error = %e,
                        "Failed to reconcile generation cost"
                    );
                }
            }
        }

        tracing::info!(
            processed = result.processed,
            reconciled = result.reconciled,
            errors = result.errors,
            "Cost reconciliation batch finished"
        );

        result
    }

    async fn reconcile_candidate(&self, candidate: &ReconcileCandidate) -> BillingResult<bool> {
        let prediction = self
            .provider
            .fetch_prediction(&candidate.external_job_id)
            .await?;

        let Some(seconds) = prediction.predict_time else {
            tracing::debug!(
                generation_id = %candidate.generation_id,
                provider_status = %prediction.status,
                "Provider has no compute time yet"
            );
            return Ok(false);
        };

        let cost = actual_cost(&candidate.model, seconds);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE platform_costs
            SET actual_cost = $2, compute_duration_seconds = $3, reconciled_at = NOW()
            WHERE generation_id = $1
            "#,
        )
        .bind(candidate.generation_id)
        .bind(cost)
        .bind(seconds)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE generations
            SET actual_cost = $2, compute_duration_seconds = $3, reconciled_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(candidate.generation_id)
        .bind(cost)
        .bind(seconds)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            generation_id = %candidate.generation_id,
            model = %candidate.model,
            compute_seconds = seconds,
            actual_cost = cost,
            "Generation cost reconciled"
        );

        Ok(true)
    }
}
