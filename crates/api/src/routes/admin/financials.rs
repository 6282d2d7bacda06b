//! Operator financial reporting and billing maintenance

use axum::{
    extract::{Query, State},
    Json,
};
use pixmeter_billing::{
    AllTimeTotals, BatchResult, ChurnReport, FinancialMetrics, FinancialSnapshot,
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ModelCost, MrrPoint,
    PeriodComparison, PnlStatement, TierRevenue, TopCustomer, TrendPoint, WebhookEventRecord,
    WebhookReplayResult,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::shared::{clamp_limit, parse_date, parse_period_type, PeriodQuery, RangeQuery};
use crate::{error::ApiResult, state::AppState};

/// Longest series any trend endpoint returns
const MAX_SERIES: u32 = 36;

// ============================================================================
// Reports
// ============================================================================

pub async fn overview(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<FinancialMetrics>> {
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.metrics(start, end).await?))
}

pub async fn comparison(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<PeriodComparison>> {
    let period_type = query.period_type()?;
    let at = query.at(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.with_comparison(period_type, at).await?))
}

pub async fn revenue_by_tier(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Vec<TierRevenue>>> {
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.revenue_by_tier(start, end).await?))
}

#[derive(Debug, Deserialize)]
pub struct TopCustomersQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

pub async fn top_customers(
    State(state): State<AppState>,
    Query(query): Query<TopCustomersQuery>,
) -> ApiResult<Json<Vec<TopCustomer>>> {
    let range = RangeQuery {
        start: query.start,
        end: query.end,
    };
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    let limit = clamp_limit(query.limit, 10, 100);
    Ok(Json(state.billing.financials.top_customers(start, end, limit).await?))
}

pub async fn cost_by_model(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Vec<ModelCost>>> {
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.cost_by_model(start, end).await?))
}

pub async fn revenue_trend(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<Vec<TrendPoint>>> {
    let period_type = query.period_type()?;
    let at = query.at(OffsetDateTime::now_utc())?;
    let periods = query.periods.unwrap_or(12).clamp(1, MAX_SERIES);
    Ok(Json(
        state.billing.financials.revenue_trend(period_type, periods, at).await?,
    ))
}

pub async fn pnl(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<PnlStatement>> {
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.pnl(start, end).await?))
}

#[derive(Debug, Deserialize)]
pub struct MrrHistoryQuery {
    pub months: Option<u32>,
}

pub async fn mrr_history(
    State(state): State<AppState>,
    Query(query): Query<MrrHistoryQuery>,
) -> ApiResult<Json<Vec<MrrPoint>>> {
    let months = query.months.unwrap_or(12).clamp(1, MAX_SERIES);
    Ok(Json(
        state.billing.financials.mrr_history(months, OffsetDateTime::now_utc()).await?,
    ))
}

pub async fn churn(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<ChurnReport>> {
    let (start, end) = range.resolve(OffsetDateTime::now_utc())?;
    Ok(Json(state.billing.financials.churn_report(start, end).await?))
}

pub async fn totals(State(state): State<AppState>) -> ApiResult<Json<AllTimeTotals>> {
    Ok(Json(state.billing.financials.all_time_totals().await?))
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    /// Reconcile this generation only
    pub generation_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReconcileResponse {
    Single { generation_id: Uuid, reconciled: bool },
    Batch(BatchResult),
}

pub async fn reconcile(
    State(state): State<AppState>,
    body: Option<Json<ReconcileRequest>>,
) -> ApiResult<Json<ReconcileResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(generation_id) = request.generation_id {
        let reconciled = state.billing.reconciler.reconcile_one(generation_id).await?;
        return Ok(Json(ReconcileResponse::Single {
            generation_id,
            reconciled,
        }));
    }

    let limit = clamp_limit(request.limit, state.billing.settings.reconcile_batch_limit, 500);
    let result = state.billing.reconciler.reconcile_batch(limit).await?;
    tracing::info!(
        processed = result.processed,
        reconciled = result.reconciled,
        errors = result.errors,
        "Operator-triggered reconciliation finished"
    );
    Ok(Json(ReconcileResponse::Batch(result)))
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    pub period: Option<String>,
    /// `YYYY-MM-DD`; today (UTC) when absent
    pub date: Option<String>,
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    body: Option<Json<SnapshotRequest>>,
) -> ApiResult<Json<FinancialSnapshot>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let period_type = parse_period_type(request.period.as_deref())?;
    let date = match request.date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => OffsetDateTime::now_utc().date(),
    };

    Ok(Json(state.billing.financials.snapshot(period_type, date).await?))
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<Vec<FinancialSnapshot>>> {
    let period_type = query.period_type()?;
    let limit = clamp_limit(query.limit, 12, 120);
    Ok(Json(
        state.billing.financials.list_snapshots(period_type, limit).await?,
    ))
}

// ============================================================================
// Invariants
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InvariantsQuery {
    /// Run a single named check
    pub check: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InvariantsResponse {
    Single {
        check: String,
        healthy: bool,
        violations: Vec<InvariantViolation>,
    },
    All(InvariantCheckSummary),
}

pub async fn invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantsQuery>,
) -> ApiResult<Json<InvariantsResponse>> {
    match query.check {
        Some(check) => {
            let violations = state.billing.invariants.run_check(&check).await?;
            Ok(Json(InvariantsResponse::Single {
                check,
                healthy: violations.is_empty(),
                violations,
            }))
        }
        None => Ok(Json(InvariantsResponse::All(
            state.billing.invariants.run_all_checks().await?,
        ))),
    }
}

/// Names accepted by `?check=`
pub async fn invariant_names() -> Json<&'static [&'static str]> {
    Json(InvariantChecker::available_checks())
}

// ============================================================================
// Webhook journal
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailedWebhooksQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<FailedWebhooksQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let limit = clamp_limit(query.limit, 50, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    Ok(Json(state.billing.webhooks.list_failed(limit, offset).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    /// Replay one event; otherwise replay failed events oldest first
    pub event_id: Option<String>,
    pub max_events: Option<i64>,
}

pub async fn replay_webhooks(
    State(state): State<AppState>,
    body: Option<Json<ReplayRequest>>,
) -> ApiResult<Json<Vec<WebhookReplayResult>>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let results = match request.event_id {
        Some(event_id) => vec![state.billing.webhooks.replay(&event_id).await?],
        None => {
            let max_events = clamp_limit(request.max_events, 25, 100);
            state.billing.webhooks.replay_all_failed(max_events).await?
        }
    };

    tracing::info!(
        replayed = results.len(),
        succeeded = results.iter().filter(|r| r.success).count(),
        "Operator webhook replay finished"
    );
    Ok(Json(results))
}
