//! Usage and credit routes for the authenticated user

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use pixmeter_billing::{CreditEntry, MonthlyUsage, QuotaDecision};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Whether the caller may start a generation right now
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<QuotaDecision>, ApiError> {
    let decision = state.billing.quota.can_generate(auth_user.user_id).await?;
    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct CreditHistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreditHistoryResponse {
    pub balance: i64,
    pub entries: Vec<CreditEntry>,
}

pub async fn get_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<CreditHistoryQuery>,
) -> Result<Json<CreditHistoryResponse>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let balance = state.billing.credits.balance(auth_user.user_id).await?;
    let entries = state.billing.credits.history(auth_user.user_id, limit).await?;

    Ok(Json(CreditHistoryResponse { balance, entries }))
}

/// Current month's bucket
pub async fn get_monthly_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<MonthlyUsage>, ApiError> {
    let usage = state
        .billing
        .usage
        .monthly(auth_user.user_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(usage))
}
