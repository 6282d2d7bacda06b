//! Stripe webhook ingestion and plan catalogue

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use pixmeter_billing::{BillingError, SubscriptionProduct, WebhookOutcome};
use serde::Serialize;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Handle Stripe webhook events.
///
/// Answers 400 only when the signature or envelope is bad. Once verified,
/// the event is acknowledged whatever the handler outcome; failures stay
/// on the journal row for replay.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| match e {
            BillingError::WebhookPayloadInvalid(detail) => {
                tracing::warn!(error = %detail, "Signed Stripe webhook has an unreadable payload");
                ApiError::BadRequest("Invalid webhook payload".to_string())
            }
            other => {
                tracing::warn!(error = ?other, "Stripe webhook signature verification failed");
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
        })?;

    match state.billing.webhooks.process(&event).await {
        WebhookOutcome::Processed | WebhookOutcome::Duplicate => {}
        WebhookOutcome::Failed(error) => {
            tracing::error!(
                event_id = %event.envelope.id,
                event_type = %event.envelope.event_type,
                error = %error,
                "Stripe webhook acknowledged with handler failure"
            );
        }
        WebhookOutcome::TimedOut => {
            tracing::error!(
                event_id = %event.envelope.id,
                event_type = %event.envelope.event_type,
                "Stripe webhook acknowledged after handler timeout"
            );
        }
    }

    Ok(Json(WebhookAck { received: true }))
}

/// Active plans
pub async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<SubscriptionProduct>>, ApiError> {
    let products = state.billing.subscriptions.list_products().await?;
    Ok(Json(products))
}
