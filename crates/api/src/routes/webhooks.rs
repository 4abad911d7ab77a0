//! Stripe webhook endpoint
//!
//! The body must reach signature verification byte-for-byte as sent, so the
//! handler takes raw bytes rather than a typed JSON extractor. A 4xx means
//! the notification was unusable (bad signature, bad payload) and retrying
//! it unchanged will never help; a 5xx asks the sender to retry.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use shopfront_billing::WebhookAck;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("payload is not valid utf-8".to_string()))?;

    let event = state.billing.webhooks.verify_event(payload, signature)?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Processing webhook event"
    );

    let ack = state.billing.webhooks.handle_event(event).await?;
    Ok(Json(ack))
}
